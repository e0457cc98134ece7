use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use thiserror::Error;

use crate::object::{Method, Object};
use crate::script::{LocalVariables, Script, ScriptImage};
use crate::selector::SelectorTable;
use crate::value::{Reg, SegmentId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("script {0} does not exist")]
    NotFound(u16),
    #[error("script {script} is malformed: {reason}")]
    Malformed { script: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("invalid segment reference {0}")]
    InvalidReference(Reg),
    #[error("{0} is not an object")]
    NotAnObject(Reg),
    #[error("class {0} does not exist")]
    InvalidClass(u16),
    #[error("script {0} is not loaded")]
    ScriptNotLoaded(u16),
    #[error("segment table is full")]
    OutOfSegments,
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// How `lofsa`/`lofss` operands turn into script offsets.
///
/// Scripts from different eras encode literal addresses differently; the
/// loader picks the mode, or overrides [`ScriptLoader::resolve_literal`]
/// entirely for formats that need relocation data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LofsMode {
    /// Relative to the instruction that follows.
    #[default]
    PcRelative,
    /// The operand is the offset.
    Absolute,
    /// The operand is an offset into the heap part, which follows the
    /// script body.
    AfterScriptBody,
}

impl LofsMode {
    /// `next_pc` is the offset right after the `lofs*` instruction.
    pub fn resolve(self, script_size: u32, next_pc: u32, operand: i32) -> u32 {
        match self {
            LofsMode::PcRelative => next_pc.wrapping_add_signed(operand) & 0xffff,
            LofsMode::Absolute => operand as u16 as u32,
            LofsMode::AfterScriptBody => script_size + operand as u16 as u32,
        }
    }
}

/// The resource collaborator: delivers parsed scripts and class ownership.
pub trait ScriptLoader {
    fn load_script(&mut self, number: u16) -> Result<ScriptImage, LoadError>;

    /// Number of the script defining class `class`.
    fn class_script(&self, class: u16) -> Option<u16>;

    fn lofs_mode(&self) -> LofsMode {
        LofsMode::PcRelative
    }

    fn resolve_literal(&self, script: &Script, next_pc: u32, operand: i32) -> u32 {
        self.lofs_mode().resolve(script.size() as u32, next_pc, operand)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicKind {
    Raw,
    List,
    Node,
}

/// Host-allocated memory block (strings, arrays, kernel lists).
#[derive(Debug, Clone)]
pub struct DynamicMemory {
    pub kind: DynamicKind,
    pub description: String,
    pub data: Vec<u8>,
}

/// Objects created at run time by cloning.
#[derive(Debug, Clone, Default)]
pub struct CloneTable {
    entries: Vec<Option<Object>>,
}

impl CloneTable {
    fn insert(&mut self, object: Object) -> u32 {
        if let Some(i) = self.entries.iter().position(Option::is_none) {
            self.entries[i] = Some(object);
            return i as u32;
        }
        self.entries.push(Some(object));
        (self.entries.len() - 1) as u32
    }

    pub fn get(&self, index: u32) -> Option<&Object> {
        self.entries.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Object> {
        self.entries.get_mut(index as usize)?.as_mut()
    }

    fn remove(&mut self, index: u32) -> Option<Object> {
        self.entries.get_mut(index as usize)?.take()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum Segment {
    Script(Script),
    Locals(LocalVariables),
    /// The VM owns the stack slots; the segment only reserves the id.
    Stack { size: usize },
    Clones(CloneTable),
    Dynamic(DynamicMemory),
}

/// What a register points at, as seen by kernel signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegType {
    Null,
    Integer,
    Object,
    Reference,
    List,
    Node,
    Uninitialized,
    /// A pointer to a segment or offset that does not exist.
    Invalid,
}

/// Arena of all segments.
///
/// Segment ids are never reused, so a reference into an unloaded script
/// stays invalid instead of aliasing a newer segment.
pub struct SegmentManager {
    segments: Vec<Option<Segment>>,
    scripts: HashMap<u16, SegmentId>,
    classes: HashMap<u16, Reg>,
    clones: Option<SegmentId>,
    loader: Box<dyn ScriptLoader>,
    selectors: SelectorTable,
}

impl SegmentManager {
    pub fn new(loader: Box<dyn ScriptLoader>, selectors: SelectorTable) -> Self {
        Self {
            // id 0 is "not a pointer"
            segments: vec![None],
            scripts: HashMap::new(),
            classes: HashMap::new(),
            clones: None,
            loader,
            selectors,
        }
    }

    pub fn selectors(&self) -> &SelectorTable {
        &self.selectors
    }

    pub fn loader(&self) -> &dyn ScriptLoader {
        self.loader.as_ref()
    }

    fn allocate(&mut self, segment: Segment) -> Result<SegmentId, SegmentError> {
        let id = self.segments.len();
        if id >= SegmentId::UNINITIALIZED.0 as usize {
            return Err(SegmentError::OutOfSegments);
        }
        self.segments.push(Some(segment));
        Ok(SegmentId(id as u16))
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0 as usize)?.as_ref()
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn is_valid(&self, id: SegmentId) -> bool {
        self.segment(id).is_some()
    }

    pub fn allocate_stack(&mut self, size: usize) -> Result<SegmentId, SegmentError> {
        self.allocate(Segment::Stack { size })
    }

    // ── scripts ────────────────────────────────────────────────────

    pub fn script(&self, id: SegmentId) -> Option<&Script> {
        match self.segment(id)? {
            Segment::Script(s) => Some(s),
            _ => None,
        }
    }

    pub fn script_mut(&mut self, id: SegmentId) -> Option<&mut Script> {
        match self.segment_mut(id)? {
            Segment::Script(s) => Some(s),
            _ => None,
        }
    }

    pub fn script_segment(&self, number: u16) -> Option<SegmentId> {
        self.scripts.get(&number).copied()
    }

    pub fn locals(&self, id: SegmentId) -> Option<&LocalVariables> {
        match self.segment(id)? {
            Segment::Locals(l) => Some(l),
            _ => None,
        }
    }

    pub fn locals_mut(&mut self, id: SegmentId) -> Option<&mut LocalVariables> {
        match self.segment_mut(id)? {
            Segment::Locals(l) => Some(l),
            _ => None,
        }
    }

    /// Load script `number`, or add a locker if it is already loaded.
    pub fn instantiate_script(&mut self, number: u16) -> Result<SegmentId, SegmentError> {
        if let Some(id) = self.script_segment(number) {
            if let Some(script) = self.script_mut(id) {
                script.lockers += 1;
            }
            return Ok(id);
        }

        let image = self.loader.load_script(number)?;
        let ScriptImage { bytecode, exports, locals, pointer_locals, objects } = image;
        let segment = SegmentId(self.segments.len() as u16);
        let relocate = |value: u16, pointer: bool| {
            if pointer { Reg::pointer(segment, value as u32) } else { Reg::word(value) }
        };

        let mut instances = BTreeMap::new();
        let mut defined = Vec::new();
        let mut superclasses = Vec::new();
        for image in objects {
            let properties = image
                .properties
                .iter()
                .enumerate()
                .map(|(i, &v)| relocate(v, image.pointer_properties.contains(&i)))
                .collect();
            let address = Reg::pointer(segment, image.offset);
            if let Some(class) = image.class {
                defined.push((class, address));
            }
            superclasses.push((image.offset, image.superclass));
            instances.insert(image.offset, Object {
                name: image.name,
                is_class: image.class.is_some(),
                is_clone: false,
                species: if image.class.is_some() { address } else { Reg::NULL },
                superclass: Reg::NULL,
                properties,
                property_selectors: image.property_selectors,
                methods: image
                    .methods
                    .into_iter()
                    .map(|(selector, offset)| Method { selector, offset })
                    .collect(),
                code_segment: segment,
                script: number,
            });
        }

        let script_id = self.allocate(Segment::Script(Script {
            number,
            segment,
            bytecode,
            exports,
            objects: instances,
            locals_segment: None,
            lockers: 1,
        }))?;
        debug_assert_eq!(script_id, segment);
        self.scripts.insert(number, segment);
        self.classes.extend(defined);

        if !locals.is_empty() {
            let values = locals
                .iter()
                .enumerate()
                .map(|(i, &v)| relocate(v, pointer_locals.contains(&i)))
                .collect();
            let locals_id = self.allocate(Segment::Locals(LocalVariables { script: number, values }))?;
            if let Some(script) = self.script_mut(segment) {
                script.locals_segment = Some(locals_id);
            }
        }
        debug!("instantiated script {number} at segment {segment}");

        // Superclasses may live in scripts that are not loaded yet.
        for (offset, superclass) in superclasses {
            let Some(class) = superclass else { continue };
            let address = match self.class_address(class) {
                Ok(address) => address,
                Err(e) => {
                    self.free_script(number);
                    return Err(e);
                }
            };
            if let Some(object) = self.script_mut(segment).and_then(|s| s.object_mut(offset)) {
                object.superclass = address;
                if !object.is_class {
                    object.species = address;
                }
            }
        }
        Ok(segment)
    }

    /// Drop a locker; the script is freed when none remain.
    ///
    /// Returns whether the script was freed.
    pub fn uninstantiate_script(&mut self, number: u16) -> Result<bool, SegmentError> {
        let id = self
            .script_segment(number)
            .ok_or(SegmentError::ScriptNotLoaded(number))?;
        let script = self.script_mut(id).ok_or(SegmentError::ScriptNotLoaded(number))?;
        script.lockers = script.lockers.saturating_sub(1);
        if script.lockers > 0 {
            return Ok(false);
        }
        self.free_script(number);
        Ok(true)
    }

    fn free_script(&mut self, number: u16) {
        let Some(id) = self.scripts.remove(&number) else { return };
        let locals = self.script(id).and_then(|s| s.locals_segment);
        self.segments[id.0 as usize] = None;
        if let Some(locals) = locals {
            self.segments[locals.0 as usize] = None;
        }
        self.classes.retain(|_, address| address.segment() != id);
        debug!("freed script {number} (segment {id})");
    }

    /// Address of class `class`, loading its script on demand.
    pub fn class_address(&mut self, class: u16) -> Result<Reg, SegmentError> {
        if let Some(&address) = self.classes.get(&class) {
            return Ok(address);
        }
        let script = self
            .loader
            .class_script(class)
            .ok_or(SegmentError::InvalidClass(class))?;
        if self.scripts.contains_key(&script) {
            return Err(SegmentError::InvalidClass(class));
        }
        self.instantiate_script(script)?;
        self.classes
            .get(&class)
            .copied()
            .ok_or(SegmentError::InvalidClass(class))
    }

    /// Address of class `class` if its script is loaded.
    pub fn loaded_class(&self, class: u16) -> Option<Reg> {
        self.classes.get(&class).copied()
    }

    // ── objects ────────────────────────────────────────────────────

    pub fn object(&self, reg: Reg) -> Option<&Object> {
        if !reg.is_pointer() {
            return None;
        }
        match self.segment(reg.segment())? {
            Segment::Script(s) => s.object(reg.offset()),
            Segment::Clones(c) => c.get(reg.offset()),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, reg: Reg) -> Option<&mut Object> {
        if !reg.is_pointer() {
            return None;
        }
        match self.segment_mut(reg.segment())? {
            Segment::Script(s) => s.object_mut(reg.offset()),
            Segment::Clones(c) => c.get_mut(reg.offset()),
            _ => None,
        }
    }

    pub fn is_object(&self, reg: Reg) -> bool {
        self.object(reg).is_some()
    }

    pub fn object_name(&self, reg: Reg) -> &str {
        match self.object(reg) {
            Some(object) => &object.name,
            None if reg.is_null() => "<null>",
            None => "<no such object>",
        }
    }

    /// Every object named `name`, in segment and offset order.
    pub fn find_objects_by_name(&self, name: &str) -> Vec<Reg> {
        let mut found = Vec::new();
        for (i, segment) in self.segments.iter().enumerate() {
            let id = SegmentId(i as u16);
            match segment {
                Some(Segment::Script(s)) => found.extend(
                    s.objects
                        .iter()
                        .filter(|(_, o)| o.name == name)
                        .map(|(&offset, _)| Reg::pointer(id, offset)),
                ),
                Some(Segment::Clones(c)) => found.extend(
                    c.entries
                        .iter()
                        .enumerate()
                        .filter(|(_, o)| o.as_ref().is_some_and(|o| o.name == name))
                        .map(|(offset, _)| Reg::pointer(id, offset as u32)),
                ),
                _ => {}
            }
        }
        found
    }

    pub fn find_object_by_name(&self, name: &str) -> Option<Reg> {
        let found = self.find_objects_by_name(name);
        if found.len() > 1 {
            warn!("{} objects are named '{name}', using the first", found.len());
        }
        found.first().copied()
    }

    /// Copy an object into the clone table.
    ///
    /// The clone is its own species; cloning a class makes the class the
    /// clone's superclass.
    pub fn clone_object(&mut self, original: Reg) -> Result<Reg, SegmentError> {
        let mut object = self
            .object(original)
            .ok_or(SegmentError::NotAnObject(original))?
            .clone();
        if object.is_class {
            object.superclass = original;
        }
        object.is_class = false;
        object.is_clone = true;

        let id = match self.clones {
            Some(id) => id,
            None => {
                let id = self.allocate(Segment::Clones(CloneTable::default()))?;
                self.clones = Some(id);
                id
            }
        };
        let Some(Segment::Clones(table)) = self.segment_mut(id) else {
            return Err(SegmentError::InvalidReference(Reg::pointer(id, 0)));
        };
        let index = table.insert(object);
        let address = Reg::pointer(id, index);
        if let Some(clone) = table.get_mut(index) {
            clone.species = address;
        }
        Ok(address)
    }

    pub fn free_clone(&mut self, reg: Reg) -> Result<(), SegmentError> {
        match self.segment_mut(reg.segment()) {
            Some(Segment::Clones(table)) => table
                .remove(reg.offset())
                .map(|_| ())
                .ok_or(SegmentError::NotAnObject(reg)),
            _ => Err(SegmentError::NotAnObject(reg)),
        }
    }

    // ── dynamic memory ─────────────────────────────────────────────

    pub fn allocate_dynamic(
        &mut self,
        kind: DynamicKind,
        size: usize,
        description: &str,
    ) -> Result<Reg, SegmentError> {
        let id = self.allocate(Segment::Dynamic(DynamicMemory {
            kind,
            description: description.to_owned(),
            data: vec![0; size],
        }))?;
        Ok(Reg::pointer(id, 0))
    }

    pub fn dynamic(&self, reg: Reg) -> Option<&DynamicMemory> {
        match self.segment(reg.segment())? {
            Segment::Dynamic(d) => Some(d),
            _ => None,
        }
    }

    pub fn dynamic_mut(&mut self, reg: Reg) -> Option<&mut DynamicMemory> {
        match self.segment_mut(reg.segment())? {
            Segment::Dynamic(d) => Some(d),
            _ => None,
        }
    }

    pub fn free_dynamic(&mut self, reg: Reg) -> Result<(), SegmentError> {
        let index = reg.segment().0 as usize;
        if !matches!(self.segments.get(index), Some(Some(Segment::Dynamic(_)))) {
            return Err(SegmentError::InvalidReference(reg));
        }
        self.segments[index] = None;
        Ok(())
    }

    // ── classification ─────────────────────────────────────────────

    /// Classify `reg` for kernel signature checks.
    pub fn reg_type(&self, reg: Reg) -> RegType {
        let reg = reg.normalized();
        match reg {
            Reg::Integer(0) => RegType::Null,
            Reg::Integer(_) => RegType::Integer,
            _ if reg.is_uninitialized() => RegType::Uninitialized,
            Reg::Pointer { segment, offset } => match self.segment(segment) {
                None => RegType::Invalid,
                Some(Segment::Script(s)) => {
                    if s.object(offset).is_some() {
                        RegType::Object
                    } else if s.contains(offset) {
                        RegType::Reference
                    } else {
                        RegType::Invalid
                    }
                }
                Some(Segment::Clones(c)) => {
                    if c.get(offset).is_some() { RegType::Object } else { RegType::Invalid }
                }
                Some(Segment::Locals(l)) => {
                    if (offset / 2) < l.len() as u32 { RegType::Reference } else { RegType::Invalid }
                }
                Some(Segment::Stack { size }) => {
                    if (offset / 2) < *size as u32 { RegType::Reference } else { RegType::Invalid }
                }
                Some(Segment::Dynamic(d)) => match d.kind {
                    DynamicKind::Raw if (offset as usize) <= d.data.len() => RegType::Reference,
                    DynamicKind::Raw => RegType::Invalid,
                    DynamicKind::List => RegType::List,
                    DynamicKind::Node => RegType::Node,
                },
            },
        }
    }

    /// Scripts currently loaded, by number.
    pub fn loaded_scripts(&self) -> impl Iterator<Item = (u16, SegmentId)> + '_ {
        self.scripts.iter().map(|(&n, &id)| (n, id))
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| SegmentId(i as u16))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::script::ObjectImage;
    use crate::selector::SelectorId;

    /// In-memory loader: script number -> image, class -> script.
    #[derive(Default)]
    pub struct MapLoader {
        pub scripts: HashMap<u16, ScriptImage>,
        pub classes: HashMap<u16, u16>,
        pub loads: usize,
    }

    impl ScriptLoader for MapLoader {
        fn load_script(&mut self, number: u16) -> Result<ScriptImage, LoadError> {
            self.loads += 1;
            self.scripts.get(&number).cloned().ok_or(LoadError::NotFound(number))
        }

        fn class_script(&self, class: u16) -> Option<u16> {
            self.classes.get(&class).copied()
        }
    }

    pub fn class_image(offset: u32, name: &str, class: u16, superclass: Option<u16>) -> ObjectImage {
        ObjectImage {
            offset,
            name: name.into(),
            class: Some(class),
            superclass,
            ..Default::default()
        }
    }

    /// Script 10 defines classes 0 (Obj) and 1 (Actor: Obj); script 20
    /// holds an instance `ego` of Actor.
    pub fn hierarchy() -> SegmentManager {
        let mut loader = MapLoader::default();
        loader.scripts.insert(10, ScriptImage {
            bytecode: vec![0x48; 0x40],
            objects: vec![
                ObjectImage {
                    methods: vec![(SelectorId(3), 0x00)],
                    ..class_image(0x10, "Obj", 0, None)
                },
                ObjectImage {
                    properties: vec![5],
                    property_selectors: vec![SelectorId(7)],
                    methods: vec![(SelectorId(4), 0x02)],
                    ..class_image(0x20, "Actor", 1, Some(0))
                },
            ],
            ..Default::default()
        });
        loader.scripts.insert(20, ScriptImage {
            bytecode: vec![0x48; 0x20],
            locals: vec![1, 0x8],
            pointer_locals: vec![1],
            objects: vec![ObjectImage {
                offset: 0x8,
                name: "ego".into(),
                superclass: Some(1),
                properties: vec![9, 0x4],
                pointer_properties: vec![1],
                property_selectors: vec![SelectorId(7), SelectorId(8)],
                ..Default::default()
            }],
            ..Default::default()
        });
        loader.classes.insert(0, 10);
        loader.classes.insert(1, 10);
        SegmentManager::new(Box::new(loader), SelectorTable::new())
    }

    #[test]
    fn superclasses_load_on_demand() {
        let mut segs = hierarchy();
        let seg = segs.instantiate_script(20).unwrap();
        assert!(segs.script_segment(10).is_some());

        let ego = segs.find_object_by_name("ego").unwrap();
        assert_eq!(ego, Reg::pointer(seg, 0x8));
        let actor = segs.class_address(1).unwrap();
        let obj = segs.object(ego).unwrap();
        assert_eq!(obj.superclass, actor);
        assert_eq!(obj.species, actor);
        assert_eq!(obj.properties[1], Reg::pointer(seg, 0x4));
        let superclass = segs.object(actor).unwrap().superclass;
        assert_eq!(superclass, segs.class_address(0).unwrap());
    }

    #[test]
    fn locals_are_relocated() {
        let mut segs = hierarchy();
        let seg = segs.instantiate_script(20).unwrap();
        let locals_id = segs.script(seg).unwrap().locals_segment.unwrap();
        let locals = segs.locals(locals_id).unwrap();
        assert_eq!(locals.values, vec![Reg::int(1), Reg::pointer(seg, 0x8)]);
    }

    #[test]
    fn lockers_and_unload() {
        let mut segs = hierarchy();
        let seg = segs.instantiate_script(20).unwrap();
        assert_eq!(segs.instantiate_script(20).unwrap(), seg);
        assert!(!segs.uninstantiate_script(20).unwrap());
        assert!(segs.uninstantiate_script(20).unwrap());
        assert!(segs.object(Reg::pointer(seg, 0x8)).is_none());
        assert_eq!(segs.reg_type(Reg::pointer(seg, 0x8)), RegType::Invalid);
        // reloading gets a fresh segment
        let again = segs.instantiate_script(20).unwrap();
        assert_ne!(again, seg);
    }

    #[test]
    fn unknown_class_is_an_error() {
        let mut segs = hierarchy();
        assert_eq!(segs.class_address(42), Err(SegmentError::InvalidClass(42)));
    }

    #[test]
    fn clones() {
        let mut segs = hierarchy();
        let actor = segs.class_address(1).unwrap();
        let clone = segs.clone_object(actor).unwrap();
        let obj = segs.object(clone).unwrap();
        assert!(obj.is_clone && !obj.is_class);
        assert_eq!(obj.superclass, actor);
        assert_eq!(obj.species, clone);
        assert_eq!(segs.reg_type(clone), RegType::Object);
        segs.free_clone(clone).unwrap();
        assert!(segs.object(clone).is_none());
    }

    #[test]
    fn classification() {
        let mut segs = hierarchy();
        let seg = segs.instantiate_script(10).unwrap();
        assert_eq!(segs.reg_type(Reg::NULL), RegType::Null);
        assert_eq!(segs.reg_type(Reg::int(3)), RegType::Integer);
        assert_eq!(segs.reg_type(Reg::UNINITIALIZED), RegType::Uninitialized);
        assert_eq!(segs.reg_type(Reg::pointer(seg, 0x10)), RegType::Object);
        assert_eq!(segs.reg_type(Reg::pointer(seg, 0x11)), RegType::Reference);
        assert_eq!(segs.reg_type(Reg::pointer(seg, 0x100)), RegType::Invalid);
        let list = segs.allocate_dynamic(DynamicKind::List, 0, "list").unwrap();
        assert_eq!(segs.reg_type(list), RegType::List);
    }

    #[test]
    fn literal_offsets() {
        assert_eq!(LofsMode::PcRelative.resolve(0x100, 0x20, -4), 0x1c);
        assert_eq!(LofsMode::Absolute.resolve(0x100, 0x20, 0x42), 0x42);
        assert_eq!(LofsMode::AfterScriptBody.resolve(0x100, 0x20, 0x42), 0x142);
    }
}
