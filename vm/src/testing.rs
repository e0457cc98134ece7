//! A small in-memory game for unit tests.
//!
//! Script 0 holds the globals, the classes `Obj` (0) and `Actor` (1), and
//! the instances `ego` (an Actor with an extra `z`) and `stopGroop`. Methods and exports are
//! assembled by the test and appended to script 0's bytecode.

use std::collections::HashMap;

use sci_bytecode::{BytecodeBuilder, Op, VarClass, VarOp, VarOpKind};
use sci_object::{LoadError, ObjectImage, Reg, ScriptImage, ScriptLoader, SelectorId, SelectorTable};

use crate::VM;
use crate::kernel::KernelRegistry;
use crate::settings::VmSettings;

pub const GLOBALS: usize = 16;

/// Objects live above the bytecode so offsets never collide with code.
const OBJECT_BASE: u32 = 0x4000;

const VOCABULARY: [&str; 7] = ["x", "y", "client", "doit", "init", "value", "z"];

#[derive(Default)]
pub struct MapLoader {
    pub scripts: HashMap<u16, ScriptImage>,
    pub classes: HashMap<u16, u16>,
}

impl ScriptLoader for MapLoader {
    fn load_script(&mut self, number: u16) -> Result<ScriptImage, LoadError> {
        self.scripts.get(&number).cloned().ok_or(LoadError::NotFound(number))
    }

    fn class_script(&self, class: u16) -> Option<u16> {
        self.classes.get(&class).copied()
    }
}

pub struct TestGame {
    settings: VmSettings,
    selectors: SelectorTable,
    kernel: KernelRegistry,
    code: Vec<u8>,
    exports: Vec<u32>,
    methods: Vec<(String, SelectorId, u32)>,
    loader: MapLoader,
}

impl TestGame {
    pub fn new() -> Self {
        Self {
            settings: VmSettings::default(),
            selectors: SelectorTable::from_names(VOCABULARY),
            kernel: KernelRegistry::new(),
            // offset 0 is a bare `ret`
            code: vec![Op::Ret.number() << 1 | 1],
            exports: Vec::new(),
            methods: Vec::new(),
            loader: MapLoader::default(),
        }
    }

    pub fn settings(mut self, settings: VmSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn kernel(mut self, kernel: KernelRegistry) -> Self {
        self.kernel = kernel;
        self
    }

    fn append(&mut self, code: BytecodeBuilder) -> u32 {
        let offset = self.code.len() as u32;
        self.code.extend(code.into_bytes());
        offset
    }

    /// Give `object` (a name from script 0) a method.
    pub fn method(mut self, object: &str, selector: &str, code: BytecodeBuilder) -> Self {
        let selector = self.selectors.add(selector);
        let offset = self.append(code);
        self.methods.push((object.to_owned(), selector, offset));
        self
    }

    /// Add the next export of script 0.
    pub fn export(mut self, code: BytecodeBuilder) -> Self {
        let offset = self.append(code);
        self.exports.push(offset);
        self
    }

    /// Make another script available to the loader.
    pub fn script(mut self, number: u16, image: ScriptImage) -> Self {
        self.loader.scripts.insert(number, image);
        self
    }

    fn object(&self, index: u32, name: &str, properties: &[&str]) -> ObjectImage {
        let methods = self
            .methods
            .iter()
            .filter(|(object, _, _)| object == name)
            .map(|&(_, selector, offset)| (selector, offset))
            .collect();
        ObjectImage {
            offset: OBJECT_BASE + index * 0x10,
            name: name.to_owned(),
            properties: vec![0; properties.len()],
            property_selectors: properties.iter().map(|p| self.selectors.add(p)).collect(),
            methods,
            ..Default::default()
        }
    }

    pub fn build(mut self) -> VM {
        let objects = vec![
            ObjectImage { class: Some(0), ..self.object(0, "Obj", &[]) },
            ObjectImage {
                class: Some(1),
                superclass: Some(0),
                ..self.object(1, "Actor", &["x", "y"])
            },
            ObjectImage { superclass: Some(1), ..self.object(2, "ego", &["x", "y", "z"]) },
            ObjectImage { superclass: Some(0), ..self.object(3, "stopGroop", &["client"]) },
        ];
        let script0 = ScriptImage {
            bytecode: std::mem::take(&mut self.code),
            exports: std::mem::take(&mut self.exports),
            locals: vec![0; GLOBALS],
            objects,
            ..Default::default()
        };
        self.loader.scripts.insert(0, script0);
        self.loader.classes.insert(0, 0);
        self.loader.classes.insert(1, 0);
        VM::new(self.settings, Box::new(self.loader), self.selectors, self.kernel)
            .expect("test game loads")
    }
}

pub fn var_op(kind: VarOpKind, class: VarClass, stack: bool) -> VarOp {
    VarOp { kind, class, stack, indexed: false }
}

/// `lag index`: accumulator = global.
pub fn load_global(code: &mut BytecodeBuilder, index: u16) {
    code.var(var_op(VarOpKind::Load, VarClass::Global, false), index);
}

pub fn object(vm: &VM, name: &str) -> Reg {
    vm.segments.find_object_by_name(name).expect("object exists")
}

pub fn selector(vm: &VM, name: &str) -> SelectorId {
    vm.selectors.find(name).expect("selector exists")
}

/// Selector number of a name from the built-in vocabulary, as a `pushi`
/// operand.
pub fn vocab(name: &str) -> i16 {
    VOCABULARY.iter().position(|&n| n == name).expect("known selector") as i16
}
