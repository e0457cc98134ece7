use std::collections::BTreeMap;

use crate::object::Object;
use crate::selector::SelectorId;
use crate::value::{Reg, SegmentId};

/// One object as delivered by the script loader.
///
/// Property values are raw words; indices listed in `pointer_properties`
/// are offsets into the owning script and become pointers on
/// instantiation.
#[derive(Debug, Clone, Default)]
pub struct ObjectImage {
    /// Address of the object inside the script segment.
    pub offset: u32,
    pub name: String,
    /// Set when this object defines class number `n`.
    pub class: Option<u16>,
    /// Class number of the superclass (for instances, their class).
    pub superclass: Option<u16>,
    pub properties: Vec<u16>,
    pub pointer_properties: Vec<usize>,
    pub property_selectors: Vec<SelectorId>,
    pub methods: Vec<(SelectorId, u32)>,
}

/// A script as delivered by the loader, already decompressed and parsed.
#[derive(Debug, Clone, Default)]
pub struct ScriptImage {
    pub bytecode: Vec<u8>,
    /// Export table: offsets into `bytecode`.
    pub exports: Vec<u32>,
    pub locals: Vec<u16>,
    /// Indices of locals holding offsets into this script.
    pub pointer_locals: Vec<usize>,
    pub objects: Vec<ObjectImage>,
}

/// A loaded script.
#[derive(Debug, Clone)]
pub struct Script {
    pub number: u16,
    pub segment: SegmentId,
    pub bytecode: Vec<u8>,
    pub exports: Vec<u32>,
    pub objects: BTreeMap<u32, Object>,
    pub locals_segment: Option<SegmentId>,
    pub lockers: u32,
}

impl Script {
    /// Size of the bytecode; branch targets must stay below it.
    pub fn size(&self) -> usize {
        self.bytecode.len()
    }

    pub fn export(&self, index: u16) -> Option<u32> {
        self.exports.get(index as usize).copied()
    }

    pub fn object(&self, offset: u32) -> Option<&Object> {
        self.objects.get(&offset)
    }

    pub fn object_mut(&mut self, offset: u32) -> Option<&mut Object> {
        self.objects.get_mut(&offset)
    }

    pub fn contains(&self, offset: u32) -> bool {
        (offset as usize) < self.bytecode.len()
    }
}

/// The locals block of one script. Script 0's block holds the globals.
#[derive(Debug, Clone)]
pub struct LocalVariables {
    pub script: u16,
    pub values: Vec<Reg>,
}

impl LocalVariables {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
