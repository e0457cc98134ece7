use core::fmt;

use crate::selector::SelectorId;
use crate::value::{Reg, SegmentId};

/// A position in script bytecode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePos {
    pub segment: SegmentId,
    pub offset: u32,
}

impl CodePos {
    pub const fn new(segment: SegmentId, offset: u32) -> Self {
        Self { segment, offset }
    }
}

impl From<CodePos> for Reg {
    fn from(pos: CodePos) -> Reg {
        Reg::pointer(pos.segment, pos.offset)
    }
}

impl fmt::Display for CodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04x}", self.segment, self.offset)
    }
}

impl fmt::Debug for CodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub selector: SelectorId,
    /// Entry offset in the bytecode of the defining script.
    pub offset: u32,
}

/// An object or a class. Classes are objects that are never instances.
///
/// `properties` and `property_selectors` are parallel: slot `i` holds the
/// value of selector `property_selectors[i]`.
#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub is_class: bool,
    pub is_clone: bool,
    pub species: Reg,
    /// Address of the superclass, or null at the root of the hierarchy.
    pub superclass: Reg,
    pub properties: Vec<Reg>,
    pub property_selectors: Vec<SelectorId>,
    pub methods: Vec<Method>,
    /// Script segment holding the method bytecode.
    pub code_segment: SegmentId,
    pub script: u16,
}

impl Object {
    pub fn property_index(&self, selector: SelectorId) -> Option<usize> {
        self.property_selectors.iter().position(|&s| s == selector)
    }

    pub fn property(&self, index: usize) -> Option<Reg> {
        self.properties.get(index).copied()
    }

    pub fn property_mut(&mut self, index: usize) -> Option<&mut Reg> {
        self.properties.get_mut(index)
    }

    /// Selector naming property slot `index`.
    pub fn property_selector(&self, index: usize) -> Option<SelectorId> {
        self.property_selectors.get(index).copied()
    }

    /// First method table entry for `selector`.
    pub fn method(&self, selector: SelectorId) -> Option<CodePos> {
        self.methods
            .iter()
            .find(|m| m.selector == selector)
            .map(|m| CodePos::new(self.code_segment, m.offset))
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Object {
        Object {
            name: "ego".into(),
            is_class: false,
            is_clone: false,
            species: Reg::NULL,
            superclass: Reg::NULL,
            properties: vec![Reg::int(1), Reg::int(2)],
            property_selectors: vec![SelectorId(4), SelectorId(9)],
            methods: vec![
                Method { selector: SelectorId(20), offset: 0x10 },
                Method { selector: SelectorId(20), offset: 0x40 },
            ],
            code_segment: SegmentId(2),
            script: 0,
        }
    }

    #[test]
    fn properties_by_selector() {
        let obj = sample();
        assert_eq!(obj.property_index(SelectorId(9)), Some(1));
        assert_eq!(obj.property_index(SelectorId(5)), None);
        assert_eq!(obj.property_selector(0), Some(SelectorId(4)));
    }

    #[test]
    fn first_method_entry_wins() {
        let obj = sample();
        assert_eq!(obj.method(SelectorId(20)), Some(CodePos::new(SegmentId(2), 0x10)));
        assert_eq!(obj.method(SelectorId(21)), None);
    }
}
