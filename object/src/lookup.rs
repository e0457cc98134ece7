use log::warn;

use crate::object::CodePos;
use crate::segment::{SegmentError, SegmentManager};
use crate::selector::SelectorId;
use crate::value::Reg;

/// A property slot of a specific object.
///
/// Holds the object address rather than a pointer into the slot so that it
/// stays meaningful across script reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjVarRef {
    pub obj: Reg,
    pub index: usize,
}

/// The result of resolving a selector on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorLookup {
    /// Selector was not found.
    None,
    /// A property of the receiver.
    Variable(ObjVarRef),
    /// A method, found on the receiver or a superclass.
    Method(CodePos),
}

impl SelectorLookup {
    pub fn is_none(&self) -> bool {
        matches!(self, SelectorLookup::None)
    }
}

/// Look up `selector` on `obj`.
///
/// The receiver's own properties are searched first. Failing that, the
/// method tables of the receiver and its superclasses are scanned in order
/// and the first match wins.
pub fn lookup_selector(
    segments: &SegmentManager,
    obj: Reg,
    selector: SelectorId,
) -> Result<SelectorLookup, SegmentError> {
    lookup_counted(segments, obj, selector).map(|(found, _)| found)
}

/// [`lookup_selector`], also returning the number of method tables scanned.
pub fn lookup_counted(
    segments: &SegmentManager,
    obj: Reg,
    selector: SelectorId,
) -> Result<(SelectorLookup, usize), SegmentError> {
    let object = segments.object(obj).ok_or(SegmentError::NotAnObject(obj))?;
    if let Some(index) = object.property_index(selector) {
        return Ok((SelectorLookup::Variable(ObjVarRef { obj, index }), 0));
    }

    let mut visited: Vec<Reg> = Vec::new();
    let mut current = obj;
    let mut scans = 0;
    loop {
        // used to find and break cycles
        if visited.contains(&current) {
            warn!(
                "superclass chain of {} loops at {current}",
                segments.object_name(obj)
            );
            return Ok((SelectorLookup::None, scans));
        }
        visited.push(current);

        let object = segments
            .object(current)
            .ok_or(SegmentError::InvalidReference(current))?;
        scans += 1;
        if let Some(pos) = object.method(selector) {
            return Ok((SelectorLookup::Method(pos), scans));
        }
        if object.superclass.is_null() {
            return Ok((SelectorLookup::None, scans));
        }
        current = object.superclass;
    }
}

/// Index of property `selector` on `obj`, if `obj` has it.
pub fn property_index(segments: &SegmentManager, obj: Reg, selector: SelectorId) -> Option<usize> {
    segments.object(obj)?.property_index(selector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests::hierarchy;

    #[test]
    fn properties_shadow_methods() {
        let mut segs = hierarchy();
        segs.instantiate_script(20).unwrap();
        let ego = segs.find_object_by_name("ego").unwrap();

        assert_eq!(
            lookup_selector(&segs, ego, SelectorId(8)).unwrap(),
            SelectorLookup::Variable(ObjVarRef { obj: ego, index: 1 })
        );
    }

    #[test]
    fn methods_come_from_the_nearest_class() {
        let mut segs = hierarchy();
        segs.instantiate_script(20).unwrap();
        let ego = segs.find_object_by_name("ego").unwrap();
        let script10 = segs.script_segment(10).unwrap();

        let (found, scans) = lookup_counted(&segs, ego, SelectorId(4)).unwrap();
        assert_eq!(found, SelectorLookup::Method(CodePos::new(script10, 0x02)));
        assert_eq!(scans, 2);

        let (found, scans) = lookup_counted(&segs, ego, SelectorId(3)).unwrap();
        assert_eq!(found, SelectorLookup::Method(CodePos::new(script10, 0x00)));
        assert_eq!(scans, 3);
    }

    #[test]
    fn missing_selector_scans_each_level_once() {
        let mut segs = hierarchy();
        segs.instantiate_script(20).unwrap();
        let ego = segs.find_object_by_name("ego").unwrap();
        // ego -> Actor -> Obj: two superclass links
        let (found, scans) = lookup_counted(&segs, ego, SelectorId(99)).unwrap();
        assert!(found.is_none());
        assert!(scans <= 2 + 1);
    }

    #[test]
    fn cyclic_chain_terminates() {
        let mut segs = hierarchy();
        segs.instantiate_script(10).unwrap();
        let obj = segs.class_address(0).unwrap();
        let actor = segs.class_address(1).unwrap();
        segs.object_mut(obj).unwrap().superclass = actor;

        let (found, scans) = lookup_counted(&segs, actor, SelectorId(99)).unwrap();
        assert!(found.is_none());
        assert_eq!(scans, 2);
    }

    #[test]
    fn non_objects_are_rejected() {
        let segs = hierarchy();
        assert_eq!(
            lookup_selector(&segs, Reg::int(5), SelectorId(1)),
            Err(SegmentError::NotAnObject(Reg::int(5)))
        );
    }
}
