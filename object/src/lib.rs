//! Object model of the script VM: tagged registers, segments, objects and
//! selector resolution.

mod value;
mod selector;
mod object;
mod script;
mod segment;
mod lookup;

pub use value::{ArithmeticError, Reg, SegmentId};
pub use selector::{SelectorId, SelectorTable};
pub use object::{CodePos, Method, Object};
pub use script::{LocalVariables, ObjectImage, Script, ScriptImage};
pub use segment::{
    CloneTable, DynamicKind, DynamicMemory, LoadError, LofsMode, RegType, ScriptLoader, Segment,
    SegmentError, SegmentManager,
};
pub use lookup::{ObjVarRef, SelectorLookup, lookup_counted, lookup_selector, property_index};
