use sci_object::{Reg, SegmentId};

use crate::error::VmError;

/// The data stack: one fixed-size block of registers living in its own
/// segment.
///
/// The stack does not track a depth of its own. The live stack pointer of
/// each activation sits in its exec frame; this type only guards the slots.
#[derive(Debug, Clone)]
pub struct DataStack {
    segment: SegmentId,
    slots: Vec<Reg>,
}

impl DataStack {
    #[must_use]
    pub fn new(segment: SegmentId, size: usize) -> Self {
        Self {
            segment,
            slots: vec![Reg::NULL; size],
        }
    }

    #[must_use]
    pub fn segment(&self) -> SegmentId {
        self.segment
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<Reg, VmError> {
        self.slots.get(index).copied().ok_or(VmError::StackOverflow(index))
    }

    pub fn set(&mut self, index: usize, value: Reg) -> Result<(), VmError> {
        let slot = self.slots.get_mut(index).ok_or(VmError::StackOverflow(index))?;
        *slot = value;
        Ok(())
    }

    /// Slots `start..start + len`.
    pub fn slice(&self, start: usize, len: usize) -> Result<&[Reg], VmError> {
        let end = start.checked_add(len).ok_or(VmError::StackOverflow(start))?;
        self.slots.get(start..end).ok_or(VmError::StackOverflow(end))
    }

    /// The slots below `sp`.
    pub fn live(&self, sp: usize) -> &[Reg] {
        &self.slots[..sp.min(self.slots.len())]
    }

    /// Address of slot `index` as a register, two bytes per slot.
    #[must_use]
    pub fn address(&self, index: usize) -> Reg {
        Reg::pointer(self.segment, (index * 2) as u32)
    }

    /// Slot index of a register pointing into this stack.
    #[must_use]
    pub fn index_of(&self, reg: Reg) -> Option<usize> {
        if !reg.is_pointer() || reg.segment() != self.segment {
            return None;
        }
        let index = reg.offset() as usize / 2;
        (index < self.slots.len()).then_some(index)
    }
}
