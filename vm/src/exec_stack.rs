use sci_object::{CodePos, ObjVarRef, Reg, SegmentId, SelectorId};

use crate::error::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A method, export or local procedure.
    Call,
    /// A kernel function running on behalf of the frame below.
    Kernel { function: u16, sub: Option<u16> },
    /// A pending property read (`argc == 0`) or write from a send.
    VarSelector { var: ObjVarRef },
}

/// One activation record.
///
/// The top frame holds the live `pc`, `sp` and `fp`. A frame created for the
/// second and later method groups of a send starts with `sp_carried` set: its
/// pointers are inherited from whichever frame returns into it.
#[derive(Debug, Clone)]
pub struct ExecFrame {
    pub kind: FrameKind,
    /// `self` of the activation.
    pub objp: Reg,
    /// The object the message was sent to.
    pub sendp: Reg,
    pub pc: CodePos,
    pub sp: usize,
    pub fp: usize,
    pub sp_carried: bool,
    pub argc: u16,
    /// Stack slot holding argc; parameters follow it.
    pub argp: usize,
    pub selector: Option<SelectorId>,
    pub export: Option<u16>,
    pub local_call_offset: Option<u32>,
    /// Script segment whose locals block is active.
    pub local_script: SegmentId,
    /// Index of the frame that created this one.
    pub origin: Option<usize>,
}

impl ExecFrame {
    /// A call frame entered at `pc` with fresh pointers at `sp`.
    pub fn call(pc: CodePos, sp: usize, objp: Reg, argc: u16, argp: usize) -> Self {
        Self {
            kind: FrameKind::Call,
            objp,
            sendp: objp,
            pc,
            sp,
            fp: sp,
            sp_carried: false,
            argc,
            argp,
            selector: None,
            export: None,
            local_call_offset: None,
            local_script: pc.segment,
            origin: None,
        }
    }

    #[must_use]
    pub fn is_call(&self) -> bool {
        matches!(self.kind, FrameKind::Call)
    }

    #[must_use]
    pub fn is_var_selector(&self) -> bool {
        matches!(self.kind, FrameKind::VarSelector { .. })
    }
}

/// The execution stack and the base of the innermost run.
#[derive(Debug, Clone)]
pub struct ExecStack {
    frames: Vec<ExecFrame>,
    base: usize,
    max_frames: usize,
    changed: bool,
}

impl ExecStack {
    #[must_use]
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: Vec::new(),
            base: 0,
            max_frames,
            changed: false,
        }
    }

    /// Push `frame`, returning its index.
    pub fn push(&mut self, frame: ExecFrame) -> Result<usize, VmError> {
        if self.frames.len() >= self.max_frames {
            return Err(VmError::ExecStackOverflow(self.frames.len()));
        }
        self.frames.push(frame);
        self.changed = true;
        Ok(self.frames.len() - 1)
    }

    pub fn pop(&mut self) -> Option<ExecFrame> {
        self.changed = true;
        self.frames.pop()
    }

    /// Drop every frame from `len` upwards.
    pub fn truncate(&mut self, len: usize) {
        if len < self.frames.len() {
            self.frames.truncate(len);
            self.changed = true;
        }
    }

    #[must_use]
    pub fn top(&self) -> Option<&ExecFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut ExecFrame> {
        self.frames.last_mut()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ExecFrame> {
        self.frames.get(index)
    }

    #[must_use]
    pub fn frames(&self) -> &[ExecFrame] {
        &self.frames
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index of the first frame of the current run.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn set_base(&mut self, base: usize) {
        self.base = base;
    }

    /// Whether the top frame changed since the last call.
    pub(crate) fn take_changed(&mut self) -> bool {
        core::mem::take(&mut self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> ExecFrame {
        ExecFrame::call(CodePos::new(SegmentId(1), 0), 0, Reg::NULL, 0, 0)
    }

    #[test]
    fn push_is_bounded() {
        let mut stack = ExecStack::new(2);
        assert_eq!(stack.push(frame()), Ok(0));
        assert_eq!(stack.push(frame()), Ok(1));
        assert_eq!(stack.push(frame()), Err(VmError::ExecStackOverflow(2)));
    }

    #[test]
    fn changes_are_reported_once() {
        let mut stack = ExecStack::new(4);
        stack.push(frame()).unwrap();
        assert!(stack.take_changed());
        assert!(!stack.take_changed());
        stack.pop();
        assert!(stack.take_changed());
    }
}
