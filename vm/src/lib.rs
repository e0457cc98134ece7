//! Interpreter for adventure-game script bytecode.
//!
//! [`VM`] owns the segment arena, the data stack and the execution stack.
//! Hosts construct it with a [`ScriptLoader`] and a [`KernelRegistry`], then
//! start code with [`VM::run_export`] or [`VM::invoke_selector`].

pub mod debug;
pub mod disasm;
pub mod error;
pub mod exec_stack;
pub mod gc;
pub mod interpreter;
pub mod kernel;
pub mod send;
pub mod settings;
pub mod signature;
pub mod stack;
pub mod variables;
pub mod workarounds;

#[cfg(test)]
pub(crate) mod testing;

use log::{debug, error, warn};
use sci_bytecode::OpcodeFormats;
use sci_object::{Reg, ScriptLoader, SegmentManager, SelectorTable};

pub use debug::{
    Breakpoint, BreakpointAction, BreakpointKind, BufferedConsole, DebugConsole, DebugState,
    LogConsole, Resume, SelectorAccess, StopInfo, match_kernel_pattern,
};
pub use error::{CallOrigin, Fault, RunError, ScriptError, VmError};
pub use exec_stack::{ExecFrame, ExecStack, FrameKind};
pub use gc::{GarbageCollector, RootProvider, VmRoots};
pub use interpreter::AbortHandle;
pub use kernel::{KernelFn, KernelFunction, KernelRegistry, KernelSubFunction};
pub use settings::{ActorSwap, UninitializedReadPolicy, VmSettings};
pub use signature::{ArgTypes, Signature, SignatureError};
pub use stack::DataStack;
pub use variables::VariableBlocks;
pub use workarounds::{
    LocalCall, WorkaroundEntry, WorkaroundSolution, WorkaroundTable, Workarounds,
};

/// Longest superclass chain followed when matching workarounds.
const MAX_ANCESTRY: usize = 64;

pub struct VM {
    pub settings: VmSettings,
    pub segments: SegmentManager,
    pub selectors: SelectorTable,
    pub kernel: KernelRegistry,
    pub workarounds: Workarounds,
    pub debug: DebugState,
    pub formats: OpcodeFormats,
    pub stack: DataStack,
    pub exec: ExecStack,
    /// Accumulator.
    pub acc: Reg,
    /// Accumulator before the last comparison.
    pub prev: Reg,
    /// Pending `&rest` adjustment for the next call or send.
    pub rest: u16,
    pub(crate) vars: VariableBlocks,
    /// Stands in for out-of-range properties.
    pub(crate) dummy: Reg,
    pub(crate) abort: AbortHandle,
    pub(crate) run_depth: usize,
    pub(crate) gc_countdown: u32,
    pub(crate) gc: Option<Box<dyn GarbageCollector>>,
}

impl VM {
    /// Set up the segments, allocate the stack and load script 0, whose
    /// locals are the globals.
    pub fn new(
        settings: VmSettings,
        loader: Box<dyn ScriptLoader>,
        selectors: SelectorTable,
        kernel: KernelRegistry,
    ) -> Result<VM, VmError> {
        let mut segments = SegmentManager::new(loader, selectors.clone());
        let stack_segment = segments.allocate_stack(settings.stack_size)?;
        let script0 = segments.instantiate_script(0)?;
        let globals = segments.script(script0).and_then(|s| s.locals_segment);
        if globals.is_none() {
            warn!("script 0 has no locals, globals are unavailable");
        }

        let formats = OpcodeFormats::new(settings.format_options());
        let stack = DataStack::new(stack_segment, settings.stack_size);
        let exec = ExecStack::new(settings.max_exec_frames);
        let gc_countdown = settings.gc_interval;
        Ok(VM {
            segments,
            selectors,
            kernel,
            workarounds: Workarounds::default(),
            debug: DebugState::default(),
            formats,
            stack,
            exec,
            acc: Reg::NULL,
            prev: Reg::NULL,
            rest: 0,
            vars: VariableBlocks {
                globals,
                ..VariableBlocks::default()
            },
            dummy: Reg::NULL,
            abort: AbortHandle::default(),
            run_depth: 0,
            gc_countdown,
            gc: None,
            settings,
        })
    }

    pub fn frame(&self) -> Result<&ExecFrame, VmError> {
        self.exec.top().ok_or(VmError::NoActiveFrame)
    }

    pub fn frame_mut(&mut self) -> Result<&mut ExecFrame, VmError> {
        self.exec.top_mut().ok_or(VmError::NoActiveFrame)
    }

    /// Push a frame, storing its argc into the argc slot.
    pub fn push_frame(&mut self, frame: ExecFrame) -> Result<usize, VmError> {
        self.stack.set(frame.argp, Reg::word(frame.argc))?;
        debug!(
            "push frame {:?} {}::{} at {}",
            frame.kind,
            self.segments.object_name(frame.sendp),
            frame
                .selector
                .map(|s| self.selectors.display_name(s))
                .unwrap_or_default(),
            frame.pc
        );
        self.exec.push(frame)
    }

    /// Value of global `index`, if it exists.
    pub fn global(&self, index: u16) -> Option<Reg> {
        let block = self.segments.locals(self.vars.globals?)?;
        block.values.get(index as usize).copied()
    }

    /// The handle hosts use to stop a running VM.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Drop every frame and the pending `&rest`, as hosts do after an
    /// aborted run. The abort flag is left alone.
    pub fn reset_execution(&mut self) {
        self.exec.truncate(0);
        self.exec.set_base(0);
        self.rest = 0;
    }

    // ── diagnostics ────────────────────────────────────────────────

    /// Describe the innermost method activation.
    ///
    /// Inside a local procedure call the selector or export of the nearest
    /// enclosing method is reported.
    pub fn call_origin(&self) -> CallOrigin {
        let frames = self.exec.frames();
        let room = self.global(self.settings.room_global).and_then(Reg::as_i16);
        let Some(index) = frames.iter().rposition(ExecFrame::is_call) else {
            return CallOrigin { room, ..CallOrigin::default() };
        };
        let frame = &frames[index];
        let (mut selector, mut export) = (frame.selector, frame.export);
        if frame.local_call_offset.is_some() {
            if let Some(outer) = frames[..index]
                .iter()
                .rev()
                .find(|f| f.selector.is_some() || f.export.is_some())
            {
                selector = outer.selector;
                export = outer.export;
            }
        }
        let method = match (selector, export) {
            (Some(s), _) => self.selectors.display_name(s),
            (None, Some(e)) => format!("export {e}"),
            (None, None) => String::new(),
        };
        CallOrigin {
            script: self.segments.script(frame.pc.segment).map(|s| s.number),
            room,
            object: self.segments.object_name(frame.sendp).to_owned(),
            method,
            local_call_offset: frame.local_call_offset,
            frame: Some(index),
        }
    }

    /// Attach the current origin to `error`.
    pub fn fatal(&self, error: VmError) -> RunError {
        let script_error = ScriptError {
            error,
            origin: self.call_origin(),
            pc: self.exec.top().map(|f| f.pc),
        };
        error!("{script_error}");
        RunError::Fatal(Box::new(script_error))
    }

    /// Names of `obj` and its superclasses, nearest first.
    pub fn ancestry(&self, obj: Reg) -> Vec<String> {
        let mut names = Vec::new();
        let mut current = obj;
        while let Some(object) = self.segments.object(current) {
            names.push(object.name.clone());
            if object.superclass.is_null() || names.len() >= MAX_ANCESTRY {
                break;
            }
            current = object.superclass;
        }
        names
    }

    /// Look up a workaround for a failure in the innermost method.
    pub fn find_workaround(
        &self,
        table: &WorkaroundTable,
        index: Option<u16>,
    ) -> Option<WorkaroundSolution> {
        if table.is_empty() {
            return None;
        }
        let origin = self.call_origin();
        let sendp = self
            .exec
            .frames()
            .iter()
            .rev()
            .find(|f| f.is_call())
            .map_or(Reg::NULL, |f| f.sendp);
        let found = table.find(&self.settings.game_id, &origin, &self.ancestry(sendp), index);
        if let Some(solution) = found {
            warn!("applying workaround {solution:?} in {origin}");
        }
        found
    }
}
