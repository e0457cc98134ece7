use core::fmt;

use log::warn;
use sci_bytecode::{DecodeError, VarClass};
use sci_object::{ArithmeticError, CodePos, Reg, SegmentError};
use thiserror::Error;

use crate::signature::SignatureError;

/// Every condition that stops the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Arithmetic(#[from] ArithmeticError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("execution stack is empty")]
    NoActiveFrame,
    #[error("program counter {pos} has gone astray (script size {size:#06x})")]
    PcOutOfBounds { pos: CodePos, size: usize },
    #[error("jump to {target:#x} leaves script {script} (size {size:#06x})")]
    JumpOutOfBounds { script: u16, target: i64, size: usize },
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow at slot {0:#06x}")]
    StackOverflow(usize),
    #[error("execution stack overflow ({0} frames)")]
    ExecStackOverflow(usize),
    #[error("nested runs exceed depth {0}")]
    RunDepthExceeded(usize),
    #[error("expected an integer, got {0}")]
    NotAnInteger(Reg),
    #[error("send to invalid selector {selector} of object {object}")]
    SelectorNotFound { object: String, selector: String },
    #[error("selector {selector} of object {object} is not a variable")]
    NotAVariable { object: String, selector: String },
    #[error("selector {selector} of object {object} is not a method")]
    NotAMethod { object: String, selector: String },
    #[error("send of {selector} carries {argc:#x} arguments")]
    TooManyArguments { selector: String, argc: u16 },
    #[error("invalid property #{index} of {object} (out of 0..{count})")]
    PropertyOutOfRange { object: String, index: usize, count: usize },
    #[error("{} variable {index} is out of range (max {max})", .class.name())]
    VariableOutOfRange { class: VarClass, index: i32, max: usize },
    #[error("uninitialized read of {} {index}", .class.name())]
    UninitializedRead { class: VarClass, index: i32 },
    #[error("{0} is not a valid variable reference")]
    InvalidReference(Reg),
    #[error("script {script} has no export {export}")]
    InvalidExport { script: u16, export: u16 },
    #[error("invalid kernel function {0:#x}")]
    InvalidKernelFunction(u16),
    #[error("k{name}: invalid sub-function {sub}")]
    InvalidKernelSubFunction { name: String, sub: Reg },
    #[error("k{name} is not implemented")]
    UnimplementedKernel { name: String },
    #[error("k{name}{arguments}: signature mismatch, expected {signature}")]
    SignatureMismatch {
        name: String,
        signature: String,
        arguments: String,
    },
    #[error("k{name}: {message}")]
    Kernel { name: String, message: String },
}

/// A failed variable or property access.
///
/// Accessors report what went wrong and what value could stand in for the
/// result; the call site decides whether to take it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Fatal(VmError),
    Recoverable { substitute: Reg, cause: VmError },
}

impl Fault {
    /// Take the substitute of a recoverable fault, logging its cause.
    pub fn recover(self) -> Result<Reg, VmError> {
        match self {
            Fault::Recoverable { substitute, cause } => {
                warn!("{cause}, using {substitute}");
                Ok(substitute)
            }
            Fault::Fatal(e) => Err(e),
        }
    }

    /// Treat every fault as fatal.
    pub fn escalate(self) -> VmError {
        match self {
            Fault::Fatal(e) | Fault::Recoverable { cause: e, .. } => e,
        }
    }
}

impl From<VmError> for Fault {
    fn from(e: VmError) -> Self {
        Fault::Fatal(e)
    }
}

impl From<SegmentError> for Fault {
    fn from(e: SegmentError) -> Self {
        Fault::Fatal(e.into())
    }
}

/// Where script execution currently is, for diagnostics and workaround
/// lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallOrigin {
    pub script: Option<u16>,
    pub room: Option<i16>,
    /// Name of the object that received the send (`sendp`).
    pub object: String,
    /// Selector name, `export N`, or empty outside of a method.
    pub method: String,
    pub local_call_offset: Option<u32>,
    pub frame: Option<usize>,
}

impl fmt::Display for CallOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method {}::{} (room ", self.object, self.method)?;
        match self.room {
            Some(room) => write!(f, "{room}")?,
            None => f.write_str("?")?,
        }
        f.write_str(", script ")?;
        match self.script {
            Some(script) => write!(f, "{script}")?,
            None => f.write_str("?")?,
        }
        if let Some(offset) = self.local_call_offset {
            write!(f, ", localCall {offset:x}")?;
        }
        if let Some(frame) = self.frame {
            write!(f, ", frame {frame}")?;
        }
        f.write_str(")")
    }
}

/// A fatal error together with the place it happened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ScriptError {
    pub error: VmError,
    pub origin: CallOrigin,
    pub pc: Option<CodePos>,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.error, self.origin)?;
        if let Some(pc) = self.pc {
            write!(f, " at {pc}")?;
        }
        Ok(())
    }
}

/// Why [`crate::VM::run`] stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("{0}")]
    Fatal(Box<ScriptError>),
    #[error("execution aborted")]
    Aborted,
}

impl RunError {
    /// The underlying error, unless the run was aborted.
    pub fn vm_error(&self) -> Option<&VmError> {
        match self {
            RunError::Fatal(e) => Some(&e.error),
            RunError::Aborted => None,
        }
    }
}

/// Internal result type of instruction handlers: either a fresh error that
/// still needs an origin, or a finished one from a nested run.
#[derive(Debug)]
pub(crate) enum StepError {
    Fatal(VmError),
    Run(RunError),
}

impl From<VmError> for StepError {
    fn from(e: VmError) -> Self {
        StepError::Fatal(e)
    }
}

impl From<RunError> for StepError {
    fn from(e: RunError) -> Self {
        StepError::Run(e)
    }
}

impl From<SegmentError> for StepError {
    fn from(e: SegmentError) -> Self {
        StepError::Fatal(e.into())
    }
}

impl From<DecodeError> for StepError {
    fn from(e: DecodeError) -> Self {
        StepError::Fatal(e.into())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_names_object_and_selector() {
        let origin = CallOrigin {
            script: Some(12),
            room: Some(3),
            object: "ego".into(),
            method: "doit".into(),
            local_call_offset: None,
            frame: Some(2),
        };
        assert_eq!(origin.to_string(), "method ego::doit (room 3, script 12, frame 2)");
    }

    #[test]
    fn recoverable_faults_yield_the_substitute() {
        let fault = Fault::Recoverable {
            substitute: Reg::int(0),
            cause: VmError::StackUnderflow,
        };
        assert_eq!(fault.clone().recover(), Ok(Reg::int(0)));
        assert_eq!(fault.escalate(), VmError::StackUnderflow);
        assert_eq!(
            Fault::Fatal(VmError::StackUnderflow).recover(),
            Err(VmError::StackUnderflow)
        );
    }
}
