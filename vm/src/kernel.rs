//! Kernel function registry and the `callk` dispatch.

use log::debug;
use sci_object::{Reg, RegType};

use crate::VM;
use crate::debug::BreakpointAction;
use crate::error::{RunError, StepError, VmError};
use crate::exec_stack::{ExecFrame, FrameKind};
use crate::signature::{Signature, SignatureError, describe_args};
use crate::workarounds::{WorkaroundEntry, WorkaroundSolution, WorkaroundTable};

/// A host-provided kernel function. Receives the arguments after argc.
pub type KernelFn = fn(&mut VM, &[Reg]) -> Result<Reg, RunError>;

#[derive(Debug, Clone)]
pub struct KernelSubFunction {
    pub name: String,
    pub signature: Option<Signature>,
    pub function: Option<KernelFn>,
    pub workarounds: WorkaroundTable,
}

#[derive(Debug, Clone)]
pub struct KernelFunction {
    pub name: String,
    pub signature: Option<Signature>,
    /// Unset for dispatch-only functions and for known but unimplemented
    /// ones.
    pub function: Option<KernelFn>,
    /// Selected by the first argument when non-empty.
    pub sub_functions: Vec<KernelSubFunction>,
    pub workarounds: WorkaroundTable,
}

impl KernelFunction {
    pub fn has_sub_functions(&self) -> bool {
        !self.sub_functions.is_empty()
    }
}

/// Kernel functions by call number.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    functions: Vec<KernelFunction>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(signature: &str) -> Result<Option<Signature>, SignatureError> {
        if signature.is_empty() {
            return Ok(None);
        }
        Signature::parse(signature).map(Some)
    }

    /// Register `function` under the next call number. An empty signature
    /// accepts any arguments.
    pub fn register(
        &mut self,
        name: &str,
        signature: &str,
        function: KernelFn,
    ) -> Result<u16, SignatureError> {
        Ok(self.insert(KernelFunction {
            name: name.to_owned(),
            signature: Self::parse(signature)?,
            function: Some(function),
            sub_functions: Vec::new(),
            workarounds: WorkaroundTable::default(),
        }))
    }

    /// Reserve a call number for a function the host does not provide.
    pub fn register_unimplemented(&mut self, name: &str) -> u16 {
        self.insert(KernelFunction {
            name: name.to_owned(),
            signature: None,
            function: None,
            sub_functions: Vec::new(),
            workarounds: WorkaroundTable::default(),
        })
    }

    /// Register a function dispatching on its first argument.
    pub fn register_with_subs(
        &mut self,
        name: &str,
        subs: &[(&str, &str, KernelFn)],
    ) -> Result<u16, SignatureError> {
        let sub_functions = subs
            .iter()
            .map(|&(name, signature, function)| {
                Ok(KernelSubFunction {
                    name: name.to_owned(),
                    signature: Self::parse(signature)?,
                    function: Some(function),
                    workarounds: WorkaroundTable::default(),
                })
            })
            .collect::<Result<Vec<_>, SignatureError>>()?;
        Ok(self.insert(KernelFunction {
            name: name.to_owned(),
            signature: None,
            function: None,
            sub_functions,
            workarounds: WorkaroundTable::default(),
        }))
    }

    pub fn insert(&mut self, function: KernelFunction) -> u16 {
        self.functions.push(function);
        (self.functions.len() - 1) as u16
    }

    pub fn get(&self, number: u16) -> Option<&KernelFunction> {
        self.functions.get(number as usize)
    }

    pub fn get_mut(&mut self, number: u16) -> Option<&mut KernelFunction> {
        self.functions.get_mut(number as usize)
    }

    pub fn find(&self, name: &str) -> Option<u16> {
        self.functions.iter().position(|f| f.name == name).map(|i| i as u16)
    }

    /// Display name of a call, using the sub-function name when given.
    pub fn name(&self, number: u16, sub: Option<u16>) -> String {
        let Some(function) = self.get(number) else {
            return format!("<invalid kernel {number:#x}>");
        };
        match sub.and_then(|s| function.sub_functions.get(s as usize)) {
            Some(sub) => sub.name.clone(),
            None => function.name.clone(),
        }
    }

    /// Add a workaround to a function, or to one of its sub-functions.
    pub fn add_workaround(&mut self, number: u16, sub: Option<u16>, entry: WorkaroundEntry) -> bool {
        let Some(function) = self.get_mut(number) else {
            return false;
        };
        match sub {
            None => function.workarounds.add(entry),
            Some(s) => match function.sub_functions.get_mut(s as usize) {
                Some(sub) => sub.workarounds.add(entry),
                None => return false,
            },
        }
        true
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// What a `callk` resolves to before anything runs.
enum KernelCall {
    /// A workaround said to skip the call.
    Skip,
    /// A workaround supplied the result.
    Fake(Reg),
    Call {
        function: KernelFn,
        sub: Option<u16>,
        name: String,
    },
}

impl VM {
    fn check_signature(
        &self,
        name: &str,
        signature: Option<&Signature>,
        workarounds: &WorkaroundTable,
        types: &[RegType],
    ) -> Result<Option<KernelCall>, VmError> {
        let Some(signature) = signature else { return Ok(None) };
        if signature.matches(types) {
            return Ok(None);
        }
        match self.find_workaround(workarounds, None) {
            Some(WorkaroundSolution::Ignore) => Ok(Some(KernelCall::Skip)),
            Some(WorkaroundSolution::Fake(value)) => Ok(Some(KernelCall::Fake(Reg::word(value)))),
            Some(WorkaroundSolution::StillCall) => Ok(None),
            None => Err(VmError::SignatureMismatch {
                name: name.to_owned(),
                signature: signature.to_string(),
                arguments: describe_args(types),
            }),
        }
    }

    fn resolve_kernel(&self, number: u16, args: &[Reg]) -> Result<KernelCall, VmError> {
        let entry = self
            .kernel
            .get(number)
            .ok_or(VmError::InvalidKernelFunction(number))?;
        let types: Vec<RegType> = args.iter().map(|&a| self.segments.reg_type(a)).collect();
        if let Some(early) =
            self.check_signature(&entry.name, entry.signature.as_ref(), &entry.workarounds, &types)?
        {
            return Ok(early);
        }
        if !entry.has_sub_functions() {
            let function = entry
                .function
                .ok_or_else(|| VmError::UnimplementedKernel { name: entry.name.clone() })?;
            return Ok(KernelCall::Call {
                function,
                sub: None,
                name: entry.name.clone(),
            });
        }

        let first = args.first().copied();
        let Some(sub) = first
            .and_then(Reg::as_u16)
            .filter(|&s| (s as usize) < entry.sub_functions.len())
        else {
            return Err(VmError::InvalidKernelSubFunction {
                name: entry.name.clone(),
                sub: first.unwrap_or(Reg::NULL),
            });
        };
        let sub_entry = &entry.sub_functions[sub as usize];
        if let Some(early) = self.check_signature(
            &sub_entry.name,
            sub_entry.signature.as_ref(),
            &sub_entry.workarounds,
            &types[1..],
        )? {
            return Ok(early);
        }
        let function = sub_entry
            .function
            .ok_or_else(|| VmError::UnimplementedKernel { name: sub_entry.name.clone() })?;
        Ok(KernelCall::Call {
            function,
            sub: Some(sub),
            name: sub_entry.name.clone(),
        })
    }

    /// Call kernel function `number` with the `argc` arguments after the
    /// argc slot at `argp`, leaving its result in the accumulator.
    ///
    /// A sub-function sees its arguments without the sub-function number.
    pub(crate) fn call_kernel(&mut self, number: u16, argc: usize, argp: usize) -> Result<(), StepError> {
        let args = self.stack.slice(argp + 1, argc)?.to_vec();
        let (function, sub, name) = match self.resolve_kernel(number, &args)? {
            KernelCall::Skip => return Ok(()),
            KernelCall::Fake(value) => {
                self.acc = value;
                return Ok(());
            }
            KernelCall::Call { function, sub, name } => (function, sub, name),
        };
        let action = self.check_kernel_breakpoint(&name);
        if action == Some(BreakpointAction::Ignore) {
            return Ok(());
        }
        let (argp, args) = match sub {
            Some(_) => (argp + 1, &args[1..]),
            None => (argp, &args[..]),
        };

        let frame = {
            let caller = self.frame()?;
            let mut frame = ExecFrame::call(caller.pc, argp, caller.objp, args.len() as u16, argp);
            frame.kind = FrameKind::Kernel { function: number, sub };
            frame.sendp = caller.sendp;
            frame.local_script = caller.local_script;
            frame.origin = self.exec.len().checked_sub(1);
            frame
        };
        let index = self.push_frame(frame)?;
        let result = function(self, args)?;
        self.exec.truncate(index);
        self.acc = result;

        if action == Some(BreakpointAction::Log) {
            let args: Vec<String> = args.iter().map(ToString::to_string).collect();
            let line = format!("k{name}({}) = {result}", args.join(", "));
            self.debug.console.print(&line);
        } else {
            debug!("k{name} = {result}");
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
