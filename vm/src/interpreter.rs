//! The fetch-decode-execute loop.
//!
//! The live `pc`, `sp` and `fp` belong to the top exec frame. Calls and
//! sends push frames and return to the loop; only kernel functions that
//! call back into scripts start a nested [`VM::run`].

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{trace, warn};
use sci_bytecode::{Instruction, VarClass, VarOp, VarOpKind, decode};
use sci_object::{ArithmeticError, CodePos, Reg, SegmentError};

use crate::VM;
use crate::debug::{Resume, StopInfo};
use crate::error::{Fault, RunError, StepError, VmError};
use crate::exec_stack::{ExecFrame, FrameKind};
use crate::workarounds::WorkaroundSolution;

/// Stops a running VM from another thread or from a kernel function.
///
/// The flag stays set until [`AbortHandle::reset`], so every nested run
/// unwinds.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The base frame of the current run returned.
    Return,
}

/// Registers of an interrupted run, restored when a nested one ends.
pub(crate) struct SavedRegisters {
    acc: Reg,
    prev: Reg,
    rest: u16,
}

impl VM {
    /// Execute from the top frame until it returns, yielding the
    /// accumulator.
    ///
    /// A fatal error drops every frame of this run. An abort leaves them in
    /// place for the host to tear down with [`VM::reset_execution`].
    pub fn run(&mut self) -> Result<Reg, RunError> {
        if self.exec.is_empty() {
            return Err(self.fatal(VmError::NoActiveFrame));
        }
        let outer_base = self.exec.base();
        self.exec.set_base(self.exec.len() - 1);
        let result = if self.run_depth >= self.settings.max_run_depth {
            Err(self.fatal(VmError::RunDepthExceeded(self.run_depth)))
        } else {
            self.run_depth += 1;
            self.refresh_variables();
            let result = self.run_loop();
            self.run_depth -= 1;
            result
        };
        if let Err(RunError::Fatal(_)) = result {
            self.exec.truncate(self.exec.base());
        }
        self.exec.set_base(outer_base);
        result
    }

    fn run_loop(&mut self) -> Result<Reg, RunError> {
        loop {
            if self.abort.is_aborted() {
                return Err(RunError::Aborted);
            }
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return) => return Ok(self.acc),
                Err(StepError::Fatal(e)) => return Err(self.fatal(e)),
                Err(StepError::Run(e)) => return Err(e),
            }
        }
    }

    /// Call export `export` of `script`, loading the script if needed.
    pub fn run_export(&mut self, script: u16, export: u16, args: &[Reg]) -> Result<Reg, RunError> {
        let argp = self.free_slot();
        let objp = self.exec.top().map_or(Reg::NULL, |f| f.objp);
        let saved = self.save_registers();
        if let Err(e) = self.enter_export(script, export, argp, objp, args) {
            let error = self.fatal(e);
            self.restore_registers(saved);
            return Err(error);
        }
        let result = self.run();
        self.restore_registers(saved);
        result
    }

    fn enter_export(
        &mut self,
        script: u16,
        export: u16,
        argp: usize,
        objp: Reg,
        args: &[Reg],
    ) -> Result<(), VmError> {
        self.stack.set(argp, Reg::word(args.len() as u16))?;
        for (i, &arg) in args.iter().enumerate() {
            self.stack.set(argp + 1 + i, arg)?;
        }
        let sp = argp + 1 + args.len();
        self.execute_method(script, export, sp, objp, args.len() as u16, argp)
    }

    /// First stack slot a nested call may use.
    pub(crate) fn free_slot(&self) -> usize {
        match self.exec.top() {
            Some(f) if matches!(f.kind, FrameKind::Kernel { .. }) => f.argp + 1 + f.argc as usize,
            Some(f) => f.sp,
            None => 0,
        }
    }

    /// Stash the registers if a run is in progress, and clear `&rest`.
    pub(crate) fn save_registers(&mut self) -> Option<SavedRegisters> {
        let saved = (!self.exec.is_empty()).then_some(SavedRegisters {
            acc: self.acc,
            prev: self.prev,
            rest: self.rest,
        });
        self.rest = 0;
        saved
    }

    pub(crate) fn restore_registers(&mut self, saved: Option<SavedRegisters>) {
        if let Some(saved) = saved {
            self.acc = saved.acc;
            self.prev = saved.prev;
            self.rest = saved.rest;
        }
    }

    /// Push a frame for an export, instantiating its script on demand.
    pub(crate) fn execute_method(
        &mut self,
        script: u16,
        export: u16,
        sp: usize,
        objp: Reg,
        argc: u16,
        argp: usize,
    ) -> Result<(), VmError> {
        let segment = match self.segments.script_segment(script) {
            Some(segment) => segment,
            None => self.segments.instantiate_script(script)?,
        };
        self.check_export_breakpoint(script, export);
        let offset = self
            .segments
            .script(segment)
            .and_then(|s| s.export(export))
            .ok_or(VmError::InvalidExport { script, export })?;
        let mut frame = ExecFrame::call(CodePos::new(segment, offset), sp, objp, argc, argp);
        frame.export = Some(export);
        frame.origin = self.exec.len().checked_sub(1);
        self.push_frame(frame)?;
        Ok(())
    }

    /// Execute one instruction of the top frame.
    pub(crate) fn step(&mut self) -> Result<Flow, StepError> {
        if self.exec.take_changed() {
            self.refresh_variables();
        }
        let (pos, sp, fp) = {
            let frame = self.frame()?;
            (frame.pc, frame.sp, frame.fp)
        };
        self.vars.temp_max = sp.saturating_sub(fp);

        let Some(size) = self.segments.script(pos.segment).map(|s| s.size()) else {
            warn!("script of {pos} was unloaded, returning");
            return Ok(self.op_ret()?);
        };
        if sp < fp {
            return Err(VmError::StackUnderflow.into());
        }
        if pos.offset as usize >= size {
            return Err(VmError::PcOutOfBounds { pos, size }.into());
        }

        self.check_address_breakpoint(pos);
        if self.debug.trace {
            self.trace_instruction(pos);
        }
        if self.debug.debugging {
            let disassembly = self
                .disassemble(pos, true, true)
                .map_or_else(|e| format!("{pos}: <{e}>"), |(text, _)| text);
            let stop = StopInfo {
                pos,
                disassembly,
                frame: self.exec.len() - 1,
            };
            match self.debug.console.stopped(&stop) {
                Resume::Continue => self.debug.debugging = false,
                Resume::Step => {}
                Resume::Abort => {
                    self.debug.debugging = false;
                    self.abort.abort();
                    return Err(RunError::Aborted.into());
                }
            }
        }

        let instruction = {
            let script = self
                .segments
                .script(pos.segment)
                .ok_or(SegmentError::InvalidReference(pos.into()))?;
            let decoded = decode(&script.bytecode, pos.offset as usize, &self.formats)?;
            let instruction = Instruction::from_decoded(&decoded, pos.offset as usize)?;
            let next = CodePos::new(pos.segment, pos.offset + decoded.size as u32);
            self.frame_mut()?.pc = next;
            instruction
        };
        trace!("{pos}: {instruction}");
        self.execute(instruction)
    }

    /// Print the instruction at `pos`. Disassembly failures are only logged.
    fn trace_instruction(&mut self, pos: CodePos) {
        match self.disassemble(pos, true, true) {
            Ok((line, _)) => self.debug.console.print(&line),
            Err(e) => warn!("cannot trace {pos}: {e}"),
        }
    }

    fn execute(&mut self, instruction: Instruction) -> Result<Flow, StepError> {
        let next = self.frame()?.pc;
        match instruction {
            Instruction::Bnot => self.acc = self.arith(self.acc.bnot())?,
            Instruction::Add => self.binary(Reg::add)?,
            Instruction::Sub => self.binary(Reg::sub)?,
            Instruction::Mul => self.binary(Reg::mul)?,
            Instruction::Div => self.binary(Reg::div)?,
            Instruction::Mod => {
                let op: fn(Reg, Reg) -> Result<Reg, ArithmeticError> =
                    if self.settings.truncating_modulo { Reg::remainder } else { Reg::modulo };
                self.binary(op)?
            }
            Instruction::Shr => self.binary(Reg::shr)?,
            Instruction::Shl => self.binary(Reg::shl)?,
            Instruction::Xor => self.binary(Reg::xor)?,
            Instruction::And => self.binary(Reg::and)?,
            Instruction::Or => self.binary(Reg::or)?,
            Instruction::Neg => self.acc = self.arith(self.acc.neg())?,
            Instruction::Not => self.acc = Reg::bool(!self.acc.is_true()),
            Instruction::Eq | Instruction::Ne => {
                self.prev = self.acc;
                let lhs = self.pop()?;
                let equal = lhs == self.acc;
                self.acc = Reg::bool(equal == matches!(instruction, Instruction::Eq));
            }
            Instruction::Gt => self.compare(false, CmpOrdering::is_gt)?,
            Instruction::Ge => self.compare(false, CmpOrdering::is_ge)?,
            Instruction::Lt => self.compare(false, CmpOrdering::is_lt)?,
            Instruction::Le => self.compare(false, CmpOrdering::is_le)?,
            Instruction::Ugt => self.compare(true, CmpOrdering::is_gt)?,
            Instruction::Uge => self.compare(true, CmpOrdering::is_ge)?,
            Instruction::Ult => self.compare(true, CmpOrdering::is_lt)?,
            Instruction::Ule => self.compare(true, CmpOrdering::is_le)?,

            Instruction::Bt { offset } => {
                if self.acc.is_true() {
                    self.frame_mut()?.pc = self.relative_target(next, offset)?;
                }
            }
            Instruction::Bnt { offset } => {
                if !self.acc.is_true() {
                    self.frame_mut()?.pc = self.relative_target(next, offset)?;
                }
            }
            Instruction::Jmp { offset } => {
                self.frame_mut()?.pc = self.relative_target(next, offset)?;
            }

            Instruction::Ldi { value } => self.acc = Reg::from(value),
            Instruction::Push => self.push(self.acc)?,
            Instruction::Pushi { value } => self.push(Reg::from(value))?,
            Instruction::Toss => {
                self.pop()?;
            }
            Instruction::Dup => {
                let sp = self.frame()?.sp;
                let top = self.stack.get(sp.checked_sub(1).ok_or(VmError::StackUnderflow)?)?;
                self.push(top)?;
            }
            Instruction::Link { count } => {
                for _ in 0..count {
                    self.push(Reg::UNINITIALIZED)?;
                }
            }

            Instruction::Call { offset, frame } => self.call_local(offset, frame, next)?,
            Instruction::Callk { function, frame } => self.callk(function, frame)?,
            Instruction::Callb { export, frame } => self.call_export(0, export, frame)?,
            Instruction::Calle { script, export, frame } => self.call_export(script, export, frame)?,
            Instruction::Ret => return Ok(self.op_ret()?),
            Instruction::Send { frame } => self.send(self.acc, self.acc, frame)?,
            Instruction::SelfSend { frame } => {
                let objp = self.frame()?.objp;
                self.send(objp, objp, frame)?;
            }
            Instruction::Super { class, frame } => {
                let superclass = self.segments.class_address(class)?;
                let objp = self.frame()?.objp;
                self.send(superclass, objp, frame)?;
            }
            Instruction::Class { class } => self.acc = self.segments.class_address(class)?,
            Instruction::Rest { first } => self.op_rest(first)?,
            Instruction::Lea { kind, index } => {
                let kind = kind >> 1;
                let class = VarClass::from_bits(kind as u8);
                let mut index = index as i32;
                if kind & 0x08 != 0 {
                    index += self.acc_index()?;
                }
                self.acc = self.variable_address(class, index)?;
            }
            Instruction::SelfId => self.acc = self.frame()?.objp,
            Instruction::Pprev => self.push(self.prev)?,
            Instruction::PushSelf => {
                let objp = self.frame()?.objp;
                self.push(objp)?;
            }
            Instruction::Push0 => self.push(Reg::int(0))?,
            Instruction::Push1 => self.push(Reg::int(1))?,
            Instruction::Push2 => self.push(Reg::int(2))?,

            Instruction::PToA { property } => self.acc = self.property(property)?,
            Instruction::AToP { property } => self.set_property(property, self.acc)?,
            Instruction::PToS { property } => {
                let value = self.property(property)?;
                self.push(value)?;
            }
            Instruction::SToP { property } => {
                let value = self.pop()?;
                self.set_property(property, value)?;
            }
            Instruction::IpToA { property } => self.acc = self.bump_property(property, 1)?,
            Instruction::DpToA { property } => self.acc = self.bump_property(property, -1)?,
            Instruction::IpToS { property } => {
                let value = self.bump_property(property, 1)?;
                self.push(value)?;
            }
            Instruction::DpToS { property } => {
                let value = self.bump_property(property, -1)?;
                self.push(value)?;
            }

            Instruction::Lofsa { operand } => self.acc = self.literal_address(next, operand)?,
            Instruction::Lofss { operand } => {
                let address = self.literal_address(next, operand)?;
                self.push(address)?;
            }
            Instruction::Line { .. } | Instruction::File => {}
            Instruction::Var { op, index } => self.var_op(op, index)?,
        }
        Ok(Flow::Continue)
    }

    // ── stack ──────────────────────────────────────────────────────

    pub(crate) fn push(&mut self, value: Reg) -> Result<(), VmError> {
        let frame = self.frame_mut()?;
        let sp = frame.sp;
        frame.sp += 1;
        self.stack.set(sp, value)
    }

    pub(crate) fn pop(&mut self) -> Result<Reg, VmError> {
        let frame = self.frame_mut()?;
        let sp = frame.sp.checked_sub(1).ok_or(VmError::StackUnderflow)?;
        frame.sp = sp;
        self.stack.get(sp)
    }

    // ── arithmetic ─────────────────────────────────────────────────

    /// Take an arithmetic result, consulting the workarounds on failure.
    fn arith(&self, result: Result<Reg, ArithmeticError>) -> Result<Reg, VmError> {
        result.or_else(|e| match self.find_workaround(&self.workarounds.arithmetic, None) {
            Some(WorkaroundSolution::Fake(value)) => Ok(Reg::word(value)),
            _ => Err(e.into()),
        })
    }

    /// `acc = pop op acc`.
    fn binary(&mut self, op: fn(Reg, Reg) -> Result<Reg, ArithmeticError>) -> Result<(), VmError> {
        let lhs = self.pop()?;
        self.acc = self.arith(op(lhs, self.acc))?;
        Ok(())
    }

    fn compare(&mut self, unsigned: bool, test: fn(CmpOrdering) -> bool) -> Result<(), VmError> {
        self.prev = self.acc;
        let lhs = self.pop()?;
        let ordering = lhs
            .compare(self.acc, unsigned, self.settings.pointer_compare_limit)
            .map(|o| Reg::bool(test(o)));
        self.acc = self.arith(ordering)?;
        Ok(())
    }

    fn acc_index(&self) -> Result<i32, VmError> {
        self.acc.as_i16().map(i32::from).ok_or(VmError::NotAnInteger(self.acc))
    }

    // ── control flow ───────────────────────────────────────────────

    fn relative_target(&self, next: CodePos, offset: i16) -> Result<CodePos, VmError> {
        let target = next.offset as i64 + offset as i64;
        let script = self
            .segments
            .script(next.segment)
            .ok_or(SegmentError::InvalidReference(next.into()))?;
        if target < 0 || target as usize >= script.size() {
            return Err(VmError::JumpOutOfBounds {
                script: script.number,
                target,
                size: script.size(),
            });
        }
        Ok(CodePos::new(next.segment, target as u32))
    }

    fn call_local(&mut self, offset: i16, frame_bytes: u16, next: CodePos) -> Result<(), VmError> {
        let rest = self.rest;
        let (sp, objp, local_script) = {
            let frame = self.frame()?;
            (frame.sp, frame.objp, frame.local_script)
        };
        let call_base = sp
            .checked_sub(frame_bytes as usize / 2 + 1 + rest as usize)
            .ok_or(VmError::StackUnderflow)?;
        let argc = self.integer_at(call_base)?.wrapping_add(rest);
        let target = self.relative_target(next, offset)?;

        let mut frame = ExecFrame::call(target, sp, objp, argc, call_base);
        frame.local_call_offset = Some(target.offset);
        frame.local_script = local_script;
        frame.origin = self.exec.len().checked_sub(1);
        self.frame_mut()?.sp = call_base;
        self.push_frame(frame)?;
        self.rest = 0;
        Ok(())
    }

    fn callk(&mut self, function: u16, frame_bytes: u16) -> Result<(), StepError> {
        self.tick_gc();
        let legacy = self.settings.legacy_kernel_rest;
        let rest = if legacy { 0 } else { self.rest as usize };
        let sp = self.frame()?.sp;
        let argp = sp
            .checked_sub(frame_bytes as usize / 2 + 1 + rest)
            .ok_or(VmError::StackUnderflow)?;
        let argc = self.integer_at(argp)? as usize + rest;
        self.frame_mut()?.sp = argp;
        let result = self.call_kernel(function, argc, argp);
        if !legacy {
            self.rest = 0;
        }
        result
    }

    fn call_export(&mut self, script: u16, export: u16, frame_bytes: u16) -> Result<(), VmError> {
        let rest = self.rest;
        let (sp, objp) = {
            let frame = self.frame()?;
            (frame.sp, frame.objp)
        };
        let argp = sp
            .checked_sub(frame_bytes as usize / 2 + rest as usize + 1)
            .ok_or(VmError::StackUnderflow)?;
        let argc = self.integer_at(argp)?.wrapping_add(rest);
        self.stack.set(argp, Reg::word(argc))?;
        self.frame_mut()?.sp = argp;
        self.execute_method(script, export, sp, objp, argc, argp)?;
        self.rest = 0;
        Ok(())
    }

    fn send(&mut self, send_obj: Reg, work_obj: Reg, frame_bytes: u16) -> Result<(), VmError> {
        let rest = self.rest;
        let sp = self.frame()?.sp;
        let words = frame_bytes as usize / 2 + rest as usize;
        let argp = sp.checked_sub(words).ok_or(VmError::StackUnderflow)?;
        if rest > 0 {
            let argc = self.integer_at(argp + 1)?;
            self.stack.set(argp + 1, Reg::word(argc.wrapping_add(rest)))?;
        }
        self.frame_mut()?.sp = argp;
        self.rest = 0;
        self.send_selector(send_obj, work_obj, sp, words, argp)
    }

    /// Return from the top frame, performing any property accesses queued
    /// beneath it by a send.
    fn op_ret(&mut self) -> Result<Flow, VmError> {
        loop {
            let top = self.exec.len().checked_sub(1).ok_or(VmError::NoActiveFrame)?;
            if top == self.exec.base() {
                self.exec.pop();
                return Ok(Flow::Return);
            }
            let old = self.exec.pop().ok_or(VmError::NoActiveFrame)?;
            if old.is_var_selector() {
                self.exec_varselector(&old)?;
            }
            let frame = self.frame_mut()?;
            if frame.sp_carried || !frame.is_call() {
                frame.sp = old.sp;
                frame.fp = old.fp;
                frame.sp_carried = false;
            }
            if !frame.is_var_selector() {
                return Ok(Flow::Continue);
            }
        }
    }

    /// `&rest first`: push parameters `first..=argc` and carry their count
    /// into the next call.
    fn op_rest(&mut self, first: u16) -> Result<(), VmError> {
        let (argc, argp) = {
            let frame = self.frame()?;
            (frame.argc, frame.argp)
        };
        self.rest = (argc as i32 - first as i32 + 1).max(0) as u16;
        for i in first..=argc {
            let value = self.stack.get(argp + i as usize)?;
            self.push(value)?;
        }
        Ok(())
    }

    // ── properties and variables ───────────────────────────────────

    fn property(&mut self, operand: u16) -> Result<Reg, VmError> {
        self.read_property(operand as usize >> 1).or_else(Fault::recover)
    }

    fn set_property(&mut self, operand: u16, value: Reg) -> Result<(), VmError> {
        self.write_property(operand as usize >> 1, value)
            .or_else(|fault| fault.recover().map(drop))
    }

    fn bump_property(&mut self, operand: u16, delta: i32) -> Result<Reg, VmError> {
        let value = self.property(operand)?;
        let value = self.arith(value.add(Reg::int(delta)))?;
        self.set_property(operand, value)?;
        Ok(value)
    }

    fn literal_address(&self, next: CodePos, operand: i32) -> Result<Reg, VmError> {
        let script = self
            .segments
            .script(next.segment)
            .ok_or(SegmentError::InvalidReference(next.into()))?;
        let offset = self.segments.loader().resolve_literal(script, next.offset, operand);
        Ok(Reg::pointer(next.segment, offset))
    }

    fn put(&mut self, on_stack: bool, value: Reg) -> Result<(), VmError> {
        if on_stack {
            self.push(value)
        } else {
            self.acc = value;
            Ok(())
        }
    }

    fn var_op(&mut self, op: VarOp, index: u16) -> Result<(), VmError> {
        let mut index = index as i32;
        if op.indexed {
            index += self.acc_index()?;
        }
        match op.kind {
            VarOpKind::Load => {
                let value = self.load_var(op.class, index)?;
                self.put(op.stack, value)
            }
            VarOpKind::Store => {
                let value = if op.stack {
                    self.pop()?
                } else {
                    // the index was taken from the old accumulator
                    if op.indexed {
                        self.acc = self.pop()?;
                    }
                    self.acc
                };
                self.store_var(op.class, index, value)
            }
            VarOpKind::Increment | VarOpKind::Decrement => {
                let delta = if op.kind == VarOpKind::Increment { 1 } else { -1 };
                let value = self.load_var(op.class, index)?;
                let value = self.arith(value.add(Reg::int(delta)))?;
                self.put(op.stack, value)?;
                self.store_var(op.class, index, value)
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{BreakpointAction, BreakpointKind, BufferedConsole};
    use crate::error::CallOrigin;
    use crate::kernel::{KernelFn, KernelRegistry};
    use crate::settings::{UninitializedReadPolicy, VmSettings};
    use crate::testing::{self, TestGame, var_op};
    use crate::workarounds::WorkaroundEntry;
    use sci_bytecode::{BytecodeBuilder, Op};
    use sci_object::SegmentId;

    fn export(code: BytecodeBuilder) -> VM {
        TestGame::new().export(code).build()
    }

    fn with_ego(mut vm: VM) -> VM {
        let ego = testing::object(&vm, "ego");
        vm.store_var(VarClass::Global, 1, ego).unwrap();
        vm
    }

    #[test]
    fn arithmetic_on_the_accumulator() {
        let mut code = BytecodeBuilder::new();
        code.pushi(2);
        code.ldi(3);
        code.op(Op::Add);
        code.ret();
        let mut vm = export(code);
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(5)));
        assert!(vm.exec.is_empty());
    }

    #[test]
    fn comparisons_keep_the_previous_accumulator() {
        let mut code = BytecodeBuilder::new();
        code.pushi(-1);
        code.ldi(1);
        code.op(Op::Ult);
        code.push();
        code.pprev();
        code.op(Op::Add);
        code.ret();
        // -1 is 0xffff unsigned, so ult? is false; prev is 1
        assert_eq!(export(code).run_export(0, 0, &[]), Ok(Reg::int(1)));
    }

    #[test]
    fn branches_loop_until_done() {
        // temp0 = 0; while temp0 < 5: temp0 += 1
        let mut code = BytecodeBuilder::new();
        code.link(1);
        code.ldi(0);
        code.var(var_op(VarOpKind::Store, VarClass::Temp, false), 0);
        let top = code.current_offset();
        code.var(var_op(VarOpKind::Load, VarClass::Temp, true), 0);
        code.ldi(5);
        code.op(Op::Lt);
        let done = code.bnt();
        code.var(var_op(VarOpKind::Increment, VarClass::Temp, false), 0);
        code.branch_to(Op::Jmp, top);
        code.bind(done);
        code.var(var_op(VarOpKind::Load, VarClass::Temp, false), 0);
        code.ret();
        assert_eq!(export(code).run_export(0, 0, &[]), Ok(Reg::int(5)));
    }

    #[test]
    fn rest_forwards_trailing_parameters() {
        let mut code = BytecodeBuilder::new();
        code.push0();
        code.rest(2);
        let procedure = code.call(0);
        code.ret();
        code.bind(procedure);
        code.var(var_op(VarOpKind::Load, VarClass::Param, false), 0);
        code.push();
        code.var(var_op(VarOpKind::Load, VarClass::Param, false), 1);
        code.push();
        code.var(var_op(VarOpKind::Load, VarClass::Param, false), 2);
        code.op(Op::Add);
        code.op(Op::Mul);
        code.ret();
        let mut vm = export(code);
        let args = [Reg::int(10), Reg::int(20), Reg::int(30)];
        // argc 2, params 20 and 30
        assert_eq!(vm.run_export(0, 0, &args), Ok(Reg::int(100)));
        assert_eq!(vm.rest, 0);
    }

    #[test]
    fn calls_into_exports() {
        let mut caller = BytecodeBuilder::new();
        caller.push1();
        caller.pushi(21);
        caller.calle(0, 1, 1);
        caller.ret();
        let mut double = BytecodeBuilder::new();
        double.var(var_op(VarOpKind::Load, VarClass::Param, true), 1);
        double.ldi(2);
        double.op(Op::Mul);
        double.ret();
        let mut vm = TestGame::new().export(caller).export(double).build();
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(42)));
        assert!(matches!(
            vm.run_export(0, 7, &[]).unwrap_err().vm_error(),
            Some(VmError::InvalidExport { script: 0, export: 7 })
        ));
    }

    #[test]
    fn super_reaches_the_class_method() {
        let mut base = BytecodeBuilder::new();
        base.ldi(5);
        base.ret();
        let mut derived = BytecodeBuilder::new();
        derived.pushi(testing::vocab("doit"));
        derived.push0();
        derived.super_send(1, 2);
        derived.push();
        derived.ldi(1);
        derived.op(Op::Add);
        derived.ret();
        let mut caller = BytecodeBuilder::new();
        caller.pushi(testing::vocab("doit"));
        caller.push0();
        testing::load_global(&mut caller, 1);
        caller.send(2);
        caller.ret();
        let vm = TestGame::new()
            .method("Actor", "doit", base)
            .method("ego", "doit", derived)
            .export(caller)
            .build();
        assert_eq!(with_ego(vm).run_export(0, 0, &[]), Ok(Reg::int(6)));
    }

    #[test]
    fn errors_name_the_failing_method() {
        let mut doit = BytecodeBuilder::new();
        doit.pushi(testing::vocab("init"));
        doit.push0();
        doit.self_send(2);
        doit.ret();
        let mut caller = BytecodeBuilder::new();
        caller.pushi(testing::vocab("doit"));
        caller.push0();
        testing::load_global(&mut caller, 1);
        caller.send(2);
        caller.ret();
        let vm = TestGame::new().method("ego", "doit", doit).export(caller).build();
        let mut vm = with_ego(vm);
        let err = vm.run_export(0, 0, &[]).unwrap_err();
        let RunError::Fatal(script_error) = &err else { panic!("expected a fatal error") };
        assert_eq!(script_error.origin.object, "ego");
        assert_eq!(script_error.origin.method, "doit");
        assert!(err.to_string().contains("ego::doit"));
        assert!(vm.exec.is_empty());
    }

    fn uninitialized_temp() -> BytecodeBuilder {
        let mut code = BytecodeBuilder::new();
        code.link(1);
        code.var(var_op(VarOpKind::Load, VarClass::Temp, false), 0);
        code.ret();
        code
    }

    #[test]
    fn uninitialized_reads_follow_the_policy() {
        let mut lenient = export(uninitialized_temp());
        lenient.acc = Reg::int(9);
        assert_eq!(lenient.run_export(0, 0, &[]), Ok(Reg::NULL));

        let settings = VmSettings {
            uninit_policy: UninitializedReadPolicy::Strict,
            ..VmSettings::default()
        };
        let mut strict = TestGame::new().settings(settings).export(uninitialized_temp()).build();
        let err = strict.run_export(0, 0, &[]).unwrap_err();
        assert_eq!(
            err.vm_error(),
            Some(&VmError::UninitializedRead { class: VarClass::Temp, index: 0 })
        );
    }

    #[test]
    fn arithmetic_workaround_fakes_the_result() {
        let mut code = BytecodeBuilder::new();
        testing::load_global(&mut code, 1);
        code.push();
        code.op(Op::Mul);
        code.ret();
        let mut vm = with_ego(export(code));
        assert!(matches!(
            vm.run_export(0, 0, &[]).unwrap_err().vm_error(),
            Some(VmError::Arithmetic(_))
        ));
        vm.workarounds
            .arithmetic
            .add(WorkaroundEntry::new("export 0", WorkaroundSolution::Fake(3)));
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(3)));
    }

    fn must_not_run(_: &mut VM, _: &[Reg]) -> Result<Reg, RunError> {
        panic!("kernel function called despite the workaround")
    }

    fn echo_plus_one(_: &mut VM, args: &[Reg]) -> Result<Reg, RunError> {
        Ok(args[0].add(Reg::int(1)).unwrap())
    }

    fn invoke_doit(vm: &mut VM, _: &[Reg]) -> Result<Reg, RunError> {
        let ego = testing::object(vm, "ego");
        let doit = testing::selector(vm, "doit");
        vm.invoke_selector(ego, doit, &[])
    }

    fn outer_state(vm: &VM) -> (usize, usize, u16, Reg, Reg) {
        (vm.exec.len(), vm.exec.base(), vm.rest, vm.acc, vm.prev)
    }

    fn invoke_doit_checked(vm: &mut VM, args: &[Reg]) -> Result<Reg, RunError> {
        let before = outer_state(vm);
        let result = invoke_doit(vm, args);
        assert_eq!(outer_state(vm), before);
        result
    }

    /// Runs a failing `doit` and hands back -1 instead of the error.
    fn swallow_failure(vm: &mut VM, args: &[Reg]) -> Result<Reg, RunError> {
        let before = outer_state(vm);
        let err = invoke_doit(vm, args).unwrap_err();
        assert!(matches!(err.vm_error(), Some(VmError::Arithmetic(_))));
        assert_eq!(outer_state(vm), before);
        Ok(Reg::int(-1))
    }

    fn abort_now(vm: &mut VM, _: &[Reg]) -> Result<Reg, RunError> {
        vm.abort_handle().abort();
        Ok(Reg::NULL)
    }

    fn call_kernel_with_ego(kernel: KernelRegistry, number: u16) -> VM {
        let mut code = BytecodeBuilder::new();
        code.push1();
        testing::load_global(&mut code, 1);
        code.push();
        code.callk(number, 1);
        code.ret();
        with_ego(TestGame::new().kernel(kernel).export(code).build())
    }

    #[test]
    fn signature_workaround_skips_the_call() {
        let mut kernel = KernelRegistry::new();
        let number = kernel.register("GetThing", "i", must_not_run).unwrap();
        kernel.add_workaround(
            number,
            None,
            WorkaroundEntry::new("export 0", WorkaroundSolution::Fake(7)),
        );
        let mut vm = call_kernel_with_ego(kernel, number);
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(7)));
    }

    #[test]
    fn signature_mismatch_describes_the_arguments() {
        let mut kernel = KernelRegistry::new();
        let number = kernel.register("GetThing", "i", must_not_run).unwrap();
        let mut vm = call_kernel_with_ego(kernel, number);
        let err = vm.run_export(0, 0, &[]).unwrap_err();
        assert_eq!(
            err.vm_error(),
            Some(&VmError::SignatureMismatch {
                name: "GetThing".into(),
                signature: "i".into(),
                arguments: "(object)".into(),
            })
        );
    }

    #[test]
    fn sub_functions_dispatch_on_the_first_argument() {
        const ECHO: KernelFn = echo_plus_one;
        let mut kernel = KernelRegistry::new();
        let number = kernel
            .register_with_subs("DoSound", &[("DoSoundInit", "o", ECHO), ("DoSoundPlay", "i", ECHO)])
            .unwrap();
        let mut code = BytecodeBuilder::new();
        code.push2();
        code.var(var_op(VarOpKind::Load, VarClass::Param, true), 1);
        code.pushi(41);
        code.callk(number, 2);
        code.ret();
        let mut vm = TestGame::new().kernel(kernel).export(code).build();
        assert_eq!(vm.run_export(0, 0, &[Reg::int(1)]), Ok(Reg::int(42)));
        let err = vm.run_export(0, 0, &[Reg::int(9)]).unwrap_err();
        assert!(matches!(err.vm_error(), Some(VmError::InvalidKernelSubFunction { .. })));
    }

    #[test]
    fn nested_runs_leave_the_caller_alone() {
        // doit compares, so it clobbers prev
        let mut doit = BytecodeBuilder::new();
        doit.pushi(1);
        doit.ldi(2);
        doit.op(Op::Lt);
        doit.ret();
        let mut kernel = KernelRegistry::new();
        let invoke = kernel.register("Invoke", "i*", invoke_doit_checked).unwrap();

        // the pending &rest must survive the nested run too
        let mut code = BytecodeBuilder::new();
        code.pushi(5);
        code.ldi(3);
        code.op(Op::Gt);
        code.push0();
        code.rest(1);
        code.callk(invoke, 0);
        code.var(var_op(VarOpKind::Store, VarClass::Global, false), 2);
        code.pprev();
        code.ldi(0);
        code.op(Op::Add);
        code.ret();
        let mut vm = TestGame::new()
            .kernel(kernel)
            .method("ego", "doit", doit)
            .export(code)
            .build();
        assert_eq!(vm.run_export(0, 0, &[Reg::int(8)]), Ok(Reg::int(3)));
        assert_eq!(vm.global(2), Some(Reg::int(1)));
        assert_eq!(vm.run_depth, 0);
        assert!(vm.exec.is_empty());
    }

    #[test]
    fn failed_nested_runs_unwind_only_their_frames() {
        let mut doit = BytecodeBuilder::new();
        doit.push_self();
        doit.ldi(2);
        doit.op(Op::Mul);
        doit.ret();
        let mut kernel = KernelRegistry::new();
        let swallow = kernel.register("Swallow", "", swallow_failure).unwrap();

        let mut code = BytecodeBuilder::new();
        code.push0();
        code.callk(swallow, 0);
        code.ret();
        let mut vm = TestGame::new()
            .kernel(kernel)
            .method("ego", "doit", doit)
            .export(code)
            .build();
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(-1)));
        assert_eq!(vm.run_depth, 0);
        assert!(vm.exec.is_empty());
    }

    #[test]
    fn address_breakpoint_can_abort() {
        let mut code = BytecodeBuilder::new();
        code.ldi(1);
        code.ret();
        let mut vm = export(code);
        let console = BufferedConsole::with_responses([Resume::Abort]);
        vm.debug.set_console(console.clone());
        let seg = vm.segments.script_segment(0).unwrap();
        let entry = vm.segments.script(seg).unwrap().export(0).unwrap();
        let pos = CodePos::new(seg, entry);
        vm.debug.add(BreakpointKind::Address(pos), BreakpointAction::Break);

        assert_eq!(vm.run_export(0, 0, &[]), Err(RunError::Aborted));
        assert_eq!(console.stops()[0].pos, pos);
        assert!(console.lines()[0].starts_with("Break at"));
        // the host tears the frames down
        assert_eq!(vm.exec.len(), 1);
        assert_eq!(vm.exec.frames()[0].pc, pos);
        assert_eq!(vm.exec.base(), 0);
        vm.reset_execution();
        assert!(vm.exec.is_empty());

        vm.abort_handle().reset();
        vm.debug.clear();
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(1)));
    }

    #[test]
    fn kernel_functions_can_abort() {
        let mut kernel = KernelRegistry::new();
        let number = kernel.register("Quit", "", abort_now).unwrap();
        let mut code = BytecodeBuilder::new();
        code.push0();
        code.callk(number, 0);
        code.ldi(1);
        code.ret();
        let mut vm = TestGame::new().kernel(kernel).export(code).build();
        assert_eq!(vm.run_export(0, 0, &[]), Err(RunError::Aborted));
        // the kernel frame is gone, the export's is left
        assert_eq!(vm.exec.len(), 1);
        assert_eq!(vm.exec.frames()[0].export, Some(0));
        assert_eq!(vm.run_depth, 0);

        vm.reset_execution();
        assert!(vm.exec.is_empty());
        assert!(vm.abort_handle().is_aborted());
    }

    #[test]
    fn aborted_nested_runs_keep_every_frame() {
        let mut doit = BytecodeBuilder::new();
        doit.push0();
        doit.callk(1, 0);
        doit.ret();
        let mut kernel = KernelRegistry::new();
        let invoke = kernel.register("Invoke", "", invoke_doit).unwrap();
        let quit = kernel.register("Quit", "", abort_now).unwrap();
        assert_eq!(quit, 1);
        let mut code = BytecodeBuilder::new();
        code.push0();
        code.callk(invoke, 0);
        code.ret();
        let mut vm = TestGame::new()
            .kernel(kernel)
            .method("ego", "doit", doit)
            .export(code)
            .build();
        assert_eq!(vm.run_export(0, 0, &[]), Err(RunError::Aborted));
        // export, kInvoke, ego::doit
        assert_eq!(vm.exec.len(), 3);
        assert_eq!(vm.exec.base(), 0);
        assert_eq!(vm.run_depth, 0);
    }

    fn fatal_origin(err: &RunError) -> &CallOrigin {
        let RunError::Fatal(script_error) = err else { panic!("expected a fatal error") };
        &script_error.origin
    }

    #[test]
    fn jumps_out_of_the_script_are_fatal() {
        let mut code = BytecodeBuilder::new();
        code.ldi(1);
        code.branch_to(Op::Bt, 0x2000);
        code.ret();
        let mut vm = export(code);
        let err = vm.run_export(0, 0, &[]).unwrap_err();
        assert!(matches!(err.vm_error(), Some(VmError::JumpOutOfBounds { script: 0, .. })));
        assert_eq!(fatal_origin(&err).method, "export 0");
        assert!(err.to_string().contains("export 0"));
        assert!(vm.exec.is_empty());
    }

    #[test]
    fn popping_below_the_frame_is_fatal() {
        let mut code = BytecodeBuilder::new();
        code.toss();
        code.ret();
        let mut vm = export(code);
        let err = vm.run_export(0, 0, &[]).unwrap_err();
        assert_eq!(err.vm_error(), Some(&VmError::StackUnderflow));
        assert_eq!(fatal_origin(&err).method, "export 0");
        assert_eq!(fatal_origin(&err).frame, Some(0));
    }

    #[test]
    fn running_off_the_end_is_fatal() {
        // the last export has no ret
        let mut code = BytecodeBuilder::new();
        code.ldi(1);
        let mut vm = export(code);
        let seg = vm.segments.script_segment(0).unwrap();
        let size = vm.segments.script(seg).unwrap().size();
        let err = vm.run_export(0, 0, &[]).unwrap_err();
        assert_eq!(
            err.vm_error(),
            Some(&VmError::PcOutOfBounds { pos: CodePos::new(seg, size as u32), size })
        );
        assert_eq!(fatal_origin(&err).method, "export 0");
    }

    #[test]
    fn frames_in_unloaded_scripts_return() {
        let mut vm = export(BytecodeBuilder::new());
        let frame = ExecFrame::call(CodePos::new(SegmentId(0x7ff), 0), 1, Reg::NULL, 0, 0);
        vm.push_frame(frame).unwrap();
        vm.acc = Reg::int(4);
        assert_eq!(vm.run(), Ok(Reg::int(4)));
        assert!(vm.exec.is_empty());
    }

    #[test]
    fn trace_survives_undecodable_code() {
        let mut vm = export(BytecodeBuilder::new());
        let console = BufferedConsole::new();
        vm.debug.set_console(console.clone());
        let seg = vm.segments.script_segment(0).unwrap();
        vm.trace_instruction(CodePos::new(seg, 0x3000));
        assert!(console.lines().is_empty());

        let mut code = BytecodeBuilder::new();
        code.ldi(1);
        code.ret();
        let mut vm = export(code);
        vm.debug.set_console(console.clone());
        vm.debug.trace = true;
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(1)));
        let lines = console.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ldi") && lines[1].contains("ret"));
    }

    #[test]
    fn truncating_modulo_keeps_the_dividend_sign() {
        let minus_seven_mod_three = || {
            let mut code = BytecodeBuilder::new();
            code.pushi(-7);
            code.ldi(3);
            code.op(Op::Mod);
            code.ret();
            code
        };
        let settings = VmSettings { truncating_modulo: true, ..VmSettings::default() };
        let mut vm = TestGame::new().settings(settings).export(minus_seven_mod_three()).build();
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(-1)));
        assert_eq!(export(minus_seven_mod_three()).run_export(0, 0, &[]), Ok(Reg::int(2)));
    }

    #[test]
    fn stepping_reports_each_instruction() {
        let mut code = BytecodeBuilder::new();
        code.ldi(1);
        code.ret();
        let mut vm = export(code);
        let console = BufferedConsole::with_responses([Resume::Step, Resume::Continue]);
        vm.debug.set_console(console.clone());
        vm.debug.debugging = true;
        assert_eq!(vm.run_export(0, 0, &[]), Ok(Reg::int(1)));
        let stops = console.stops();
        assert_eq!(stops.len(), 2);
        assert!(stops[0].disassembly.contains("ldi"));
        assert!(stops[1].disassembly.contains("ret"));
    }

    #[test]
    fn runaway_recursion_is_bounded() {
        let mut kernel = KernelRegistry::new();
        let invoke = kernel.register("Invoke", "", invoke_doit).unwrap();
        let mut doit = BytecodeBuilder::new();
        doit.push0();
        doit.callk(invoke, 0);
        doit.ret();
        let settings = VmSettings { max_run_depth: 4, ..VmSettings::default() };
        let mut vm = TestGame::new()
            .settings(settings)
            .kernel(kernel)
            .method("ego", "doit", doit)
            .build();
        let ego = testing::object(&vm, "ego");
        let doit = testing::selector(&vm, "doit");
        let err = vm.invoke_selector(ego, doit, &[]).unwrap_err();
        assert_eq!(err.vm_error(), Some(&VmError::RunDepthExceeded(4)));
        assert!(vm.exec.is_empty());
    }
}
