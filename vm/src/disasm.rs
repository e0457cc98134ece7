//! One-instruction disassembler used by tracing, the debugger and the CLI.

use std::fmt::Write;

use sci_bytecode::{OPCODE_NAMES, Op, OperandKind, decode};
use sci_object::{CodePos, Reg, SegmentError, SelectorId, SelectorLookup, lookup_selector};

use crate::VM;
use crate::error::VmError;

/// Instruction bytes are padded to this many columns.
const BYTE_COLUMNS: usize = 5;

impl VM {
    /// Disassemble the instruction at `pos`, returning its text and the
    /// position of the next instruction.
    ///
    /// With `current` set, `pos` is taken to be the instruction about to run
    /// and the output also shows the live operands it will consume: kernel
    /// arguments, the selectors of a send and property names.
    pub fn disassemble(
        &self,
        pos: CodePos,
        print_bytes: bool,
        current: bool,
    ) -> Result<(String, CodePos), VmError> {
        let script = self
            .segments
            .script(pos.segment)
            .ok_or(SegmentError::InvalidReference(pos.into()))?;
        let start = pos.offset as usize;
        let d = decode(&script.bytecode, start, &self.formats)?;
        let next = CodePos::new(pos.segment, pos.offset + d.size as u32);

        let mut out = format!("{pos}: ");
        if print_bytes {
            let bytes = script.bytecode.get(start..start + d.size).unwrap_or_default();
            let mut hex = String::new();
            for b in bytes {
                let _ = write!(hex, "{b:02x} ");
            }
            let _ = write!(out, "{hex:<width$}", width = BYTE_COLUMNS * 3);
        }

        let number = d.number();
        let size_mark = if d.byte_operands() { 'B' } else { 'W' };
        let _ = write!(out, "[{size_mark}] {}", OPCODE_NAMES[number as usize]);

        let kinds = self.formats.operands(number);
        for (i, kind) in kinds.iter().enumerate().take(d.operand_count as usize) {
            let value = d.operand(i);
            let wide = match kind {
                OperandKind::Byte | OperandKind::SByte => false,
                OperandKind::Word | OperandKind::SWord => true,
                _ => !d.byte_operands(),
            };
            if i == 0 && number == Op::Callk.number() {
                let name = self.kernel.name(value as u16, None);
                let _ = write!(out, " {name}[{:x}]", value as u16);
                continue;
            }
            if wide {
                let _ = write!(out, " {:04x}", value as u16);
            } else {
                let _ = write!(out, " {:02x}", value as u8);
            }
            if *kind == OperandKind::SRelative {
                let target = (next.offset as i64 + value as i64) as u16;
                let _ = write!(out, "  [{target:04x}]");
            }
        }

        if current {
            self.describe_live_operands(&mut out, number, &d.operands)?;
        }
        Ok((out, next))
    }

    fn describe_live_operands(
        &self,
        out: &mut String,
        number: u8,
        operands: &[i32; 4],
    ) -> Result<(), VmError> {
        let Some(frame) = self.exec.top() else { return Ok(()) };
        let Some(op) = Op::from_number(number) else { return Ok(()) };
        match op {
            Op::PToA
            | Op::AToP
            | Op::PToS
            | Op::SToP
            | Op::IpToA
            | Op::DpToA
            | Op::IpToS
            | Op::DpToS => {
                let index = operands[0] as usize >> 1;
                let name = self
                    .segments
                    .object(frame.objp)
                    .and_then(|o| o.property_selector(index))
                    .map_or_else(|| "<invalid>".to_owned(), |s| self.selectors.display_name(s));
                let _ = write!(out, "\t({name})");
            }
            Op::Callk => {
                let words = (operands[1] as usize >> 1) + self.rest as usize;
                let Some(argc_slot) = frame.sp.checked_sub(words + 1) else { return Ok(()) };
                let argc = self.stack.get(argc_slot)?.offset() as usize;
                let args = (0..argc)
                    .map(|j| self.stack.get(argc_slot + 1 + j).map(|r| r.to_string()))
                    .collect::<Result<Vec<_>, _>>()?;
                let _ = write!(out, " Kernel params: ({})", args.join(", "));
            }
            Op::Send | Op::SelfSend | Op::Super => {
                let (receiver, frame_operand) = match op {
                    Op::Send => (self.acc, operands[0]),
                    Op::SelfSend => (frame.objp, operands[0]),
                    _ => (
                        self.segments
                            .loaded_class(operands[0] as u16)
                            .unwrap_or(Reg::NULL),
                        operands[1],
                    ),
                };
                self.describe_send(out, receiver, frame.sp, frame_operand as usize >> 1)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// One line per selector group of a pending send.
    fn describe_send(
        &self,
        out: &mut String,
        receiver: Reg,
        sp: usize,
        words: usize,
    ) -> Result<(), VmError> {
        let mut remaining = words + self.rest as usize;
        let mut rest = self.rest as usize;
        let Some(mut slot) = sp.checked_sub(remaining) else { return Ok(()) };
        let name = self.segments.object_name(receiver);
        while remaining >= 2 {
            let selector = SelectorId(self.stack.get(slot)?.offset() as u16);
            let mut argc = self.stack.get(slot + 1)?.offset() as usize;
            let kind = match lookup_selector(&self.segments, receiver, selector) {
                Ok(SelectorLookup::Method(_)) => {
                    argc += rest;
                    rest = 0;
                    "FUNCT"
                }
                Ok(SelectorLookup::Variable(_)) => "VAR",
                _ => "INVALID",
            };
            let args = (0..argc.min(remaining - 2))
                .map(|j| self.stack.get(slot + 2 + j).map(|r| r.to_string()))
                .collect::<Result<Vec<_>, _>>()?;
            let _ = write!(
                out,
                "\n  {name}::{}[{kind}]({})",
                self.selectors.display_name(selector),
                args.join(", ")
            );
            let used = (argc + 2).min(remaining);
            remaining -= used;
            slot += used;
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
