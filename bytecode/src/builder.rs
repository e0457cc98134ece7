use crate::op::{Op, VarClass, VarOp};

/// A forward branch whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::bt`], [`BytecodeBuilder::bnt`],
/// [`BytecodeBuilder::jmp`] and [`BytecodeBuilder::call`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the instruction (base for relative offset).
    base: usize,
}

/// Assembles a script's bytecode.
///
/// Flexible operands use the one-byte encoding whenever the value fits.
/// Branches and local calls always use the word encoding so that labels can
/// be patched in place.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_opcode(&mut self, number: u8, byte_form: bool) {
        self.buf.push((number << 1) | byte_form as u8);
    }

    fn emit_flex(&mut self, number: u8, value: u16) {
        if value <= u8::MAX as u16 {
            self.emit_opcode(number, true);
            self.emit_u8(value as u8);
        } else {
            self.emit_opcode(number, false);
            self.emit_u16(value);
        }
    }

    fn emit_flex_signed(&mut self, number: u8, value: i16) {
        if let Ok(v) = i8::try_from(value) {
            self.emit_opcode(number, true);
            self.emit_u8(v as u8);
        } else {
            self.emit_opcode(number, false);
            self.emit_u16(value as u16);
        }
    }

    fn frame_bytes(words: u8) -> u8 {
        debug_assert!(words < 0x80, "frame of {words} words does not fit a byte");
        words.wrapping_mul(2)
    }

    fn emit_branch(&mut self, number: u8) -> Label {
        self.emit_opcode(number, false);
        let offset_pos = self.buf.len();
        self.emit_u16(0);
        Label {
            offset_pos,
            base: self.buf.len(),
        }
    }

    fn relative(from: usize, to: usize) -> i16 {
        let rel = to as isize - from as isize;
        debug_assert!(
            (i16::MIN as isize..=i16::MAX as isize).contains(&rel),
            "branch offset out of range: {rel}"
        );
        rel as i16
    }

    // ── operand-free opcodes ───────────────────────────────────────

    /// Emit an opcode that takes no operands (`add`, `eq?`, `ret`, ...).
    pub fn op(&mut self, op: Op) {
        self.emit_opcode(op.number(), true);
    }

    pub fn push(&mut self) {
        self.op(Op::Push);
    }

    pub fn toss(&mut self) {
        self.op(Op::Toss);
    }

    pub fn dup(&mut self) {
        self.op(Op::Dup);
    }

    pub fn ret(&mut self) {
        self.op(Op::Ret);
    }

    pub fn self_id(&mut self) {
        self.op(Op::SelfId);
    }

    pub fn pprev(&mut self) {
        self.op(Op::Pprev);
    }

    pub fn push0(&mut self) {
        self.op(Op::Push0);
    }

    pub fn push1(&mut self) {
        self.op(Op::Push1);
    }

    pub fn push2(&mut self) {
        self.op(Op::Push2);
    }

    /// `pushSelf` always uses the word form; the byte form is a file marker.
    pub fn push_self(&mut self) {
        self.emit_opcode(Op::PushSelf.number(), false);
    }

    // ── immediates ─────────────────────────────────────────────────

    pub fn ldi(&mut self, value: i16) {
        self.emit_flex_signed(Op::Ldi.number(), value);
    }

    pub fn pushi(&mut self, value: i16) {
        self.emit_flex_signed(Op::Pushi.number(), value);
    }

    pub fn link(&mut self, count: u16) {
        self.emit_flex(Op::Link.number(), count);
    }

    pub fn class(&mut self, class: u16) {
        self.emit_flex(Op::Class.number(), class);
    }

    pub fn rest(&mut self, first: u16) {
        self.emit_flex_signed(Op::Rest.number(), first as i16);
    }

    pub fn line(&mut self, line: u16) {
        self.emit_opcode(Op::Line.number(), false);
        self.emit_u16(line);
    }

    /// `lofsa`/`lofss` with a raw operand; its meaning depends on the
    /// script format.
    pub fn lofsa(&mut self, operand: i16) {
        self.emit_opcode(Op::Lofsa.number(), false);
        self.emit_u16(operand as u16);
    }

    pub fn lofss(&mut self, operand: i16) {
        self.emit_opcode(Op::Lofss.number(), false);
        self.emit_u16(operand as u16);
    }

    // ── branches ───────────────────────────────────────────────────

    pub fn bt(&mut self) -> Label {
        self.emit_branch(Op::Bt.number())
    }

    pub fn bnt(&mut self) -> Label {
        self.emit_branch(Op::Bnt.number())
    }

    pub fn jmp(&mut self) -> Label {
        self.emit_branch(Op::Jmp.number())
    }

    /// Branch to an already-emitted offset (`bt`, `bnt` or `jmp`).
    pub fn branch_to(&mut self, op: Op, target: usize) {
        debug_assert!(matches!(op, Op::Bt | Op::Bnt | Op::Jmp));
        let label = self.emit_branch(op.number());
        self.patch(&label, target);
    }

    /// Resolve a forward label to the current offset.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        self.patch(&label, target);
    }

    fn patch(&mut self, label: &Label, target: usize) {
        let rel = Self::relative(label.base, target);
        self.buf[label.offset_pos..label.offset_pos + 2].copy_from_slice(&rel.to_le_bytes());
    }

    // ── calls and sends ────────────────────────────────────────────

    /// Local procedure call; `argc` words were pushed after the argc slot.
    pub fn call(&mut self, argc: u8) -> Label {
        self.emit_opcode(Op::Call.number(), false);
        let offset_pos = self.buf.len();
        self.emit_u16(0);
        self.emit_u8(Self::frame_bytes(argc));
        Label {
            offset_pos,
            base: self.buf.len(),
        }
    }

    pub fn call_to(&mut self, target: usize, argc: u8) {
        let label = self.call(argc);
        self.patch(&label, target);
    }

    pub fn callk(&mut self, function: u16, argc: u8) {
        self.emit_flex(Op::Callk.number(), function);
        self.emit_u8(Self::frame_bytes(argc));
    }

    pub fn callb(&mut self, export: u16, argc: u8) {
        self.emit_flex(Op::Callb.number(), export);
        self.emit_u8(Self::frame_bytes(argc));
    }

    pub fn calle(&mut self, script: u16, export: u16, argc: u8) {
        let byte_form = script <= u8::MAX as u16 && export <= i8::MAX as u16;
        self.emit_opcode(Op::Calle.number(), byte_form);
        if byte_form {
            self.emit_u8(script as u8);
            self.emit_u8(export as u8);
        } else {
            self.emit_u16(script);
            self.emit_u16(export);
        }
        self.emit_u8(Self::frame_bytes(argc));
    }

    /// `send` over `words` stack words of selector groups.
    pub fn send(&mut self, words: u8) {
        self.emit_opcode(Op::Send.number(), true);
        self.emit_u8(Self::frame_bytes(words));
    }

    pub fn self_send(&mut self, words: u8) {
        self.emit_opcode(Op::SelfSend.number(), true);
        self.emit_u8(Self::frame_bytes(words));
    }

    pub fn super_send(&mut self, class: u16, words: u8) {
        self.emit_flex(Op::Super.number(), class);
        self.emit_u8(Self::frame_bytes(words));
    }

    // ── variables and properties ───────────────────────────────────

    pub fn var(&mut self, op: VarOp, index: u16) {
        self.emit_flex(op.number(), index);
    }

    /// `lea`: address of `class[index]`, plus the accumulator when `indexed`.
    pub fn lea(&mut self, class: VarClass, indexed: bool, index: u16) {
        let kind = ((class as u16) | if indexed { 0x08 } else { 0 }) << 1;
        let byte_form = index <= u8::MAX as u16;
        self.emit_opcode(Op::Lea.number(), byte_form);
        if byte_form {
            self.emit_u8(kind as u8);
            self.emit_u8(index as u8);
        } else {
            self.emit_u16(kind);
            self.emit_u16(index);
        }
    }

    /// Property opcode (`pToa` .. `dpTos`) on slot `index`.
    pub fn property(&mut self, op: Op, index: u16) {
        debug_assert!((Op::PToA.number()..=Op::DpToS.number()).contains(&op.number()));
        self.emit_flex(op.number(), index * 2);
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Instruction, OpcodeFormats, decode};
    use crate::op::VarOpKind;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        let formats = OpcodeFormats::default();
        let mut pc = 0;
        let mut out = Vec::new();
        while pc < bytes.len() {
            let d = decode(bytes, pc, &formats).unwrap();
            out.push(Instruction::from_decoded(&d, pc).unwrap());
            pc += d.size;
        }
        out
    }

    #[test]
    fn picks_narrow_and_wide_forms() {
        let mut b = BytecodeBuilder::new();
        b.pushi(3);
        b.pushi(-300);
        b.link(2);
        b.callk(0x120, 1);
        b.var(VarOp { kind: VarOpKind::Load, class: VarClass::Global, stack: false, indexed: false }, 400);
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::Pushi { value: 3 },
            Instruction::Pushi { value: -300 },
            Instruction::Link { count: 2 },
            Instruction::Callk { function: 0x120, frame: 2 },
            Instruction::Var {
                op: VarOp { kind: VarOpKind::Load, class: VarClass::Global, stack: false, indexed: false },
                index: 400,
            },
        ]);
        assert_eq!(b.as_bytes()[0], 0x39);
    }

    #[test]
    fn forward_and_backward_branches() {
        let mut b = BytecodeBuilder::new();
        let top = b.current_offset();
        b.ldi(1);
        let skip = b.bnt();
        b.ldi(2);
        b.bind(skip);
        b.branch_to(Op::Jmp, top);

        let code = decode_all(b.as_bytes());
        // bnt at 2..5 jumps over ldi 2 (2 bytes)
        assert_eq!(code[1], Instruction::Bnt { offset: 2 });
        // jmp at 7..10 back to 0
        assert_eq!(code[3], Instruction::Jmp { offset: -10 });
    }

    #[test]
    fn lea_encodes_class_and_index_flag() {
        let mut b = BytecodeBuilder::new();
        b.lea(VarClass::Temp, true, 3);
        assert_eq!(decode_all(b.as_bytes()), vec![Instruction::Lea { kind: 0x14, index: 3 }]);
    }

    #[test]
    fn property_operands_are_byte_offsets() {
        let mut b = BytecodeBuilder::new();
        b.property(Op::PToA, 5);
        b.send(4);
        assert_eq!(decode_all(b.as_bytes()), vec![
            Instruction::PToA { property: 10 },
            Instruction::Send { frame: 8 },
        ]);
    }
}
