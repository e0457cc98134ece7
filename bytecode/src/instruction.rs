use core::fmt;

use crate::decoder::{DecodeError, Decoded, FILE_MARKER};
use crate::op::{Op, VarOp};

/// A decoded instruction with its operands in their natural types.
///
/// Frame operands (`frame`) are byte counts as encoded: the number of stack
/// words involved is `frame >> 1`. Property operands are byte offsets too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Bnot,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shr,
    Shl,
    Xor,
    And,
    Or,
    Neg,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Ugt,
    Uge,
    Ult,
    Ule,
    Bt { offset: i16 },
    Bnt { offset: i16 },
    Jmp { offset: i16 },
    Ldi { value: i16 },
    Push,
    Pushi { value: i16 },
    Toss,
    Dup,
    Link { count: u16 },
    Call { offset: i16, frame: u16 },
    Callk { function: u16, frame: u16 },
    Callb { export: u16, frame: u16 },
    Calle { script: u16, export: u16, frame: u16 },
    Ret,
    Send { frame: u16 },
    Class { class: u16 },
    SelfSend { frame: u16 },
    Super { class: u16, frame: u16 },
    Rest { first: u16 },
    Lea { kind: u16, index: u16 },
    SelfId,
    Pprev,
    PToA { property: u16 },
    AToP { property: u16 },
    PToS { property: u16 },
    SToP { property: u16 },
    IpToA { property: u16 },
    DpToA { property: u16 },
    IpToS { property: u16 },
    DpToS { property: u16 },
    Lofsa { operand: i32 },
    Lofss { operand: i32 },
    Push0,
    Push1,
    Push2,
    PushSelf,
    Line { line: u16 },
    /// Debug file-name marker, skipped at run time.
    File,
    Var { op: VarOp, index: u16 },
}

impl Instruction {
    pub fn from_decoded(d: &Decoded, pc: usize) -> Result<Instruction, DecodeError> {
        let n = d.number();
        if let Some(op) = VarOp::from_number(n) {
            return Ok(Instruction::Var { op, index: d.operand(0) as u16 });
        }
        let Some(op) = Op::from_number(n) else {
            return Err(DecodeError::InvalidOpcode { opcode: d.raw, pc });
        };
        let a = d.operand(0);
        let b = d.operand(1);
        let c = d.operand(2);
        Ok(match op {
            Op::Bnot => Instruction::Bnot,
            Op::Add => Instruction::Add,
            Op::Sub => Instruction::Sub,
            Op::Mul => Instruction::Mul,
            Op::Div => Instruction::Div,
            Op::Mod => Instruction::Mod,
            Op::Shr => Instruction::Shr,
            Op::Shl => Instruction::Shl,
            Op::Xor => Instruction::Xor,
            Op::And => Instruction::And,
            Op::Or => Instruction::Or,
            Op::Neg => Instruction::Neg,
            Op::Not => Instruction::Not,
            Op::Eq => Instruction::Eq,
            Op::Ne => Instruction::Ne,
            Op::Gt => Instruction::Gt,
            Op::Ge => Instruction::Ge,
            Op::Lt => Instruction::Lt,
            Op::Le => Instruction::Le,
            Op::Ugt => Instruction::Ugt,
            Op::Uge => Instruction::Uge,
            Op::Ult => Instruction::Ult,
            Op::Ule => Instruction::Ule,
            Op::Bt => Instruction::Bt { offset: a as i16 },
            Op::Bnt => Instruction::Bnt { offset: a as i16 },
            Op::Jmp => Instruction::Jmp { offset: a as i16 },
            Op::Ldi => Instruction::Ldi { value: a as i16 },
            Op::Push => Instruction::Push,
            Op::Pushi => Instruction::Pushi { value: a as i16 },
            Op::Toss => Instruction::Toss,
            Op::Dup => Instruction::Dup,
            Op::Link => Instruction::Link { count: a as u16 },
            Op::Call => Instruction::Call { offset: a as i16, frame: b as u16 },
            Op::Callk => Instruction::Callk { function: a as u16, frame: b as u16 },
            Op::Callb => Instruction::Callb { export: a as u16, frame: b as u16 },
            Op::Calle => Instruction::Calle {
                script: a as u16,
                export: b as u16,
                frame: c as u16,
            },
            Op::Ret => Instruction::Ret,
            Op::Send => Instruction::Send { frame: a as u16 },
            Op::Class => Instruction::Class { class: a as u16 },
            Op::SelfSend => Instruction::SelfSend { frame: a as u16 },
            Op::Super => Instruction::Super { class: a as u16, frame: b as u16 },
            Op::Rest => Instruction::Rest { first: a as u16 },
            Op::Lea => Instruction::Lea { kind: a as u16, index: b as u16 },
            Op::SelfId => Instruction::SelfId,
            Op::Pprev => Instruction::Pprev,
            Op::PToA => Instruction::PToA { property: a as u16 },
            Op::AToP => Instruction::AToP { property: a as u16 },
            Op::PToS => Instruction::PToS { property: a as u16 },
            Op::SToP => Instruction::SToP { property: a as u16 },
            Op::IpToA => Instruction::IpToA { property: a as u16 },
            Op::DpToA => Instruction::DpToA { property: a as u16 },
            Op::IpToS => Instruction::IpToS { property: a as u16 },
            Op::DpToS => Instruction::DpToS { property: a as u16 },
            Op::Lofsa => Instruction::Lofsa { operand: a },
            Op::Lofss => Instruction::Lofss { operand: a },
            Op::Push0 => Instruction::Push0,
            Op::Push1 => Instruction::Push1,
            Op::Push2 => Instruction::Push2,
            Op::PushSelf if d.raw == FILE_MARKER && d.size > 1 => Instruction::File,
            Op::PushSelf => Instruction::PushSelf,
            Op::Line => Instruction::Line { line: a as u16 },
        })
    }

    /// Whether this instruction ends a straight-line block.
    pub fn is_return(&self) -> bool {
        matches!(self, Instruction::Ret)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::Bt { offset }
            | Instruction::Bnt { offset }
            | Instruction::Jmp { offset } => write!(f, "{} {offset}", self.mnemonic()),
            Instruction::Ldi { value } | Instruction::Pushi { value } => {
                write!(f, "{} {value}", self.mnemonic())
            }
            Instruction::Link { count } => write!(f, "link {count}"),
            Instruction::Call { offset, frame } => write!(f, "call {offset} {frame}"),
            Instruction::Callk { function, frame } => write!(f, "callk {function} {frame}"),
            Instruction::Callb { export, frame } => write!(f, "callb {export} {frame}"),
            Instruction::Calle { script, export, frame } => {
                write!(f, "calle {script} {export} {frame}")
            }
            Instruction::Send { frame } | Instruction::SelfSend { frame } => {
                write!(f, "{} {frame}", self.mnemonic())
            }
            Instruction::Class { class } => write!(f, "class {class}"),
            Instruction::Super { class, frame } => write!(f, "super {class} {frame}"),
            Instruction::Rest { first } => write!(f, "&rest {first}"),
            Instruction::Lea { kind, index } => write!(f, "lea {kind} {index}"),
            Instruction::PToA { property }
            | Instruction::AToP { property }
            | Instruction::PToS { property }
            | Instruction::SToP { property }
            | Instruction::IpToA { property }
            | Instruction::DpToA { property }
            | Instruction::IpToS { property }
            | Instruction::DpToS { property } => write!(f, "{} {property}", self.mnemonic()),
            Instruction::Lofsa { operand } | Instruction::Lofss { operand } => {
                write!(f, "{} {operand}", self.mnemonic())
            }
            Instruction::Line { line } => write!(f, "line {line}"),
            Instruction::Var { op, index } => write!(f, "{} {index}", op.name()),
            _ => f.write_str(self.mnemonic()),
        }
    }
}

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        let op = match self {
            Instruction::Bnot => Op::Bnot,
            Instruction::Add => Op::Add,
            Instruction::Sub => Op::Sub,
            Instruction::Mul => Op::Mul,
            Instruction::Div => Op::Div,
            Instruction::Mod => Op::Mod,
            Instruction::Shr => Op::Shr,
            Instruction::Shl => Op::Shl,
            Instruction::Xor => Op::Xor,
            Instruction::And => Op::And,
            Instruction::Or => Op::Or,
            Instruction::Neg => Op::Neg,
            Instruction::Not => Op::Not,
            Instruction::Eq => Op::Eq,
            Instruction::Ne => Op::Ne,
            Instruction::Gt => Op::Gt,
            Instruction::Ge => Op::Ge,
            Instruction::Lt => Op::Lt,
            Instruction::Le => Op::Le,
            Instruction::Ugt => Op::Ugt,
            Instruction::Uge => Op::Uge,
            Instruction::Ult => Op::Ult,
            Instruction::Ule => Op::Ule,
            Instruction::Bt { .. } => Op::Bt,
            Instruction::Bnt { .. } => Op::Bnt,
            Instruction::Jmp { .. } => Op::Jmp,
            Instruction::Ldi { .. } => Op::Ldi,
            Instruction::Push => Op::Push,
            Instruction::Pushi { .. } => Op::Pushi,
            Instruction::Toss => Op::Toss,
            Instruction::Dup => Op::Dup,
            Instruction::Link { .. } => Op::Link,
            Instruction::Call { .. } => Op::Call,
            Instruction::Callk { .. } => Op::Callk,
            Instruction::Callb { .. } => Op::Callb,
            Instruction::Calle { .. } => Op::Calle,
            Instruction::Ret => Op::Ret,
            Instruction::Send { .. } => Op::Send,
            Instruction::Class { .. } => Op::Class,
            Instruction::SelfSend { .. } => Op::SelfSend,
            Instruction::Super { .. } => Op::Super,
            Instruction::Rest { .. } => Op::Rest,
            Instruction::Lea { .. } => Op::Lea,
            Instruction::SelfId => Op::SelfId,
            Instruction::Pprev => Op::Pprev,
            Instruction::PToA { .. } => Op::PToA,
            Instruction::AToP { .. } => Op::AToP,
            Instruction::PToS { .. } => Op::PToS,
            Instruction::SToP { .. } => Op::SToP,
            Instruction::IpToA { .. } => Op::IpToA,
            Instruction::DpToA { .. } => Op::DpToA,
            Instruction::IpToS { .. } => Op::IpToS,
            Instruction::DpToS { .. } => Op::DpToS,
            Instruction::Lofsa { .. } => Op::Lofsa,
            Instruction::Lofss { .. } => Op::Lofss,
            Instruction::Push0 => Op::Push0,
            Instruction::Push1 => Op::Push1,
            Instruction::Push2 => Op::Push2,
            Instruction::PushSelf => Op::PushSelf,
            Instruction::Line { .. } => Op::Line,
            Instruction::File => return "file",
            Instruction::Var { op, .. } => return op.name(),
        };
        op.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::OpcodeFormats;
    use crate::decoder::decode;
    use crate::op::{VarClass, VarOpKind};

    fn instr(bytes: &[u8]) -> Instruction {
        let d = decode(bytes, 0, &OpcodeFormats::default()).unwrap();
        Instruction::from_decoded(&d, 0).unwrap()
    }

    #[test]
    fn calle_operands() {
        // calle script 0x0102, export -1 (word form), frame 4
        let i = instr(&[0x46, 0x02, 0x01, 0xff, 0xff, 0x04]);
        assert_eq!(i, Instruction::Calle { script: 0x102, export: 0xffff, frame: 4 });
    }

    #[test]
    fn variable_family() {
        // ssti 3, byte form
        let i = instr(&[0xbd, 0x03]);
        let Instruction::Var { op, index } = i else { panic!("{i:?}") };
        assert_eq!(index, 3);
        assert_eq!(op.kind, VarOpKind::Store);
        assert_eq!(op.class, VarClass::Temp);
        assert!(op.stack && op.indexed);
        assert_eq!(i.to_string(), "ssti 3");
    }

    #[test]
    fn display_uses_original_mnemonics() {
        assert_eq!(instr(&[0x1b]).to_string(), "eq?");
        assert_eq!(instr(&[0x63, 0x08]).to_string(), "pToa 8");
        assert_eq!(instr(&[0x59, 0x02]).to_string(), "&rest 2");
    }
}
