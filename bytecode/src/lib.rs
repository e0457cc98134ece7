//! Bytecode encoding of the adventure-game script VM.
//!
//! Opcode bytes carry the opcode number in bits 1-7 and an operand size bit
//! in bit 0. Operand shapes per opcode come from [`OpcodeFormats`], which
//! starts from [`BASE_FORMATS`] and applies per-game variant switches.

mod op;
mod format;
mod decoder;
mod instruction;
mod builder;

pub use op::{Op, VarClass, VarOp, VarOpKind, OPCODE_NAMES};
pub use format::{BASE_FORMATS, FormatOptions, OpcodeFormats, OperandKind};
pub use decoder::{BytecodeDecoder, DecodeError, Decoded, FILE_MARKER, decode};
pub use instruction::Instruction;
pub use builder::{BytecodeBuilder, Label};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembled_method_decodes_in_order() {
        let mut b = BytecodeBuilder::new();
        b.link(1);
        b.pushi(2);
        b.ldi(3);
        b.op(Op::Add);
        b.var(VarOp::from_number(0x52).unwrap(), 0); // sat 0
        b.ret();
        let bytes = b.into_bytes();
        let formats = OpcodeFormats::default();
        let mnemonics: Vec<String> = BytecodeDecoder::new(&bytes, &formats)
            .enumerate()
            .map(|(i, d)| {
                let d = d.unwrap();
                Instruction::from_decoded(&d, i).unwrap().to_string()
            })
            .collect();
        assert_eq!(mnemonics, vec!["link 1", "pushi 2", "ldi 3", "add", "sat 0", "ret"]);
    }
}
