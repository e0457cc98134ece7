use thiserror::Error;

use crate::format::{OpcodeFormats, OperandKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction at {pc:#06x} runs past the end of the script")]
    Truncated { pc: usize },
    #[error("opcode {opcode:#04x} at {pc:#06x} is invalid")]
    InvalidOpcode { opcode: u8, pc: usize },
}

/// One decoded instruction in its generic form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// The full opcode byte, including the size bit.
    pub raw: u8,
    /// Operand values. Unsigned kinds are zero-extended, signed kinds
    /// sign-extended.
    pub operands: [i32; 4],
    pub operand_count: u8,
    /// Bytes consumed, opcode byte included.
    pub size: usize,
}

impl Decoded {
    #[inline(always)]
    pub const fn number(&self) -> u8 {
        self.raw >> 1
    }

    /// Whether flexible operands were encoded as single bytes.
    #[inline(always)]
    pub const fn byte_operands(&self) -> bool {
        self.raw & 1 != 0
    }

    #[inline(always)]
    pub fn operand(&self, i: usize) -> i32 {
        self.operands[i]
    }
}

/// Sequential decoder over a script's bytes.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    formats: &'a OpcodeFormats,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8], formats: &'a OpcodeFormats) -> Self {
        Self::at(bytes, 0, formats)
    }

    pub fn at(bytes: &'a [u8], pos: usize, formats: &'a OpcodeFormats) -> Self {
        Self { bytes, pos, formats }
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the instruction at the current offset and advance past it.
    pub fn decode_next(&mut self) -> Result<Decoded, DecodeError> {
        let decoded = decode(self.bytes, self.pos, self.formats)?;
        self.pos += decoded.size;
        Ok(decoded)
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<Decoded, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_at_end() {
            return None;
        }
        let item = self.decode_next();
        if item.is_err() {
            self.pos = self.bytes.len();
        }
        Some(item)
    }
}

/// Decode one instruction at `pc`.
pub fn decode(
    bytes: &[u8],
    pc: usize,
    formats: &OpcodeFormats,
) -> Result<Decoded, DecodeError> {
    let raw = *bytes.get(pc).ok_or(DecodeError::Truncated { pc })?;
    let byte_operands = raw & 1 != 0;
    let big_endian = formats.options().big_endian;
    let mut pos = pc + 1;
    let mut operands = [0i32; 4];
    let mut count = 0u8;

    for (i, kind) in formats.operands(raw >> 1).iter().enumerate() {
        if kind.is_terminator() {
            break;
        }
        let wide = match kind {
            OperandKind::Invalid => {
                return Err(DecodeError::InvalidOpcode { opcode: raw, pc });
            }
            OperandKind::Byte | OperandKind::SByte => false,
            OperandKind::Word | OperandKind::SWord => true,
            _ => !byte_operands,
        };
        let value = if wide {
            let word = read_u16(bytes, pos, big_endian).ok_or(DecodeError::Truncated { pc })?;
            pos += 2;
            if kind.is_signed() { word as i16 as i32 } else { word as i32 }
        } else {
            let byte = *bytes.get(pos).ok_or(DecodeError::Truncated { pc })?;
            pos += 1;
            if kind.is_signed() { byte as i8 as i32 } else { byte as i32 }
        };
        operands[i] = value;
        count += 1;
    }

    // pushSelf with the size bit set carries a file name for debuggers.
    if raw == FILE_MARKER && formats.options().file_marker {
        let rest = bytes.get(pos..).ok_or(DecodeError::Truncated { pc })?;
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::Truncated { pc })?;
        pos += nul + 1;
    }

    Ok(Decoded { raw, operands, operand_count: count, size: pos - pc })
}

/// `pushSelf` encoded with the size bit.
pub const FILE_MARKER: u8 = (0x3e << 1) | 1;

#[inline(always)]
fn read_u16(bytes: &[u8], pos: usize, big_endian: bool) -> Option<u16> {
    let pair = bytes.get(pos..pos + 2)?;
    let pair = [pair[0], pair[1]];
    Some(if big_endian {
        u16::from_be_bytes(pair)
    } else {
        u16::from_le_bytes(pair)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatOptions;

    fn formats() -> OpcodeFormats {
        OpcodeFormats::default()
    }

    #[test]
    fn size_bit_selects_operand_width() {
        let f = formats();
        // ldi 0xff (byte form, sign extended)
        let d = decode(&[0x35, 0xff], 0, &f).unwrap();
        assert_eq!(d.number(), 0x1a);
        assert_eq!(d.operand(0), -1);
        assert_eq!(d.size, 2);
        // ldi 0x1234 (word form)
        let d = decode(&[0x34, 0x34, 0x12], 0, &f).unwrap();
        assert_eq!(d.operand(0), 0x1234);
        assert_eq!(d.size, 3);
    }

    #[test]
    fn fixed_operands_ignore_size_bit() {
        let f = formats();
        // callk byte form: function is flexible, frame is always a byte
        let d = decode(&[0x43, 0x05, 0x04], 0, &f).unwrap();
        assert_eq!((d.operand(0), d.operand(1)), (5, 4));
        assert_eq!(d.size, 3);
        // callk word form
        let d = decode(&[0x42, 0x05, 0x01, 0x04], 0, &f).unwrap();
        assert_eq!((d.operand(0), d.operand(1)), (0x105, 4));
        assert_eq!(d.size, 4);
        // line is always a word
        let d = decode(&[0x7f, 0x10, 0x00], 0, &f).unwrap();
        assert_eq!(d.operand(0), 0x10);
    }

    #[test]
    fn relative_offsets_are_signed_words() {
        let d = decode(&[0x32, 0xfe, 0xff], 0, &formats()).unwrap();
        assert_eq!(d.number(), 0x19);
        assert_eq!(d.operand(0), -2);
    }

    #[test]
    fn unsigned_words_stay_positive() {
        // link 0xfffe
        let d = decode(&[0x3e, 0xfe, 0xff], 0, &formats()).unwrap();
        assert_eq!(d.operand(0), 0xfffe);
    }

    #[test]
    fn big_endian_words() {
        let f = OpcodeFormats::new(FormatOptions { big_endian: true, ..Default::default() });
        let d = decode(&[0x34, 0x12, 0x34], 0, &f).unwrap();
        assert_eq!(d.operand(0), 0x1234);
    }

    #[test]
    fn reserved_opcode_is_rejected() {
        let err = decode(&[0x4c], 0, &formats()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidOpcode { opcode: 0x4c, pc: 0 });
    }

    #[test]
    fn truncated_operand() {
        let err = decode(&[0x34, 0x12], 0, &formats()).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { pc: 0 });
    }

    #[test]
    fn file_marker_skips_name() {
        let bytes = [FILE_MARKER, b'a', b'.', b's', b'c', 0, 0x48];
        let d = decode(&bytes, 0, &formats()).unwrap();
        assert_eq!(d.size, 6);
        let next = decode(&bytes, d.size, &formats()).unwrap();
        assert_eq!(next.number(), 0x24);
    }

    #[test]
    fn iterator_walks_a_stream() {
        let f = formats();
        let bytes = [0x39, 0x03, 0x39, 0x04, 0x02, 0x48];
        let numbers: Vec<u8> = BytecodeDecoder::new(&bytes, &f)
            .map(|d| d.unwrap().number())
            .collect();
        assert_eq!(numbers, vec![0x1c, 0x1c, 0x01, 0x24]);
    }
}
