/// The shape of one instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// No further operands.
    None,
    /// Reserved opcode; decoding it is an error.
    Invalid,
    /// Marks the end of a function (`ret`); no operand.
    End,
    Byte,
    SByte,
    Word,
    SWord,
    /// Flexible-width unsigned value.
    Variable,
    /// Flexible-width signed value.
    SVariable,
    /// Flexible-width signed offset relative to the next instruction.
    SRelative,
    /// Flexible-width property byte offset.
    Property,
    Global,
    Local,
    Temp,
    Param,
    /// Flexible-width unsigned script offset.
    Offset,
}

impl OperandKind {
    /// Whether the width of this operand follows the opcode's size bit.
    pub const fn is_flexible(self) -> bool {
        matches!(
            self,
            OperandKind::Variable
                | OperandKind::SVariable
                | OperandKind::SRelative
                | OperandKind::Property
                | OperandKind::Global
                | OperandKind::Local
                | OperandKind::Temp
                | OperandKind::Param
                | OperandKind::Offset
        )
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            OperandKind::SByte
                | OperandKind::SWord
                | OperandKind::SVariable
                | OperandKind::SRelative
        )
    }

    /// Whether this kind terminates the operand list.
    pub const fn is_terminator(self) -> bool {
        matches!(self, OperandKind::None | OperandKind::End)
    }
}

/// Variant switches for the operand-shape table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    /// `lofsa`/`lofss` take an unsigned script offset instead of a signed
    /// relative one.
    pub offset_lofs: bool,
    /// Byte operands of the call family, `send`, `self` and `super` are words.
    pub wide_call_operands: bool,
    /// Words are stored big-endian.
    pub big_endian: bool,
    /// `pushSelf` with the size bit set is a debug file marker followed by a
    /// NUL-terminated file name.
    pub file_marker: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            offset_lofs: false,
            wide_call_operands: false,
            big_endian: false,
            file_marker: true,
        }
    }
}

const N: OperandKind = OperandKind::None;
const X: OperandKind = OperandKind::Invalid;
const E: OperandKind = OperandKind::End;
const B: OperandKind = OperandKind::Byte;
const W: OperandKind = OperandKind::Word;
const V: OperandKind = OperandKind::Variable;
const SV: OperandKind = OperandKind::SVariable;
const SR: OperandKind = OperandKind::SRelative;
const P: OperandKind = OperandKind::Property;
const G: OperandKind = OperandKind::Global;
const L: OperandKind = OperandKind::Local;
const T: OperandKind = OperandKind::Temp;
const PA: OperandKind = OperandKind::Param;

const VARS: [[OperandKind; 4]; 4] = [[G, N, N, N], [L, N, N, N], [T, N, N, N], [PA, N, N, N]];

/// Operand shapes for all 128 opcode numbers.
pub const BASE_FORMATS: [[OperandKind; 4]; 128] = {
    let mut t = [[N; 4]; 128];
    // 0x00..=0x16 take no operands.
    t[0x17] = [SR, N, N, N];
    t[0x18] = [SR, N, N, N];
    t[0x19] = [SR, N, N, N];
    t[0x1a] = [SV, N, N, N];
    t[0x1c] = [SV, N, N, N];
    t[0x1f] = [V, N, N, N];
    t[0x20] = [SR, B, N, N];
    t[0x21] = [V, B, N, N];
    t[0x22] = [V, B, N, N];
    t[0x23] = [V, SV, B, N];
    t[0x24] = [E, N, N, N];
    t[0x25] = [B, N, N, N];
    t[0x26] = [X, N, N, N];
    t[0x27] = [X, N, N, N];
    t[0x28] = [V, N, N, N];
    t[0x29] = [X, N, N, N];
    t[0x2a] = [B, N, N, N];
    t[0x2b] = [V, B, N, N];
    t[0x2c] = [SV, N, N, N];
    t[0x2d] = [SV, V, N, N];
    t[0x2f] = [X, N, N, N];
    let mut i = 0x31;
    while i <= 0x38 {
        t[i] = [P, N, N, N];
        i += 1;
    }
    t[0x39] = [SR, N, N, N];
    t[0x3a] = [SR, N, N, N];
    t[0x3f] = [W, N, N, N];
    let mut op = 0x40;
    while op < 0x80 {
        t[op] = VARS[op & 0x03];
        op += 1;
    }
    t
};

/// The operand-shape table in effect for one game.
#[derive(Debug, Clone)]
pub struct OpcodeFormats {
    table: [[OperandKind; 4]; 128],
    options: FormatOptions,
}

impl OpcodeFormats {
    pub fn new(options: FormatOptions) -> Self {
        let mut table = BASE_FORMATS;
        if options.offset_lofs {
            table[0x39][0] = OperandKind::Offset;
            table[0x3a][0] = OperandKind::Offset;
        }
        if options.wide_call_operands {
            table[0x23][2] = W;
            table[0x21][1] = W;
            table[0x2b][1] = W;
            table[0x25][0] = W;
            table[0x2a][0] = W;
            table[0x20][1] = W;
            table[0x22][1] = W;
        }
        Self { table, options }
    }

    #[inline(always)]
    pub fn operands(&self, number: u8) -> &[OperandKind; 4] {
        &self.table[(number & 0x7f) as usize]
    }

    pub fn options(&self) -> FormatOptions {
        self.options
    }
}

impl From<FormatOptions> for OpcodeFormats {
    fn from(options: FormatOptions) -> Self {
        Self::new(options)
    }
}

impl Default for OpcodeFormats {
    fn default() -> Self {
        Self::new(FormatOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_has_no_operands() {
        for n in 0x00..=0x16 {
            assert!(BASE_FORMATS[n][0].is_terminator(), "opcode {n:#x}");
        }
    }

    #[test]
    fn reserved_numbers_are_invalid() {
        for n in [0x26, 0x27, 0x29, 0x2f] {
            assert_eq!(BASE_FORMATS[n][0], OperandKind::Invalid);
        }
    }

    #[test]
    fn variable_family_uses_class_operands() {
        assert_eq!(BASE_FORMATS[0x40][0], OperandKind::Global);
        assert_eq!(BASE_FORMATS[0x55][0], OperandKind::Local);
        assert_eq!(BASE_FORMATS[0x6a][0], OperandKind::Temp);
        assert_eq!(BASE_FORMATS[0x7f][0], OperandKind::Param);
    }

    #[test]
    fn options_adjust_table() {
        let f = OpcodeFormats::new(FormatOptions {
            offset_lofs: true,
            wide_call_operands: true,
            ..FormatOptions::default()
        });
        assert_eq!(f.operands(0x39)[0], OperandKind::Offset);
        assert_eq!(f.operands(0x25)[0], OperandKind::Word);
        assert_eq!(f.operands(0x23)[2], OperandKind::Word);

        let base = OpcodeFormats::default();
        assert_eq!(base.operands(0x39)[0], OperandKind::SRelative);
        assert_eq!(base.operands(0x25)[0], OperandKind::Byte);
    }
}
