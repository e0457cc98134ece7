/// Opcode numbers `0x00..=0x3f`.
///
/// The encoded opcode byte is `number << 1 | size_bit`. When the size bit is
/// set, every flexible operand of the instruction is one byte wide; when it
/// is clear they are little-endian words. Numbers `0x40..=0x7f` are the
/// variable-access family, see [`VarOp`].
///
/// Reserved numbers (`0x26`, `0x27`, `0x29`, `0x2f`) have no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// `acc = ~acc`
    Bnot = 0x00,
    /// `acc = pop + acc`
    Add,
    /// `acc = pop - acc`
    Sub,
    Mul,
    Div,
    Mod,
    Shr,
    Shl,
    Xor,
    And,
    Or,
    /// `acc = -acc`
    Neg,
    /// `acc = !acc`
    Not,
    /// Comparisons save `acc` into `prev`, then `acc = pop <op> acc`.
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

    /// Branch if `acc` is non-null. Operands: `rel:sflex`
    Bt = 0x17,
    /// Branch if `acc` is null. Operands: `rel:sflex`
    Bnt,
    /// Operands: `rel:sflex`
    Jmp,
    /// Load immediate. Operands: `value:sflex`
    Ldi,
    Push,
    /// Operands: `value:sflex`
    Pushi,
    Toss,
    Dup,
    /// Reserve temporaries. Operands: `count:flex`
    Link,

    /// Local procedure call. Operands: `rel:sflex`, `frame:u8`
    Call = 0x20,
    /// Kernel call. Operands: `function:flex`, `frame:u8`
    Callk,
    /// Call an export of script 0. Operands: `export:flex`, `frame:u8`
    Callb,
    /// Call an export of another script. Operands: `script:flex`, `export:sflex`, `frame:u8`
    Calle,
    Ret,
    /// Send to the accumulator. Operands: `frame:u8`
    Send,

    /// Load a class address. Operands: `class:flex`
    Class = 0x28,
    /// Send to the current object. Operands: `frame:u8`
    SelfSend = 0x2a,
    /// Send to a superclass. Operands: `class:flex`, `frame:u8`
    Super,
    /// Push the remaining parameters. Operands: `first:sflex`
    Rest,
    /// Load effective address. Operands: `kind:sflex`, `index:flex`
    Lea,
    SelfId,

    Pprev = 0x30,
    /// Property access; operands: `property:flex` (a byte offset, two per slot)
    PToA,
    AToP,
    PToS,
    SToP,
    IpToA,
    DpToA,
    IpToS,
    DpToS,
    /// Load a script-relative address. Operands: `offset:sflex` (or `flex`)
    Lofsa,
    Lofss,
    Push0,
    Push1,
    Push2,
    PushSelf,
    /// Debug line marker. Operands: `line:u16`
    Line,
}

impl Op {
    pub const fn from_number(n: u8) -> Option<Op> {
        use Op::*;
        Some(match n {
            0x00 => Bnot,
            0x01 => Add,
            0x02 => Sub,
            0x03 => Mul,
            0x04 => Div,
            0x05 => Mod,
            0x06 => Shr,
            0x07 => Shl,
            0x08 => Xor,
            0x09 => And,
            0x0a => Or,
            0x0b => Neg,
            0x0c => Not,
            0x0d => Eq,
            0x0e => Ne,
            0x0f => Gt,
            0x10 => Ge,
            0x11 => Lt,
            0x12 => Le,
            0x13 => Ugt,
            0x14 => Uge,
            0x15 => Ult,
            0x16 => Ule,
            0x17 => Bt,
            0x18 => Bnt,
            0x19 => Jmp,
            0x1a => Ldi,
            0x1b => Push,
            0x1c => Pushi,
            0x1d => Toss,
            0x1e => Dup,
            0x1f => Link,
            0x20 => Call,
            0x21 => Callk,
            0x22 => Callb,
            0x23 => Calle,
            0x24 => Ret,
            0x25 => Send,
            0x28 => Class,
            0x2a => SelfSend,
            0x2b => Super,
            0x2c => Rest,
            0x2d => Lea,
            0x2e => SelfId,
            0x30 => Pprev,
            0x31 => PToA,
            0x32 => AToP,
            0x33 => PToS,
            0x34 => SToP,
            0x35 => IpToA,
            0x36 => DpToA,
            0x37 => IpToS,
            0x38 => DpToS,
            0x39 => Lofsa,
            0x3a => Lofss,
            0x3b => Push0,
            0x3c => Push1,
            0x3d => Push2,
            0x3e => PushSelf,
            0x3f => Line,
            _ => return None,
        })
    }

    #[inline(always)]
    pub const fn number(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        OPCODE_NAMES[self as usize]
    }
}

/// The four variable classes addressed by variable opcodes and `lea`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VarClass {
    Global = 0,
    Local = 1,
    Temp = 2,
    Param = 3,
}

impl VarClass {
    pub const ALL: [VarClass; 4] = [
        VarClass::Global,
        VarClass::Local,
        VarClass::Temp,
        VarClass::Param,
    ];

    #[inline(always)]
    pub const fn from_bits(bits: u8) -> VarClass {
        match bits & 0x03 {
            0 => VarClass::Global,
            1 => VarClass::Local,
            2 => VarClass::Temp,
            _ => VarClass::Param,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            VarClass::Global => "global",
            VarClass::Local => "local",
            VarClass::Temp => "temp",
            VarClass::Param => "param",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarOpKind {
    Load,
    Store,
    Increment,
    Decrement,
}

/// A decoded variable-access opcode (`0x40..=0x7f`).
///
/// Bit layout of the opcode number: bits 0-1 class, bit 2 stack instead of
/// accumulator, bit 3 index by accumulator, bits 4-5 operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarOp {
    pub kind: VarOpKind,
    pub class: VarClass,
    pub stack: bool,
    pub indexed: bool,
}

impl VarOp {
    pub const fn from_number(n: u8) -> Option<VarOp> {
        if n < 0x40 || n > 0x7f {
            return None;
        }
        let kind = match (n >> 4) & 0x03 {
            0 => VarOpKind::Load,
            1 => VarOpKind::Store,
            2 => VarOpKind::Increment,
            _ => VarOpKind::Decrement,
        };
        Some(VarOp {
            kind,
            class: VarClass::from_bits(n),
            stack: n & 0x04 != 0,
            indexed: n & 0x08 != 0,
        })
    }

    pub const fn number(self) -> u8 {
        let kind = match self.kind {
            VarOpKind::Load => 0,
            VarOpKind::Store => 1,
            VarOpKind::Increment => 2,
            VarOpKind::Decrement => 3,
        };
        0x40 | (kind << 4)
            | ((self.indexed as u8) << 3)
            | ((self.stack as u8) << 2)
            | self.class as u8
    }

    pub const fn name(self) -> &'static str {
        OPCODE_NAMES[self.number() as usize]
    }
}

/// Mnemonics indexed by opcode number, as printed by the disassembler.
pub const OPCODE_NAMES: [&str; 128] = [
    "bnot", "add", "sub", "mul", "div", "mod", "shr", "shl",
    "xor", "and", "or", "neg", "not", "eq?", "ne?", "gt?",
    "ge?", "lt?", "le?", "ugt?", "uge?", "ult?", "ule?", "bt",
    "bnt", "jmp", "ldi", "push", "pushi", "toss", "dup", "link",
    "call", "callk", "callb", "calle", "ret", "send", "dummy", "dummy",
    "class", "dummy", "self", "super", "&rest", "lea", "selfID", "dummy",
    "pprev", "pToa", "aTop", "pTos", "sTop", "ipToa", "dpToa", "ipTos",
    "dpTos", "lofsa", "lofss", "push0", "push1", "push2", "pushSelf", "line",
    "lag", "lal", "lat", "lap", "lsg", "lsl", "lst", "lsp",
    "lagi", "lali", "lati", "lapi", "lsgi", "lsli", "lsti", "lspi",
    "sag", "sal", "sat", "sap", "ssg", "ssl", "sst", "ssp",
    "sagi", "sali", "sati", "sapi", "ssgi", "ssli", "ssti", "sspi",
    "+ag", "+al", "+at", "+ap", "+sg", "+sl", "+st", "+sp",
    "+agi", "+ali", "+ati", "+api", "+sgi", "+sli", "+sti", "+spi",
    "-ag", "-al", "-at", "-ap", "-sg", "-sl", "-st", "-sp",
    "-agi", "-ali", "-ati", "-api", "-sgi", "-sli", "-sti", "-spi",
];
