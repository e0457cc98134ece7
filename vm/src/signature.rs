//! Kernel call signatures.
//!
//! A signature is a compact string, one letter per argument:
//!
//! | letter | accepts |
//! |--------|---------|
//! | `i` | integer (and null) |
//! | `o` | object |
//! | `r` | reference into script, locals, stack or raw memory |
//! | `l` | list |
//! | `n` | list node |
//! | `0` | null |
//! | `.` | anything that is not an invalid reference |
//!
//! `!` after a letter also admits invalid references, `[..]` groups
//! alternatives into one argument, `(` makes every following argument
//! optional and `*` lets the previous argument repeat.

use core::fmt;

use sci_object::RegType;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature '{signature}': unexpected '{found}' at {pos}")]
    Unexpected { signature: String, found: char, pos: usize },
    #[error("signature '{0}': unclosed '['")]
    UnclosedGroup(String),
}

/// Set of argument types accepted at one position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArgTypes(u8);

impl ArgTypes {
    pub const NONE: ArgTypes = ArgTypes(0);
    pub const NULL: ArgTypes = ArgTypes(1 << 0);
    pub const INTEGER: ArgTypes = ArgTypes(1 << 1);
    pub const OBJECT: ArgTypes = ArgTypes(1 << 2);
    pub const REFERENCE: ArgTypes = ArgTypes(1 << 3);
    pub const LIST: ArgTypes = ArgTypes(1 << 4);
    pub const NODE: ArgTypes = ArgTypes(1 << 5);
    pub const UNINITIALIZED: ArgTypes = ArgTypes(1 << 6);
    pub const INVALID: ArgTypes = ArgTypes(1 << 7);
    pub const ANY: ArgTypes = ArgTypes(0x7f);

    #[inline(always)]
    pub const fn contains(self, other: ArgTypes) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline(always)]
    pub const fn union(self, other: ArgTypes) -> ArgTypes {
        ArgTypes(self.0 | other.0)
    }

    pub fn accepts(self, ty: RegType) -> bool {
        match ty {
            RegType::Null => self.contains(Self::NULL) || self.contains(Self::INTEGER),
            RegType::Integer => self.contains(Self::INTEGER),
            RegType::Object => self.contains(Self::OBJECT),
            RegType::Reference => self.contains(Self::REFERENCE),
            RegType::List => self.contains(Self::LIST),
            RegType::Node => self.contains(Self::NODE),
            RegType::Uninitialized => self.contains(Self::UNINITIALIZED),
            RegType::Invalid => self.contains(Self::INVALID),
        }
    }

    fn from_letter(c: char) -> Option<ArgTypes> {
        Some(match c {
            'i' => Self::INTEGER,
            'o' => Self::OBJECT,
            'r' => Self::REFERENCE,
            'l' => Self::LIST,
            'n' => Self::NODE,
            '0' => Self::NULL,
            '.' => Self::ANY,
            _ => return None,
        })
    }
}

impl fmt::Debug for ArgTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArgTypes({:#010b})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Param {
    types: ArgTypes,
    optional: bool,
    repeat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    source: String,
    params: Vec<Param>,
}

impl Signature {
    pub fn parse(source: &str) -> Result<Signature, SignatureError> {
        let unexpected = |found, pos| SignatureError::Unexpected {
            signature: source.to_owned(),
            found,
            pos,
        };
        let mut params: Vec<Param> = Vec::new();
        let mut optional = false;
        let mut chars = source.char_indices();
        while let Some((pos, c)) = chars.next() {
            match c {
                '(' => optional = true,
                ')' => {}
                '!' => match params.last_mut() {
                    Some(p) => p.types = p.types.union(ArgTypes::INVALID),
                    None => return Err(unexpected(c, pos)),
                },
                '*' => match params.last_mut() {
                    Some(p) => p.repeat = true,
                    None => return Err(unexpected(c, pos)),
                },
                '[' => {
                    let mut types = ArgTypes::NONE;
                    loop {
                        match chars.next() {
                            Some((_, ']')) if types != ArgTypes::NONE => break,
                            Some((_, '!')) if types != ArgTypes::NONE => {
                                types = types.union(ArgTypes::INVALID);
                            }
                            Some((p, c)) => {
                                types = types.union(
                                    ArgTypes::from_letter(c).ok_or_else(|| unexpected(c, p))?,
                                );
                            }
                            None => return Err(SignatureError::UnclosedGroup(source.to_owned())),
                        }
                    }
                    params.push(Param { types, optional, repeat: false });
                }
                _ => {
                    let types = ArgTypes::from_letter(c).ok_or_else(|| unexpected(c, pos))?;
                    params.push(Param { types, optional, repeat: false });
                }
            }
        }
        Ok(Signature {
            source: source.to_owned(),
            params,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether arguments of the given types satisfy the signature.
    pub fn matches(&self, args: &[RegType]) -> bool {
        let mut index = 0;
        let mut repeated = false;
        let mut args = args.iter().copied().peekable();
        while let Some(&ty) = args.peek() {
            let Some(param) = self.params.get(index) else {
                return false;
            };
            if param.types.accepts(ty) {
                args.next();
                if param.repeat {
                    repeated = true;
                } else {
                    index += 1;
                }
            } else if param.repeat && (repeated || param.optional) {
                index += 1;
                repeated = false;
            } else {
                return false;
            }
        }
        self.params[index.min(self.params.len())..]
            .iter()
            .enumerate()
            .all(|(i, p)| p.optional || (i == 0 && p.repeat && repeated))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Render argument types for a mismatch report, e.g. `(integer, object)`.
pub fn describe_args(args: &[RegType]) -> String {
    let names: Vec<&str> = args
        .iter()
        .map(|t| match t {
            RegType::Null => "null",
            RegType::Integer => "integer",
            RegType::Object => "object",
            RegType::Reference => "reference",
            RegType::List => "list",
            RegType::Node => "node",
            RegType::Uninitialized => "uninitialized",
            RegType::Invalid => "invalid",
        })
        .collect();
    format!("({})", names.join(", "))
}

// ── Tests ──────────────────────────────────────────────────────────
