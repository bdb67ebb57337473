use std::{fmt::Display, str::FromStr};

pub use chrono_tz::Tz;

use crate::{Error, Result};

/// A raw column type as transmitted in block headers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    Int256,

    UInt8,
    UInt16,
    UInt32,
    UInt64,
    UInt128,
    UInt256,

    Float32,
    Float64,

    /// Scale; the raw value is a scaled integer of the variant's width.
    Decimal32(usize),
    Decimal64(usize),
    Decimal128(usize),
    Decimal256(usize),

    String,
    FixedString(usize),

    Uuid,

    Date,
    DateTime(Tz),
    DateTime64(usize, Tz),

    LowCardinality(Box<Type>),
    Array(Box<Type>),
    Nullable(Box<Type>),
}

impl Type {
    pub fn unnull(&self) -> Option<&Type> {
        match self {
            Type::Nullable(x) => Some(&**x),
            _ => None,
        }
    }

    pub fn strip_null(&self) -> &Type {
        match self {
            Type::Nullable(x) => x,
            _ => self,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_))
    }

    pub fn unarray(&self) -> Option<&Type> {
        match self {
            Type::Array(x) => Some(&**x),
            _ => None,
        }
    }

    pub fn strip_low_cardinality(&self) -> &Type {
        match self {
            Type::LowCardinality(x) => x,
            _ => self,
        }
    }

    /// Byte width of one row for fixed-width types, `None` for everything
    /// else (String and the wrappers).
    pub fn fixed_width(&self) -> Option<usize> {
        Some(match self {
            Type::Int8 | Type::UInt8 => 1,
            Type::Int16 | Type::UInt16 | Type::Date => 2,
            Type::Int32 | Type::UInt32 | Type::Float32 | Type::Decimal32(_) | Type::DateTime(_) => {
                4
            }
            Type::Int64
            | Type::UInt64
            | Type::Float64
            | Type::Decimal64(_)
            | Type::DateTime64(_, _) => 8,
            Type::Int128 | Type::UInt128 | Type::Decimal128(_) | Type::Uuid => 16,
            Type::Int256 | Type::UInt256 | Type::Decimal256(_) => 32,
            Type::FixedString(n) => *n,
            _ => return None,
        })
    }
}

// We assume complete identifier normalization and type resolution from the
// server, so a plain recursive-descent pass over the type string suffices.
fn eat_identifier(input: &str) -> (&str, &str) {
    for (i, c) in input.char_indices() {
        if c.is_alphabetic() || c == '_' || c == '$' || (i > 0 && c.is_numeric()) {
            continue;
        } else {
            return (&input[..i], &input[i..]);
        }
    }
    (input, "")
}

fn parse_args(input: &str) -> Result<Vec<&str>> {
    if !input.starts_with('(') || !input.ends_with(')') {
        return Err(Error::UnsupportedType(format!(
            "malformed arguments to type: '{input}'"
        )));
    }
    let input = input[1..input.len() - 1].trim();
    let mut out = vec![];
    let mut in_parens = 0usize;
    let mut last_start = 0;
    for (i, c) in input.char_indices() {
        match c {
            ',' => {
                if in_parens == 0 {
                    out.push(input[last_start..i].trim());
                    last_start = i + 1;
                }
            }
            '(' => {
                in_parens += 1;
            }
            ')' => {
                if in_parens == 0 {
                    return Err(Error::UnsupportedType(format!(
                        "mismatched parenthesis in '{input}'"
                    )));
                }
                in_parens -= 1;
            }
            _ => (),
        }
    }
    if in_parens != 0 {
        return Err(Error::UnsupportedType(format!(
            "mismatched parenthesis in '{input}'"
        )));
    }
    if last_start != input.len() {
        out.push(input[last_start..input.len()].trim());
    }
    Ok(out)
}

fn parse_usize(what: &str, from: &str) -> Result<usize> {
    from.parse()
        .map_err(|_| Error::UnsupportedType(format!("couldn't parse {what}: '{from}'")))
}

fn parse_tz(what: &str, arg: &str) -> Result<Tz> {
    if !arg.starts_with('\'') || !arg.ends_with('\'') || arg.len() < 2 {
        return Err(Error::UnsupportedType(format!(
            "failed to parse timezone for {what}: '{arg}'"
        )));
    }
    arg[1..arg.len() - 1].parse().map_err(|e| {
        Error::UnsupportedType(format!("failed to parse timezone for {what}: '{arg}': {e}"))
    })
}

fn expect_args(ident: &str, args: &[&str], count: usize) -> Result<()> {
    if args.len() != count {
        return Err(Error::UnsupportedType(format!(
            "bad arg count for {ident}, expected {count} and got {}",
            args.len()
        )));
    }
    Ok(())
}

impl FromStr for Type {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (ident, following) = eat_identifier(s);
        if ident.is_empty() {
            return Err(Error::UnsupportedType(format!(
                "invalid empty identifier for type: '{s}'"
            )));
        }
        let following = following.trim();
        if !following.is_empty() {
            let args = parse_args(following)?;
            return Ok(match ident {
                "Decimal" => {
                    expect_args(ident, &args, 2)?;
                    let p = parse_usize("precision", args[0])?;
                    let s = parse_usize("scale", args[1])?;
                    if p <= 9 {
                        Type::Decimal32(s)
                    } else if p <= 18 {
                        Type::Decimal64(s)
                    } else if p <= 38 {
                        Type::Decimal128(s)
                    } else if p <= 76 {
                        Type::Decimal256(s)
                    } else {
                        return Err(Error::UnsupportedType(
                            "bad decimal spec, cannot exceed 76 precision".to_string(),
                        ));
                    }
                }
                "Decimal32" => {
                    expect_args(ident, &args, 1)?;
                    Type::Decimal32(parse_usize("scale", args[0])?)
                }
                "Decimal64" => {
                    expect_args(ident, &args, 1)?;
                    Type::Decimal64(parse_usize("scale", args[0])?)
                }
                "Decimal128" => {
                    expect_args(ident, &args, 1)?;
                    Type::Decimal128(parse_usize("scale", args[0])?)
                }
                "Decimal256" => {
                    expect_args(ident, &args, 1)?;
                    Type::Decimal256(parse_usize("scale", args[0])?)
                }
                "FixedString" => {
                    expect_args(ident, &args, 1)?;
                    Type::FixedString(parse_usize("size", args[0])?)
                }
                "DateTime" => {
                    expect_args(ident, &args, 1)?;
                    Type::DateTime(parse_tz(ident, args[0])?)
                }
                "DateTime64" => match args.len() {
                    1 => Type::DateTime64(parse_usize("precision", args[0])?, chrono_tz::UTC),
                    2 => Type::DateTime64(
                        parse_usize("precision", args[0])?,
                        parse_tz(ident, args[1])?,
                    ),
                    n => {
                        return Err(Error::UnsupportedType(format!(
                            "bad arg count for DateTime64, expected 1 or 2 and got {n}"
                        )))
                    }
                },
                "LowCardinality" => {
                    expect_args(ident, &args, 1)?;
                    Type::LowCardinality(Box::new(Type::from_str(args[0])?))
                }
                "Array" => {
                    expect_args(ident, &args, 1)?;
                    Type::Array(Box::new(Type::from_str(args[0])?))
                }
                "Nullable" => {
                    expect_args(ident, &args, 1)?;
                    Type::Nullable(Box::new(Type::from_str(args[0])?))
                }
                _ => {
                    return Err(Error::UnsupportedType(format!(
                        "unsupported parameterized type: '{s}'"
                    )))
                }
            });
        }
        Ok(match ident {
            "Int8" => Type::Int8,
            "Int16" => Type::Int16,
            "Int32" => Type::Int32,
            "Int64" => Type::Int64,
            "Int128" => Type::Int128,
            "Int256" => Type::Int256,
            "UInt8" => Type::UInt8,
            "UInt16" => Type::UInt16,
            "UInt32" => Type::UInt32,
            "UInt64" => Type::UInt64,
            "UInt128" => Type::UInt128,
            "UInt256" => Type::UInt256,
            "Float32" => Type::Float32,
            "Float64" => Type::Float64,
            "String" => Type::String,
            "UUID" => Type::Uuid,
            "Date" => Type::Date,
            "DateTime" => Type::DateTime(chrono_tz::UTC),
            _ => return Err(Error::UnsupportedType(format!("unsupported type: '{s}'"))),
        })
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int8 => write!(f, "Int8"),
            Type::Int16 => write!(f, "Int16"),
            Type::Int32 => write!(f, "Int32"),
            Type::Int64 => write!(f, "Int64"),
            Type::Int128 => write!(f, "Int128"),
            Type::Int256 => write!(f, "Int256"),
            Type::UInt8 => write!(f, "UInt8"),
            Type::UInt16 => write!(f, "UInt16"),
            Type::UInt32 => write!(f, "UInt32"),
            Type::UInt64 => write!(f, "UInt64"),
            Type::UInt128 => write!(f, "UInt128"),
            Type::UInt256 => write!(f, "UInt256"),
            Type::Float32 => write!(f, "Float32"),
            Type::Float64 => write!(f, "Float64"),
            Type::Decimal32(s) => write!(f, "Decimal32({s})"),
            Type::Decimal64(s) => write!(f, "Decimal64({s})"),
            Type::Decimal128(s) => write!(f, "Decimal128({s})"),
            Type::Decimal256(s) => write!(f, "Decimal256({s})"),
            Type::String => write!(f, "String"),
            Type::FixedString(n) => write!(f, "FixedString({n})"),
            Type::Uuid => write!(f, "UUID"),
            Type::Date => write!(f, "Date"),
            Type::DateTime(tz) => {
                if *tz == chrono_tz::UTC {
                    write!(f, "DateTime")
                } else {
                    write!(f, "DateTime('{tz}')")
                }
            }
            Type::DateTime64(precision, tz) => {
                if *tz == chrono_tz::UTC {
                    write!(f, "DateTime64({precision})")
                } else {
                    write!(f, "DateTime64({precision}, '{tz}')")
                }
            }
            Type::LowCardinality(inner) => write!(f, "LowCardinality({inner})"),
            Type::Array(inner) => write!(f, "Array({inner})"),
            Type::Nullable(inner) => write!(f, "Nullable({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        for s in [
            "Int8",
            "UInt256",
            "Float64",
            "String",
            "FixedString(16)",
            "UUID",
            "Date",
            "DateTime",
            "DateTime('America/New_York')",
            "DateTime64(3)",
            "DateTime64(6, 'Europe/Berlin')",
            "Decimal32(4)",
            "Decimal256(40)",
            "Nullable(Int32)",
            "Array(Nullable(String))",
            "LowCardinality(Nullable(String))",
            "Array(Array(UInt64))",
        ] {
            let parsed: Type = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s, "display round trip for {s}");
        }
    }

    #[test]
    fn decimal_width_selection() {
        assert_eq!("Decimal(9, 2)".parse::<Type>().unwrap(), Type::Decimal32(2));
        assert_eq!(
            "Decimal(18, 4)".parse::<Type>().unwrap(),
            Type::Decimal64(4)
        );
        assert_eq!(
            "Decimal(38, 10)".parse::<Type>().unwrap(),
            Type::Decimal128(10)
        );
        assert_eq!(
            "Decimal(76, 10)".parse::<Type>().unwrap(),
            Type::Decimal256(10)
        );
        assert!("Decimal(77, 0)".parse::<Type>().is_err());
    }

    #[test]
    fn unknown_types_rejected() {
        for s in ["Enum8('a' = 1)", "Map(String, String)", "Nothing", "Tuple(UInt8, String)"] {
            let err = s.parse::<Type>().unwrap_err();
            assert!(matches!(err, Error::UnsupportedType(_)), "{s}: {err:?}");
        }
    }

    #[test]
    fn fixed_widths() {
        assert_eq!(Type::UInt8.fixed_width(), Some(1));
        assert_eq!(Type::Date.fixed_width(), Some(2));
        assert_eq!(Type::DateTime(chrono_tz::UTC).fixed_width(), Some(4));
        assert_eq!(Type::Uuid.fixed_width(), Some(16));
        assert_eq!(Type::Int256.fixed_width(), Some(32));
        assert_eq!(Type::FixedString(7).fixed_width(), Some(7));
        assert_eq!(Type::String.fixed_width(), None);
        assert_eq!(
            Type::Nullable(Box::new(Type::UInt8)).fixed_width(),
            None
        );
    }
}
