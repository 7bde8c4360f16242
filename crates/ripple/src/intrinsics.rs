//! Built-in operations callable from the UI language.
//!
//! Each intrinsic has a fixed identifier (its discriminant, stored in
//! `CALL_INTRINSIC`) and a declared arity checked at link time.

use std::{borrow::Cow, ops::RangeInclusive, rc::Rc};

use crate::value::{Value, as_integer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Intrinsic {
    Len = 0,
    Str = 1,
    Format = 2,
    Range = 3,
    Abs = 4,
    Min = 5,
    Max = 6,
    Round = 7,
    IsError = 8,
    Append = 9,
    Remove = 10,
    /// Resolves a host provider by key.
    Inject = 11,
    /// Joins the pieces of an f-string. Not nameable from source.
    Concat = 12,
}

/// Arguments past this count are rejected by the linker.
pub const MAX_ARGS: usize = 255;

impl Intrinsic {
    /// Looks up an intrinsic by its source name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        name.parse().ok().filter(|i| *i != Self::Concat)
    }

    #[must_use]
    pub fn arity(self) -> RangeInclusive<usize> {
        match self {
            Self::Len | Self::Str | Self::Abs | Self::Round | Self::IsError | Self::Inject => 1..=1,
            Self::Range => 1..=2,
            Self::Append | Self::Remove => 2..=2,
            Self::Format | Self::Min | Self::Max => 1..=MAX_ARGS,
            Self::Concat => 0..=MAX_ARGS,
        }
    }

    /// Length of the list `call` would build from `args`, checked by the VM against
    /// its collection bound first.
    #[must_use]
    pub fn result_len(self, args: &[Value]) -> Option<usize> {
        match (self, args) {
            (Self::Range, [Value::Number(end)]) => range_len(0.0, *end),
            (Self::Range, [Value::Number(start), Value::Number(end)]) => range_len(*start, *end),
            (Self::Append, [Value::List(items), _]) => Some(items.len().saturating_add(1)),
            _ => None,
        }
    }

    /// Evaluates a pure intrinsic. `Inject` needs the provider registry and is
    /// handled by the VM.
    pub fn call(self, args: &[Value]) -> Result<Value, Cow<'static, str>> {
        match (self, args) {
            (Self::Len, [value]) => {
                let len = match value {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.len(),
                    Value::Map(map) => map.len(),
                    other => return Err(format!("object of type '{}' has no len()", other.type_name()).into()),
                };
                Ok(Value::Number(len as f64))
            }
            (Self::Str, [value]) => Ok(Value::Str(value.to_string().into())),
            (Self::Format, [Value::Str(template), rest @ ..]) => Ok(Value::Str(format_template(template, rest).into())),
            (Self::Format, [other, ..]) => Err(format!("format() template must be a str, not '{}'", other.type_name()).into()),
            (Self::Range, [end]) => range(&Value::Number(0.0), end),
            (Self::Range, [start, end]) => range(start, end),
            (Self::Abs, [Value::Number(n)]) => Ok(Value::Number(n.abs())),
            (Self::Round, [Value::Number(n)]) => Ok(Value::Number(n.round_ties_even())),
            (Self::Min | Self::Max, [Value::List(items)]) => self.extreme(items),
            (Self::Min | Self::Max, args) => self.extreme(args),
            (Self::IsError, [value]) => Ok(Value::Bool(matches!(value, Value::Error(_)))),
            (Self::Append, [Value::List(items), value]) => {
                let mut items = items.as_ref().clone();
                items.push(value.clone());
                Ok(items.into())
            }
            (Self::Remove, [Value::List(items), value]) => {
                let mut items = items.as_ref().clone();
                let index = items.iter().position(|item| item == value).ok_or("remove(): value not in list")?;
                items.remove(index);
                Ok(Value::List(Rc::new(items)))
            }
            (Self::Concat, parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.to_string());
                }
                Ok(Value::Str(out.into()))
            }
            (Self::Inject, _) => Err("inject() is resolved by the VM".into()),
            (intrinsic, args) => Err(format!(
                "{intrinsic}() does not accept ({})",
                args.iter().map(Value::type_name).collect::<Vec<_>>().join(", ")
            )
            .into()),
        }
    }

    fn extreme(self, values: &[Value]) -> Result<Value, Cow<'static, str>> {
        let mut best: Option<f64> = None;
        for value in values {
            let Value::Number(n) = value else {
                return Err(format!("{self}() expects numbers, got '{}'", value.type_name()).into());
            };
            best = Some(match (best, self) {
                (None, _) => *n,
                (Some(b), Self::Min) => b.min(*n),
                (Some(b), _) => b.max(*n),
            });
        }
        best.map(Value::Number)
            .ok_or_else(|| format!("{self}() arg is an empty sequence").into())
    }
}

/// Substitutes `{}` placeholders left to right. `{{` and `}}` escape braces.
fn format_template(template: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('{', Some('{')) | ('}', Some('}')) => {
                out.push(c);
                chars.next();
            }
            ('{', Some('}')) => {
                chars.next();
                match args.next() {
                    Some(arg) => out.push_str(&arg.to_string()),
                    None => out.push_str("{}"),
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn range(start: &Value, end: &Value) -> Result<Value, Cow<'static, str>> {
    let (Value::Number(start), Value::Number(end)) = (start, end) else {
        return Err("range() expects integer arguments".into());
    };
    let (Some(start), Some(end)) = (as_integer(*start), as_integer(*end)) else {
        return Err("range() expects integer arguments".into());
    };
    Ok((start..end).map(|i| Value::Number(i as f64)).collect::<Vec<_>>().into())
}

fn range_len(start: f64, end: f64) -> Option<usize> {
    let (start, end) = (as_integer(start)?, as_integer(end)?);
    Some(usize::try_from(end.saturating_sub(start)).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn source_names() {
        assert_eq!(Intrinsic::from_name("len"), Some(Intrinsic::Len));
        assert_eq!(Intrinsic::from_name("is_error"), Some(Intrinsic::IsError));
        assert_eq!(Intrinsic::from_name("concat"), None);
        assert_eq!(Intrinsic::from_repr(3), Some(Intrinsic::Range));
    }

    #[test]
    fn format_placeholders() {
        let out = Intrinsic::Format
            .call(&[Value::from("{} of {} {{x}}"), Value::Number(2.0), Value::Number(5.0)])
            .unwrap();
        assert_eq!(out, Value::from("2 of 5 {x}"));
    }

    #[test]
    fn range_and_len() {
        let list = Intrinsic::Range.call(&[Value::Number(1.0), Value::Number(4.0)]).unwrap();
        assert_eq!(list.to_string(), "[1, 2, 3]");
        assert_eq!(Intrinsic::Len.call(&[list]).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn list_helpers_return_new_lists() {
        let list = Value::from(vec![Value::Number(1.0), Value::Number(2.0)]);
        let appended = Intrinsic::Append.call(&[list.clone(), Value::Number(3.0)]).unwrap();
        assert_eq!(appended.to_string(), "[1, 2, 3]");
        assert_eq!(list.to_string(), "[1, 2]");
        let removed = Intrinsic::Remove.call(&[appended, Value::Number(1.0)]).unwrap();
        assert_eq!(removed.to_string(), "[2, 3]");
    }

    #[test]
    fn min_of_list_or_args() {
        let list = Value::from(vec![Value::Number(4.0), Value::Number(-1.0)]);
        assert_eq!(Intrinsic::Min.call(&[list]).unwrap(), Value::Number(-1.0));
        assert_eq!(
            Intrinsic::Max.call(&[Value::Number(1.0), Value::Number(7.0)]).unwrap(),
            Value::Number(7.0)
        );
    }

    #[test]
    fn range_length_is_known_before_building() {
        assert_eq!(Intrinsic::Range.result_len(&[Value::Number(4e15)]), Some(4_000_000_000_000_000));
        assert_eq!(Intrinsic::Range.result_len(&[Value::Number(5.0), Value::Number(2.0)]), Some(0));
        assert_eq!(Intrinsic::Range.result_len(&[Value::Number(0.5)]), None);
        assert_eq!(Intrinsic::Len.result_len(&[Value::from("abc")]), None);
    }
}
