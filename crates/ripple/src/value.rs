//! Runtime values manipulated by the VM.

use std::{borrow::Cow, fmt, rc::Rc};

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    bytecode::vm::{nodes::NodeId, remote::RemoteError, scope::ScopeId},
    expressions::{CmpOperator, Operator},
    reactive::SignalId,
};

/// Map value. Keys are strings, insertion ordered.
pub type Map = IndexMap<Rc<str>, Value, ahash::RandomState>;

/// A value on the operand stack, in a scope binding or inside a signal.
///
/// Compound values are reference counted and immutable: list intrinsics return new
/// lists, so a signal write always compares a fresh value against the old one.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    List(Rc<Vec<Value>>),
    Map(Rc<Map>),
    /// Handle to a signal or computed value. Copying the handle shares the signal.
    Signal(SignalId),
    Closure(Rc<Closure>),
    Node(NodeId),
    /// Failure delivered by a remote call.
    Error(Rc<RemoteError>),
}

/// A function value with its captured values.
///
/// Captures are copied in at creation time; signal captures are handles, so the
/// closure and the scope it was created in observe the same signal.
#[derive(Debug)]
pub struct Closure {
    /// Entry address of the function body.
    pub addr: u32,
    pub captures: SmallVec<[Value; 4]>,
    /// Render scope that was active when the closure was created. Remote calls made
    /// while the closure runs are tied to this scope's lifetime.
    pub owner: ScopeId,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b) || a == b,
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b) || a.as_ref() == b.as_ref(),
            (Self::Signal(a), Self::Signal(b)) => a == b,
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(a, b),
            (Self::Node(a), Self::Node(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.into())
    }
}

impl From<Vec<Self>> for Value {
    fn from(items: Vec<Self>) -> Self {
        Self::List(Rc::new(items))
    }
}

impl Value {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "dict",
            Self::Signal(_) => "signal",
            Self::Closure(_) => "function",
            Self::Node(_) => "node",
            Self::Error(_) => "error",
        }
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None | Self::Error(_) => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            Self::Signal(_) | Self::Closure(_) | Self::Node(_) => true,
        }
    }

    /// Length of the list (elements) or string (bytes) `binary` would build, so the
    /// caller can refuse it before anything is allocated. `None` for numeric results.
    #[must_use]
    pub fn binary_len(&self, op: Operator, rhs: &Self) -> Option<usize> {
        match (op, self, rhs) {
            (Operator::Add, Self::Str(a), Self::Str(b)) => Some(a.len().saturating_add(b.len())),
            (Operator::Add, Self::List(a), Self::List(b)) => Some(a.len().saturating_add(b.len())),
            (Operator::Mul, Self::Str(s), Self::Number(n)) | (Operator::Mul, Self::Number(n), Self::Str(s)) => {
                Some(s.len().saturating_mul(repeat_count(*n)))
            }
            (Operator::Mul, Self::List(items), Self::Number(n)) => Some(items.len().saturating_mul(repeat_count(*n))),
            _ => None,
        }
    }

    /// Applies an arithmetic operator.
    pub fn binary(&self, op: Operator, rhs: &Self) -> Result<Self, Cow<'static, str>> {
        match (op, self, rhs) {
            (Operator::Add, Self::Number(a), Self::Number(b)) => Ok(Self::Number(a + b)),
            (Operator::Add, Self::Str(a), Self::Str(b)) => Ok(Self::Str(format!("{a}{b}").into())),
            (Operator::Add, Self::List(a), Self::List(b)) => {
                let mut items = Vec::with_capacity(a.len() + b.len());
                items.extend(a.iter().cloned());
                items.extend(b.iter().cloned());
                Ok(items.into())
            }
            (Operator::Sub, Self::Number(a), Self::Number(b)) => Ok(Self::Number(a - b)),
            (Operator::Mul, Self::Number(a), Self::Number(b)) => Ok(Self::Number(a * b)),
            (Operator::Mul, Self::Str(s), Self::Number(n)) | (Operator::Mul, Self::Number(n), Self::Str(s)) => {
                let count = repeat_count(*n);
                s.len().checked_mul(count).ok_or("repeated str is too long")?;
                Ok(Self::Str(s.repeat(count).into()))
            }
            (Operator::Mul, Self::List(items), Self::Number(n)) => {
                let count = repeat_count(*n);
                let len = items.len().checked_mul(count).ok_or("repeated list is too long")?;
                let mut out = Vec::with_capacity(len);
                for _ in 0..count {
                    out.extend(items.iter().cloned());
                }
                Ok(out.into())
            }
            (Operator::Div | Operator::Mod, Self::Number(_), Self::Number(b)) if *b == 0.0 => {
                Err("division by zero".into())
            }
            (Operator::Div, Self::Number(a), Self::Number(b)) => Ok(Self::Number(a / b)),
            // floored modulo: the result takes the sign of the divisor
            (Operator::Mod, Self::Number(a), Self::Number(b)) => Ok(Self::Number(a - b * (a / b).floor())),
            (op, lhs, rhs) => Err(format!(
                "unsupported operand types for {op}: '{}' and '{}'",
                lhs.type_name(),
                rhs.type_name()
            )
            .into()),
        }
    }

    /// Applies a comparison operator.
    pub fn compare(&self, op: CmpOperator, rhs: &Self) -> Result<Self, Cow<'static, str>> {
        let ordering = match op {
            CmpOperator::Eq => return Ok(Self::Bool(self == rhs)),
            CmpOperator::NotEq => return Ok(Self::Bool(self != rhs)),
            _ => match (self, rhs) {
                (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
                (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(format!(
                        "'{op}' not supported between '{}' and '{}'",
                        self.type_name(),
                        rhs.type_name()
                    )
                    .into());
                }
            },
        };
        let Some(ordering) = ordering else {
            // NaN compares false with everything
            return Ok(Self::Bool(false));
        };
        Ok(Self::Bool(match op {
            CmpOperator::Lt => ordering.is_lt(),
            CmpOperator::LtE => ordering.is_le(),
            CmpOperator::Gt => ordering.is_gt(),
            CmpOperator::GtE => ordering.is_ge(),
            CmpOperator::Eq | CmpOperator::NotEq => unreachable!("handled above"),
        }))
    }

    /// `value[index]` for lists (integral, negative from the end), strings and maps.
    pub fn get_item(&self, index: &Self) -> Result<Self, Cow<'static, str>> {
        match (self, index) {
            (Self::List(items), Self::Number(n)) => {
                let i = resolve_index(*n, items.len()).ok_or("list index out of range")?;
                Ok(items[i].clone())
            }
            (Self::Str(s), Self::Number(n)) => {
                let count = s.chars().count();
                let i = resolve_index(*n, count).ok_or("string index out of range")?;
                Ok(s.chars().nth(i).map(|c| Self::Str(c.to_string().into())).unwrap_or_default())
            }
            (Self::Map(map), Self::Str(key)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| format!("key not found: '{key}'").into()),
            (container, index) => Err(format!(
                "'{}' cannot be indexed by '{}'",
                container.type_name(),
                index.type_name()
            )
            .into()),
        }
    }

    /// Converts to the structured encoding used for remote-call arguments.
    pub fn to_json(&self) -> Result<serde_json::Value, Cow<'static, str>> {
        Ok(match self {
            Self::None => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => {
                if let Some(i) = as_integer(*n) {
                    serde_json::Value::from(i)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .ok_or("non-finite numbers cannot be sent to the server")?
                }
            }
            Self::Str(s) => serde_json::Value::String(s.to_string()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect::<Result<_, _>>()?),
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.to_string(), v.to_json()?)))
                    .collect::<Result<_, Cow<'static, str>>>()?,
            ),
            other => return Err(format!("a {} cannot be sent to the server", other.type_name()).into()),
        })
    }

    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Self::Str(s.as_str().into()),
            serde_json::Value::Array(items) => items.iter().map(Self::from_json).collect::<Vec<_>>().into(),
            serde_json::Value::Object(map) => Self::Map(Rc::new(
                map.iter().map(|(k, v)| (Rc::from(k.as_str()), Self::from_json(v))).collect(),
            )),
        }
    }

    /// Representation used inside containers: strings are quoted.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Self::Str(s) => format!("'{s}'"),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Number(n) => write_number(f, *n),
            Self::Str(s) => f.write_str(s),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&item.repr())?;
                }
                f.write_str("]")
            }
            Self::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{key}': {}", value.repr())?;
                }
                f.write_str("}")
            }
            Self::Signal(id) => write!(f, "<signal {id}>"),
            Self::Closure(closure) => write!(f, "<function @{}>", closure.addr),
            Self::Node(id) => write!(f, "<node {id}>"),
            Self::Error(err) => write!(f, "error: {err}"),
        }
    }
}

/// Integral numbers print without a fractional part, everything else via `ryu`.
fn write_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if let Some(i) = as_integer(n) {
        return write!(f, "{i}");
    }
    if n.is_nan() {
        return f.write_str("nan");
    }
    if n.is_infinite() {
        return f.write_str(if n > 0.0 { "inf" } else { "-inf" });
    }
    let mut buffer = ryu::Buffer::new();
    f.write_str(buffer.format_finite(n))
}

/// Returns the number as an integer when it is integral and exactly representable.
#[expect(clippy::cast_possible_truncation, reason = "range is checked first")]
pub(crate) fn as_integer(n: f64) -> Option<i64> {
    const LIMIT: f64 = 9_007_199_254_740_992.0;
    (n.fract() == 0.0 && n.abs() <= LIMIT).then_some(n as i64)
}

fn resolve_index(n: f64, len: usize) -> Option<usize> {
    let i = as_integer(n)?;
    let len = i64::try_from(len).ok()?;
    let i = if i < 0 { i + len } else { i };
    if (0..len).contains(&i) { usize::try_from(i).ok() } else { None }
}

fn repeat_count(n: f64) -> usize {
    as_integer(n).and_then(|i| usize::try_from(i).ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_display_without_fraction() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(-0.5).to_string(), "-0.5");
        assert_eq!(Value::Number(1e21).to_string(), "1e21");
        assert_eq!(Value::from(vec![Value::from(1.0), Value::from("a")]).to_string(), "[1, 'a']");
    }

    #[test]
    fn floored_modulo() {
        let r = Value::Number(-7.0).binary(Operator::Mod, &Value::Number(3.0)).unwrap();
        assert_eq!(r, Value::Number(2.0));
        assert!(Value::Number(1.0).binary(Operator::Div, &Value::Number(0.0)).is_err());
    }

    #[test]
    fn mixed_addition_is_a_type_error() {
        let err = Value::from("a").binary(Operator::Add, &Value::Number(1.0)).unwrap_err();
        assert_eq!(err, "unsupported operand types for +: 'str' and 'number'");
    }

    #[test]
    fn negative_list_index() {
        let list = Value::from(vec![Value::from(1.0), Value::from(2.0)]);
        assert_eq!(list.get_item(&Value::Number(-1.0)).unwrap(), Value::Number(2.0));
        assert!(list.get_item(&Value::Number(2.0)).is_err());
    }

    #[test]
    fn json_round_trip_keeps_integers() {
        let value = Value::from(vec![Value::Number(4.0), Value::from("x"), Value::Bool(true)]);
        let json = value.to_json().unwrap();
        assert_eq!(json.to_string(), r#"[4,"x",true]"#);
        assert_eq!(Value::from_json(&json), value);
    }

    #[test]
    fn repeat_lengths_are_known_up_front() {
        let list = Value::from(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(list.binary_len(Operator::Mul, &Value::Number(3.0)), Some(6));
        assert_eq!(Value::from("ab").binary_len(Operator::Mul, &Value::Number(9e15)), Some(18_000_000_000_000_000));
        assert_eq!(Value::Number(2.0).binary_len(Operator::Mul, &Value::Number(3.0)), None);
        assert_eq!(list.binary(Operator::Mul, &Value::Number(2.0)).unwrap().to_string(), "[1, 2, 1, 2]");
    }
}
