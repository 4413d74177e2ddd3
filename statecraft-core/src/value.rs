//! Values
//!
//! The engine is agnostic to what components compute, but it has to store,
//! compare and persist those results. `Value` is the closed set of shapes it
//! understands. Math expressions are carried as an opaque tree; the engine
//! never parses or simplifies them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// A structured math expression.
///
/// Produced and consumed by component definitions. The engine only clones,
/// compares and serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MathTree {
    Number(#[serde(with = "lossless_f64")] f64),
    Symbol(String),
    Apply {
        operator: String,
        operands: Vec<MathTree>,
    },
}

impl MathTree {
    /// Placeholder expression used when there is nothing to show.
    pub const BLANK: &'static str = "\u{FF3F}";

    pub fn number(n: f64) -> Self {
        Self::Number(n)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    pub fn apply(operator: impl Into<String>, operands: Vec<MathTree>) -> Self {
        Self::Apply {
            operator: operator.into(),
            operands,
        }
    }

    pub fn blank() -> Self {
        Self::Symbol(Self::BLANK.to_string())
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Self::Symbol(s) if s == Self::BLANK)
    }

    /// Numeric value if this is a bare number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for MathTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Symbol(s) => f.write_str(s),
            Self::Apply { operator, operands } => {
                write!(f, "{operator}(")?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{operand}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A state variable value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(#[serde(with = "lossless_f64")] f64),
    String(String),
    Math(MathTree),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view. Math trees that are a bare number count.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Math(tree) => tree.as_number(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_math(&self) -> Option<&MathTree> {
        match self {
            Self::Math(tree) => Some(tree),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short description of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "a boolean",
            Self::Number(_) => "a number",
            Self::String(_) => "a string",
            Self::Math(_) => "a math expression",
            Self::List(_) => "a list",
        }
    }

    /// Like [`as_number`](Self::as_number) but as a definition error.
    pub fn expect_number(&self) -> Result<f64, DefinitionError> {
        self.as_number().ok_or_else(|| DefinitionError::WrongValue {
            expected: "a number",
            found: self.kind().to_string(),
        })
    }

    pub fn expect_bool(&self) -> Result<bool, DefinitionError> {
        self.as_bool().ok_or_else(|| DefinitionError::WrongValue {
            expected: "a boolean",
            found: self.kind().to_string(),
        })
    }

    pub fn expect_math(&self) -> Result<&MathTree, DefinitionError> {
        self.as_math().ok_or_else(|| DefinitionError::WrongValue {
            expected: "a math expression",
            found: self.kind().to_string(),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Math(tree) => write!(f, "{tree}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<MathTree> for Value {
    fn from(tree: MathTree) -> Self {
        Self::Math(tree)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

/// Numbers that survive formats without infinities or NaN.
///
/// Finite values are plain numbers. The others are written as the strings
/// `"Infinity"`, `"-Infinity"` and `"NaN"`. Integers are accepted on read.
mod lossless_f64 {
    use std::fmt;

    use serde::de::{self, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};

    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";
    const NAN: &str = "NaN";

    pub(super) fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        match *n {
            n if n.is_finite() => serializer.serialize_f64(n),
            n if n.is_nan() => serializer.serialize_str(NAN),
            n if n > 0.0 => serializer.serialize_str(INFINITY),
            _ => serializer.serialize_str(NEG_INFINITY),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(NumberVisitor)
    }

    struct NumberVisitor;

    impl<'de> Visitor<'de> for NumberVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "a number, \"{INFINITY}\", \"{NEG_INFINITY}\" or \"{NAN}\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                NAN => Ok(f64::NAN),
                _ => Err(E::invalid_value(Unexpected::Str(v), &self)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_finite_numbers_are_named_in_json() {
        let values = Value::List(vec![
            Value::Number(f64::INFINITY),
            Value::Math(MathTree::number(f64::NEG_INFINITY)),
            Value::Number(2.5),
        ]);
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(
            json,
            r#"{"list":[{"number":"Infinity"},{"math":{"number":"-Infinity"}},{"number":2.5}]}"#
        );
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), values);

        let nan: Value = serde_json::from_str(r#"{"number":"NaN"}"#).unwrap();
        assert!(nan.as_number().is_some_and(f64::is_nan));
        assert_eq!(serde_json::from_str::<Value>(r#"{"number":3}"#).unwrap(), Value::Number(3.0));
        assert!(serde_json::from_str::<Value>(r#"{"number":"lots"}"#).is_err());
    }

    #[test]
    fn math_numbers_read_as_numbers() {
        let v = Value::Math(MathTree::number(3.0));
        assert_eq!(v.as_number(), Some(3.0));
        assert_eq!(Value::from("x").as_number(), None);
    }

    #[test]
    fn expect_reports_the_found_kind() {
        let err = Value::from("abc").expect_number().unwrap_err();
        assert_eq!(err.to_string(), "expected a number, found a string");
    }

    #[test]
    fn display_nests_applications() {
        let tree = MathTree::apply(
            "tuple",
            vec![MathTree::number(1.0), MathTree::symbol("y")],
        );
        assert_eq!(tree.to_string(), "tuple(1, y)");
        assert!(MathTree::blank().is_blank());
    }
}
