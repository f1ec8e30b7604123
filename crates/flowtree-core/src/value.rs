//! The dynamic value model: `Props` (an item's immutable content as seen at a
//! step's output) and `Aggregate<T>` (the `Present(T) | Absent` sum type used
//! by every aggregate step to represent an empty parent).

use serde_json::Value as JsonValue;

/// A property value. We piggyback on `serde_json::Value` rather than
/// inventing our own dynamic type: it already has the numeric/string/bool
/// variants every operator here needs, and the grouping-key canonicalization
/// the builder performs (`canonicalize(obj, properties) -> string`, §6) is
/// naturally "serialize to canonical JSON, then hash".
pub type Value = JsonValue;

/// An item's current content as seen at a particular step's output: a
/// mapping from property name to value.
pub type Props = serde_json::Map<String, Value>;

/// `Aggregate<T> = Present(T) | Absent`.
///
/// Min/max/average/pick naturally return *absent* for empty parents. Carried
/// as the old/new value of the `modified` event so the binder can decide
/// between "set property to value" and "delete property" when materializing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Aggregate<T> {
    Present(T),
    Absent,
}

impl<T> Aggregate<T> {
    pub fn as_ref(&self) -> Aggregate<&T> {
        match self {
            Aggregate::Present(v) => Aggregate::Present(v),
            Aggregate::Absent => Aggregate::Absent,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Aggregate::Absent)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Aggregate::Present(v) => Some(v),
            Aggregate::Absent => None,
        }
    }
}

impl Aggregate<f64> {
    /// Converts to the `Value` that gets written into (or removed from) the
    /// materialized tree: `Absent` becomes `Value::Null`, which the tree
    /// transform (§9 "Representation of absent aggregates") treats as a
    /// property deletion.
    pub fn to_json(self) -> Value {
        match self {
            Aggregate::Present(v) => serde_json::json!(v),
            Aggregate::Absent => Value::Null,
        }
    }
}

impl Aggregate<Props> {
    pub fn to_json(self) -> Value {
        match self {
            Aggregate::Present(props) => Value::Object(props),
            Aggregate::Absent => Value::Null,
        }
    }
}

/// Reads a property as `f64`, ignoring (treating as absent) non-numeric
/// values, per §4.7.2's "Non-numeric values are ignored."
pub fn as_numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}
