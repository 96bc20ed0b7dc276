use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;

/// Possible values carried by a fact or produced by an aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FactValue {
    /// String value
    String(String),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// Boolean value
    Boolean(bool),
    /// Array of `FactValues`; collection aggregates are arrays
    Array(Vec<FactValue>),
    /// Record of named fields, kept in key order so hashing and display are stable
    Object(BTreeMap<String, FactValue>),
    /// UTC date/time value
    Date(DateTime<Utc>),
    /// A keyed group of elements produced by grouping aggregations
    Group(Box<Grouping>),
    /// Null value
    Null,
}

/// A group of elements sharing a key.
///
/// Produced by the group-by and lookup aggregations. The key is the value the group was
/// formed on; for lookups it is the most recently seen key object for the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grouping {
    /// Grouping key
    pub key: FactValue,
    /// Elements in the order they joined the group
    pub elements: Vec<FactValue>,
}

impl Grouping {
    /// Create a new group
    #[must_use]
    pub const fn new(key: FactValue, elements: Vec<FactValue>) -> Self {
        Self { key, elements }
    }

    /// Number of elements in the group
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the group has no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

// -------------------------------------------------------------------------------------------------
// Equality and hashing. Floats compare bitwise for NaN so that `Eq` stays reflexive, and
// signed zeroes hash identically because they compare equal.
// -------------------------------------------------------------------------------------------------

impl PartialEq for FactValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Group(a), Self::Group(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

impl Eq for FactValue {}

impl std::hash::Hash for FactValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Self::Integer(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Self::Float(f) => {
                2u8.hash(state);
                let bits = if *f == 0.0 {
                    0.0f64.to_bits()
                } else if f.is_nan() {
                    f64::NAN.to_bits()
                } else {
                    f.to_bits()
                };
                bits.hash(state);
            }
            Self::Boolean(b) => {
                3u8.hash(state);
                b.hash(state);
            }
            Self::Array(arr) => {
                4u8.hash(state);
                arr.hash(state);
            }
            Self::Object(obj) => {
                5u8.hash(state);
                for (key, value) in obj {
                    key.hash(state);
                    value.hash(state);
                }
            }
            Self::Date(dt) => {
                6u8.hash(state);
                dt.timestamp_nanos_opt().unwrap_or(0).hash(state);
            }
            Self::Group(group) => {
                7u8.hash(state);
                group.hash(state);
            }
            Self::Null => {
                8u8.hash(state);
            }
        }
    }
}

impl PartialOrd for FactValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        use FactValue::{Boolean, Date, Float, Integer, Null, String};
        match (self, other) {
            (String(a), String(b)) => a.partial_cmp(b),
            (Integer(a), Integer(b)) => a.partial_cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Boolean(a), Boolean(b)) => a.partial_cmp(b),
            (Date(a), Date(b)) => a.partial_cmp(b),
            (Null, Null) => Some(Ordering::Equal),
            #[allow(clippy::cast_precision_loss)]
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl FactValue {
    /// Total ordering used for sort keys.
    ///
    /// Values that `partial_cmp` can order keep that order. Everything else falls back to a
    /// fixed rank per variant (null sorts first), then to element-wise comparison for
    /// containers. NaN sorts after every other float.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        if let Some(ordering) = self.partial_cmp(other) {
            return ordering;
        }
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Array(a), Self::Array(b)) => compare_sequences(a, b),
            (Self::Object(a), Self::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ordering = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Group(a), Self::Group(b)) => a
                .key
                .total_cmp(&b.key)
                .then_with(|| compare_sequences(&a.elements, &b.elements)),
            (Self::Integer(_), Self::Float(f)) if f.is_nan() => Ordering::Less,
            (Self::Float(f), Self::Integer(_)) if f.is_nan() => Ordering::Greater,
            _ => self.rank().cmp(&other.rank()),
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) | Self::Float(_) => 2,
            Self::String(_) => 3,
            Self::Date(_) => 4,
            Self::Array(_) => 5,
            Self::Object(_) => 6,
            Self::Group(_) => 7,
        }
    }
}

fn compare_sequences(a: &[FactValue], b: &[FactValue]) -> Ordering {
    for (left, right) in a.iter().zip(b.iter()) {
        let ordering = left.total_cmp(right);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(fl) => write!(f, "{fl}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Array(arr) => write_list(f, arr),
            Self::Object(obj) => {
                write!(f, "{{")?;
                for (i, (key, value)) in obj.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            Self::Date(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            Self::Group(group) => {
                write!(f, "{} => ", group.key)?;
                write_list(f, &group.elements)
            }
            Self::Null => write!(f, "null"),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[FactValue]) -> fmt::Result {
    write!(f, "[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "]")
}

// -------------------------------------------------------------------------------------------------
// Conversions between `FactValue` and `serde_json::Value`, so callers can feed JSON documents
// straight into a session. Groups serialise as `{"key": .., "elements": [..]}`.
// -------------------------------------------------------------------------------------------------

impl From<FactValue> for serde_json::Value {
    fn from(value: FactValue) -> Self {
        match value {
            FactValue::String(s) => Self::String(s),
            FactValue::Integer(i) => Self::Number(serde_json::Number::from(i)),
            FactValue::Float(f) => serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number),
            FactValue::Boolean(b) => Self::Bool(b),
            FactValue::Array(arr) => Self::Array(arr.into_iter().map(Into::into).collect()),
            FactValue::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            FactValue::Date(dt) => Self::String(dt.to_rfc3339()),
            FactValue::Group(group) => {
                let Grouping { key, elements } = *group;
                let mut map = serde_json::Map::new();
                map.insert("key".to_string(), key.into());
                map.insert(
                    "elements".to_string(),
                    Self::Array(elements.into_iter().map(Into::into).collect()),
                );
                Self::Object(map)
            }
            FactValue::Null => Self::Null,
        }
    }
}

impl TryFrom<&serde_json::Value> for FactValue {
    type Error = anyhow::Error;

    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float(f)
                } else {
                    return Err(anyhow!("Unsupported number value: {}", n));
                }
            }
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Array(arr) => {
                Self::Array(arr.iter().map(Self::try_from).collect::<Result<Vec<_>>>()?)
            }
            serde_json::Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (k, v) in map {
                    fields.insert(k.clone(), Self::try_from(v)?);
                }
                Self::Object(fields)
            }
            serde_json::Value::Null => Self::Null,
        })
    }
}

impl From<i64> for FactValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FactValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FactValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<FactValue>> for FactValue {
    fn from(value: Vec<Self>) -> Self {
        Self::Array(value)
    }
}

impl From<DateTime<Utc>> for FactValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Grouping> for FactValue {
    fn from(value: Grouping) -> Self {
        Self::Group(Box::new(value))
    }
}

impl<T: Into<FactValue>> From<Option<T>> for FactValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl FactValue {
    /// Build a record from `(field, value)` pairs
    #[must_use]
    pub fn record<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Self>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Return a copy of this record with `field` set to `value`.
    ///
    /// Non-record values are replaced by a single-field record.
    #[must_use]
    pub fn with(self, field: impl Into<String>, value: impl Into<Self>) -> Self {
        let mut fields = match self {
            Self::Object(fields) => fields,
            _ => BTreeMap::new(),
        };
        fields.insert(field.into(), value.into());
        Self::Object(fields)
    }

    /// Look up a field of a record
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Self> {
        match self {
            Self::Object(fields) => fields.get(field),
            _ => None,
        }
    }

    /// Look up a field, failing with a descriptive error when it is absent
    ///
    /// # Errors
    ///
    /// Returns an error when this value is not a record or has no such field.
    pub fn field(&self, field: &str) -> Result<&Self> {
        self.get(field)
            .ok_or_else(|| anyhow!("field '{field}' not found on {}", self.type_name()))
    }

    /// Integer field accessor for predicate code
    ///
    /// # Errors
    ///
    /// Returns an error when the field is absent or not an integer.
    pub fn field_i64(&self, field: &str) -> Result<i64> {
        let value = self.field(field)?;
        value
            .as_i64()
            .ok_or_else(|| anyhow!("field '{field}' is {}, expected integer", value.type_name()))
    }

    /// Numeric field accessor for predicate code
    ///
    /// # Errors
    ///
    /// Returns an error when the field is absent or not numeric.
    pub fn field_f64(&self, field: &str) -> Result<f64> {
        let value = self.field(field)?;
        value
            .as_f64()
            .ok_or_else(|| anyhow!("field '{field}' is {}, expected number", value.type_name()))
    }

    /// String field accessor for predicate code
    ///
    /// # Errors
    ///
    /// Returns an error when the field is absent or not a string.
    pub fn field_str(&self, field: &str) -> Result<&str> {
        let value = self.field(field)?;
        value
            .as_str()
            .ok_or_else(|| anyhow!("field '{field}' is {}, expected string", value.type_name()))
    }

    /// Strict integer accessor
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric accessor returning an `f64` for integers and floats
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String accessor
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean accessor
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Array accessor
    #[must_use]
    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Group accessor
    #[must_use]
    pub fn as_group(&self) -> Option<&Grouping> {
        match self {
            Self::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Number of elements for arrays, groups and records; `None` for scalars
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Array(items) => Some(items.len()),
            Self::Group(group) => Some(group.len()),
            Self::Object(fields) => Some(fields.len()),
            _ => None,
        }
    }

    /// Whether this is the null value
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Check if this value is "truthy" for conditional logic
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::Integer(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Array(arr) => !arr.is_empty(),
            Self::Object(obj) => !obj.is_empty(),
            Self::Group(group) => !group.is_empty(),
            Self::Date(_) => true,
            Self::Null => false,
        }
    }

    /// Get the type name as a string
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Date(_) => "date",
            Self::Group(_) => "group",
            Self::Null => "null",
        }
    }

    /// Create date from UTC timestamp
    #[must_use]
    pub fn date_from_timestamp(timestamp: i64) -> Self {
        Self::Date(DateTime::from_timestamp(timestamp, 0).unwrap_or_default())
    }

    /// Create date from ISO string
    ///
    /// # Errors
    ///
    /// Returns a `chrono::ParseError` if the ISO string cannot be parsed.
    pub fn date_from_iso(iso_string: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self::Date(
            DateTime::parse_from_rfc3339(iso_string)?.with_timezone(&Utc),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_record_accessors() {
        let account = FactValue::record([("id", FactValue::from(7)), ("owner", "ada".into())]);
        assert_eq!(account.field_i64("id").unwrap(), 7);
        assert_eq!(account.field_str("owner").unwrap(), "ada");
        assert!(account.field_i64("owner").is_err());
        assert!(account.field("missing").is_err());

        let updated = account.with("balance", -10);
        assert_eq!(updated.field_i64("balance").unwrap(), -10);
        assert_eq!(updated.len(), Some(3));
    }

    #[test]
    fn test_float_equality_and_hashing() {
        let mut seen = HashSet::new();
        seen.insert(FactValue::Float(0.0));
        assert!(seen.contains(&FactValue::Float(-0.0)));
        assert_eq!(FactValue::Float(f64::NAN), FactValue::Float(f64::NAN));
        assert_ne!(FactValue::Integer(1), FactValue::Float(1.0));
    }

    #[test]
    fn test_total_cmp_is_consistent_across_variants() {
        let mut values = vec![
            FactValue::from("b"),
            FactValue::Integer(3),
            FactValue::Null,
            FactValue::Float(1.5),
            FactValue::from("a"),
            FactValue::Boolean(true),
        ];
        values.sort_by(FactValue::total_cmp);
        assert_eq!(
            values,
            vec![
                FactValue::Null,
                FactValue::Boolean(true),
                FactValue::Float(1.5),
                FactValue::Integer(3),
                FactValue::from("a"),
                FactValue::from("b"),
            ]
        );
    }

    #[test]
    fn test_json_round_trip_of_groups() {
        let group = FactValue::from(Grouping::new("k".into(), vec![1.into(), 2.into()]));
        let json: serde_json::Value = group.into();
        assert_eq!(json["key"], serde_json::json!("k"));
        assert_eq!(json["elements"], serde_json::json!([1, 2]));

        let parsed = FactValue::try_from(&serde_json::json!({"id": 1, "tags": ["x"]})).unwrap();
        assert_eq!(parsed.field_i64("id").unwrap(), 1);
        assert_eq!(parsed.get("tags").and_then(FactValue::len), Some(1));
    }
}
