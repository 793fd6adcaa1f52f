//! Wire envelope for job arguments.
//!
//! Payloads crossing the broker are a typed union rather than free-form
//! JSON: scalars, sequences, mappings, and a tagged [`ObjectRef`] pointing at
//! a stored document. Producers encode, consumers decode; nothing walks
//! payloads looking for magic values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A reference to a document in a named collection.
///
/// Serialized with a `$ref` marker so it is distinguishable from an ordinary
/// mapping on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "$ref")]
    pub collection: String,
    pub id: String,
}

impl ObjectRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// A value in a job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<ArgValue>),
    // Ref must come before Map so the `$ref` marker wins during decode.
    Ref(ObjectRef),
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ref_value(&self) -> Option<&ObjectRef> {
        match self {
            ArgValue::Ref(r) => Some(r),
            _ => None,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        ArgValue::Int(i)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

impl From<ObjectRef> for ArgValue {
    fn from(r: ObjectRef) -> Self {
        ArgValue::Ref(r)
    }
}

/// Positional and keyword arguments for a job body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub args: Vec<ArgValue>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, ArgValue>,
}

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<ArgValue>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwarg(&self, key: &str) -> Option<&ArgValue> {
        self.kwargs.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let values = vec![
            ArgValue::Null,
            ArgValue::Bool(true),
            ArgValue::Int(-7),
            ArgValue::Float(1.5),
            ArgValue::Str("hello".into()),
        ];
        for v in values {
            let json = serde_json::to_string(&v).unwrap();
            let back: ArgValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn object_ref_decodes_as_ref_not_map() {
        let json = r#"{"$ref":"repositories","id":"abc123"}"#;
        let value: ArgValue = serde_json::from_str(json).unwrap();
        assert_eq!(
            value,
            ArgValue::Ref(ObjectRef::new("repositories", "abc123"))
        );
    }

    #[test]
    fn plain_map_stays_a_map() {
        let json = r#"{"collection":"repositories","id":"abc123"}"#;
        let value: ArgValue = serde_json::from_str(json).unwrap();
        assert!(matches!(value, ArgValue::Map(_)));
    }

    #[test]
    fn nested_envelope_round_trips() {
        let args = JobArgs::positional(vec![
            ArgValue::Seq(vec![ArgValue::Int(1), ArgValue::Str("two".into())]),
            ObjectRef::new("units", "u-9").into(),
        ])
        .with_kwarg("force", true);

        let json = serde_json::to_string(&args).unwrap();
        let back: JobArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, args);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let args: JobArgs = serde_json::from_str("{}").unwrap();
        assert!(args.args.is_empty());
        assert!(args.kwargs.is_empty());
    }
}
