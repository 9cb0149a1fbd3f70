//! Raw documents and the typed records stored inside them.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StoreError;

/// Body key holding the record type tag.
pub const TYPE_KEY: &str = "type";

/// A versioned JSON record as held by the store.
///
/// `rev` is the optimistic-concurrency token: `None` until the document has
/// been written once, and required to match the stored value on every later
/// update or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body: Map::new(),
        }
    }

    /// The `type` tag of the body, if any.
    pub fn doc_type(&self) -> Option<&str> {
        self.body.get(TYPE_KEY).and_then(Value::as_str)
    }

    /// Serialize a typed record into a document.
    pub fn from_record<R: Record>(record: &R) -> Result<Self, StoreError> {
        let body = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Serialization(format!(
                    "record {} serialized to non-object {other}",
                    record.id()
                )));
            }
        };
        let mut doc = Self {
            id: record.id().to_string(),
            rev: record.rev().map(str::to_string),
            body,
        };
        doc.body
            .insert(TYPE_KEY.into(), Value::String(R::DOC_TYPE.to_string()));
        Ok(doc)
    }

    /// Deserialize into a typed record, filling absent fields with defaults.
    pub fn into_record<R: Record>(self) -> Result<R, StoreError> {
        if self.doc_type() != Some(R::DOC_TYPE) {
            let found = self.doc_type().map(str::to_string);
            return Err(StoreError::WrongType {
                id: self.id,
                expected: R::DOC_TYPE,
                found,
            });
        }
        let mut record: R = serde_json::from_value(Value::Object(self.body))?;
        record.set_id(self.id);
        record.set_rev(self.rev);
        Ok(record)
    }
}

/// A fixed-schema record type persisted as a [`Document`].
///
/// Implementors keep `id` and `rev` out of the serialized body
/// (`#[serde(skip)]`); [`Document`] carries them alongside.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const DOC_TYPE: &'static str;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn rev(&self) -> Option<&str>;
    fn set_rev(&mut self, rev: Option<String>);
}

/// One row of a view: a read-only projection of a stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    pub value: Value,
}

impl ViewRow {
    /// The row key as a unix timestamp, for the timestamp-keyed views.
    pub fn key_timestamp(&self) -> Option<i64> {
        match &self.key {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }
}

/// Produce the revision that follows `current`.
///
/// Revisions look like `"<generation>-<32 hex>"`; callers must treat them as
/// opaque.
pub fn next_revision(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split('-').next())
        .and_then(|g| g.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Note {
        #[serde(skip)]
        id: String,
        #[serde(skip)]
        rev: Option<String>,
        #[serde(default)]
        text: String,
        #[serde(default)]
        count: i64,
    }

    impl Record for Note {
        const DOC_TYPE: &'static str = "note";
        fn id(&self) -> &str {
            &self.id
        }
        fn set_id(&mut self, id: String) {
            self.id = id;
        }
        fn rev(&self) -> Option<&str> {
            self.rev.as_deref()
        }
        fn set_rev(&mut self, rev: Option<String>) {
            self.rev = rev;
        }
    }

    #[test]
    fn record_body_carries_type_but_not_id() {
        let note = Note {
            id: "n1".into(),
            rev: Some("3-abc".into()),
            text: "hello".into(),
            count: 2,
        };
        let doc = Document::from_record(&note).unwrap();
        assert_eq!(doc.id, "n1");
        assert_eq!(doc.rev.as_deref(), Some("3-abc"));
        assert_eq!(doc.doc_type(), Some("note"));
        assert!(!doc.body.contains_key("id"));
        assert!(!doc.body.contains_key("rev"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let mut doc = Document::new("n2");
        doc.body.insert("type".into(), "note".into());
        doc.body.insert("text".into(), "partial".into());
        let note: Note = doc.into_record().unwrap();
        assert_eq!(note.id, "n2");
        assert_eq!(note.text, "partial");
        assert_eq!(note.count, 0);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut doc = Document::new("n3");
        doc.body.insert("type".into(), "job".into());
        let err = doc.into_record::<Note>().unwrap_err();
        assert!(matches!(err, StoreError::WrongType { expected: "note", .. }));
    }

    #[test]
    fn revisions_increase_generation() {
        let first = next_revision(None);
        assert!(first.starts_with("1-"));
        let second = next_revision(Some(&first));
        assert!(second.starts_with("2-"));
        assert_ne!(first, second);
    }

    #[test]
    fn key_timestamp_reads_numbers() {
        let row = ViewRow {
            id: "x".into(),
            key: serde_json::json!(1700000000),
            value: serde_json::json!(1),
        };
        assert_eq!(row.key_timestamp(), Some(1_700_000_000));
        let row = ViewRow {
            key: Value::Null,
            ..row
        };
        assert_eq!(row.key_timestamp(), None);
    }
}
