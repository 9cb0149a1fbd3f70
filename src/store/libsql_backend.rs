//! libSQL backend — async `Store` trait implementation.
//!
//! Documents live in a single table as JSON bodies. Views are SQL predicates
//! over `json_extract`, so every write is immediately visible to the views
//! (no index lag). Conditional writes are single `UPDATE ... WHERE rev = ?`
//! statements, which makes each one atomic.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::document::{Document, ViewRow, next_revision};
use crate::store::migrations;
use crate::store::traits::Store;
use crate::store::views::{View, ViewQuery};

/// libSQL document store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Document store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM documents WHERE id = ?1", params![id])
            .await
            .map_err(|e| StoreError::Query(format!("exists: {e}")))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(StoreError::Query(format!("exists: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert a libsql column value to JSON.
fn column_to_json(value: libsql::Value) -> Value {
    match value {
        libsql::Value::Null => Value::Null,
        libsql::Value::Integer(i) => Value::from(i),
        libsql::Value::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        libsql::Value::Text(s) => Value::String(s),
        libsql::Value::Blob(_) => Value::Null,
    }
}

fn field(name: &str) -> String {
    format!("json_extract(body, '$.{name}')")
}

/// SQL for a view: (predicate, key expression, sort direction).
fn view_sql(view: View) -> (String, String, &'static str) {
    let task = "doc_type = 'task'";
    let job = "doc_type = 'job'";
    let (lock, done) = (field("lock"), field("done"));
    let (start, archive) = (field("start"), field("archive"));

    match view {
        View::Pending => (
            format!("{task} AND {lock} = 0 AND {done} = 0"),
            field("created"),
            "ASC",
        ),
        View::PendingPriority => (
            format!(
                "{task} AND {lock} = 0 AND {done} = 0 AND {} > 0",
                field("priority")
            ),
            field("priority"),
            "DESC",
        ),
        View::InProgress => (format!("{task} AND {lock} > 0 AND {done} = 0"), lock, "ASC"),
        View::Done => (format!("{task} AND {done} > 0"), done, "ASC"),
        View::Error => (
            format!("{task} AND {lock} = -1"),
            "json_extract(body, '$.error[#-1].time')".to_string(),
            "ASC",
        ),
        View::JobsPending => (
            format!("{job} AND {start} = 0 AND {archive} = 0"),
            // Registered but not yet queued jobs age from creation.
            format!("COALESCE(NULLIF({}, 0), {})", field("queue"), field("created")),
            "ASC",
        ),
        View::JobsRunning => (
            format!("{job} AND {start} > 0 AND {done} = 0 AND {archive} = 0"),
            start,
            "ASC",
        ),
        View::JobsFinished => (
            format!("{job} AND {done} > 0 AND {archive} = 0"),
            done,
            "ASC",
        ),
        View::JobsArchived => (format!("{job} AND {archive} > 0"), archive, "ASC"),
        View::JobsCancelled => (
            format!("{job} AND {} > 0 AND {archive} = 0", field("cancel")),
            field("cancel"),
            "ASC",
        ),
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT rev, body FROM documents WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get: {e}")))?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;

        let rev: String = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("get row parse: {e}")))?;
        let body_str: String = row
            .get(1)
            .map_err(|e| StoreError::Query(format!("get row parse: {e}")))?;
        let body: Map<String, Value> = serde_json::from_str(&body_str)?;

        Ok(Document {
            id: id.to_string(),
            rev: Some(rev),
            body,
        })
    }

    async fn save(&self, doc: &Document) -> Result<Document, StoreError> {
        let conn = self.conn();
        let body = serde_json::to_string(&doc.body)?;
        let new_rev = next_revision(doc.rev.as_deref());
        let now = Utc::now().to_rfc3339();

        let affected = match doc.rev.as_deref() {
            Some(rev) => conn
                .execute(
                    "UPDATE documents SET rev = ?1, doc_type = ?2, body = ?3, updated_at = ?4
                     WHERE id = ?5 AND rev = ?6",
                    params![
                        new_rev.clone(),
                        opt_text(doc.doc_type()),
                        body,
                        now,
                        doc.id.clone(),
                        rev
                    ],
                )
                .await,
            None => conn
                .execute(
                    "INSERT OR IGNORE INTO documents (id, rev, doc_type, body, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        doc.id.clone(),
                        new_rev.clone(),
                        opt_text(doc.doc_type()),
                        body,
                        now
                    ],
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("save: {e}")))?;

        if affected == 0 {
            debug!(id = %doc.id, rev = ?doc.rev, "Save rejected: revision conflict");
            return Err(StoreError::Conflict { id: doc.id.clone() });
        }

        Ok(Document {
            id: doc.id.clone(),
            rev: Some(new_rev),
            body: doc.body.clone(),
        })
    }

    async fn delete(&self, doc: &Document) -> Result<(), StoreError> {
        let Some(rev) = doc.rev.as_deref() else {
            return Err(StoreError::Conflict { id: doc.id.clone() });
        };

        let affected = self
            .conn()
            .execute(
                "DELETE FROM documents WHERE id = ?1 AND rev = ?2",
                params![doc.id.clone(), rev],
            )
            .await
            .map_err(|e| StoreError::Query(format!("delete: {e}")))?;

        if affected == 0 {
            if self.exists(&doc.id).await? {
                return Err(StoreError::Conflict { id: doc.id.clone() });
            }
            return Err(StoreError::NotFound { id: doc.id.clone() });
        }

        debug!(id = %doc.id, "Document deleted");
        Ok(())
    }

    async fn view(&self, view: View, query: ViewQuery) -> Result<Vec<ViewRow>, StoreError> {
        let (predicate, key, natural) = view_sql(view);
        let order = match (query.descending, natural) {
            (false, natural) => natural,
            (true, "ASC") => "DESC",
            (true, _) => "ASC",
        };
        let id_order = if query.descending { "DESC" } else { "ASC" };
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT id, {key} FROM documents WHERE {predicate} ORDER BY {key} {order}, id {id_order} LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| StoreError::Query(format!("view {view}: {e}")))?;

        let mut out = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(StoreError::Query(format!("view {view}: {e}"))),
            };
            let id: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("view {view} row parse: {e}")))?;
            let key = row.get_value(1).map(column_to_json).unwrap_or(Value::Null);
            out.push(ViewRow {
                id,
                key,
                value: Value::from(1),
            });
        }
        Ok(out)
    }

    async fn view_count(&self, view: View) -> Result<u64, StoreError> {
        let (predicate, _, _) = view_sql(view);
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM documents WHERE {predicate}"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("view_count {view}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("view_count {view}: {e}"))),
        }
    }
}
