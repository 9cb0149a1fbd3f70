//! `Store` trait — the single async interface to the shared document collection.
//!
//! Every mutation is a full-document conditional overwrite keyed by revision.
//! There is no field-level locking: two writers touching different fields of
//! the same document still conflict, and the loser re-reads and retries.

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::error::StoreError;
use crate::store::document::{Document, Record, ViewRow};
use crate::store::views::{View, ViewQuery};

/// Backend-agnostic document store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create or upgrade the schema. Idempotent.
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Fetch a document by id.
    async fn get(&self, id: &str) -> Result<Document, StoreError>;

    /// Conditionally write a document and return it with its new revision.
    ///
    /// Fails with `Conflict` when `doc.rev` does not match the stored
    /// revision, or when `doc.rev` is `None` and the id already exists.
    async fn save(&self, doc: &Document) -> Result<Document, StoreError>;

    /// Conditionally delete a document.
    async fn delete(&self, doc: &Document) -> Result<(), StoreError>;

    /// Query a view.
    async fn view(&self, view: View, query: ViewQuery) -> Result<Vec<ViewRow>, StoreError>;

    /// Grouped sum over a count view: the number of rows it holds.
    async fn view_count(&self, view: View) -> Result<u64, StoreError>;

    /// Write a batch of documents. Non-atomic across the batch: each entry
    /// reports whether that document was written.
    async fn save_many(&self, docs: &[Document]) -> Result<Vec<bool>, StoreError> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.save(doc).await {
                Ok(_) => results.push(true),
                Err(StoreError::Conflict { .. }) => results.push(false),
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Take the first `window` rows of a view and fetch one of them at random.
    ///
    /// Returns `None` when the view is empty, and `NotFound` when the picked
    /// document was deleted after the view was read.
    async fn get_random_from_view(
        &self,
        view: View,
        window: usize,
    ) -> Result<Option<Document>, StoreError> {
        let rows = self.view(view, ViewQuery::limit(window.max(1))).await?;
        let picked = rows
            .choose(&mut rand::thread_rng())
            .map(|row| row.id.clone());
        match picked {
            Some(id) => self.get(&id).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Load and decode a typed record.
pub async fn load<R: Record>(store: &dyn Store, id: &str) -> Result<R, StoreError> {
    store.get(id).await?.into_record()
}

/// Conditionally write a typed record, updating its revision in place.
pub async fn persist<R: Record>(store: &dyn Store, record: &mut R) -> Result<(), StoreError> {
    let saved = store.save(&Document::from_record(record)?).await?;
    record.set_rev(saved.rev);
    Ok(())
}
