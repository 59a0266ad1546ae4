use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use lms_blob::Fault;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{DocumentId, MediaDocument};

/// The small save/find contract the coordinator needs from the document
/// database. Query logic and schema validation live behind it.
#[async_trait]
pub trait DocumentStore<D: MediaDocument>: Send + Sync {
    async fn find_by_id(&self, id: &DocumentId) -> anyhow::Result<Option<D>>;

    /// Insert or fully overwrite a document
    async fn save(&self, document: &D) -> anyhow::Result<()>;

    /// Merge `patch` into the top level of an existing document
    async fn update_one(&self, id: &DocumentId, patch: Value) -> anyhow::Result<()>;

    async fn remove_by_id(&self, id: &DocumentId) -> anyhow::Result<()>;
}

/// Document store operations, for call counting and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocOp {
    Find,
    Save,
    Update,
    Remove,
}

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<DocumentId, Value>,
    calls: HashMap<DocOp, usize>,
    faults: Vec<(DocOp, Fault)>,
}

/// In-memory document store.
///
/// Documents are kept in their serialized form so `update_one` behaves like a
/// database merge rather than a typed field write.
pub struct MemoryDocumentStore<D> {
    state: Arc<Mutex<State>>,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Clone for MemoryDocumentStore<D> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            _marker: PhantomData,
        }
    }
}

impl<D: MediaDocument> Default for MemoryDocumentStore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: MediaDocument> MemoryDocumentStore<D> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            _marker: PhantomData,
        }
    }

    /// Seed a document, bypassing counters and faults
    pub fn insert(&self, document: &D) -> anyhow::Result<()> {
        let value = serde_json::to_value(document)?;
        self.state.lock().documents.insert(document.id().clone(), value);
        Ok(())
    }

    /// Current stored state of a document
    pub fn get(&self, id: &DocumentId) -> Option<D> {
        let value = self.state.lock().documents.get(id).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn len(&self) -> usize {
        self.state.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `fault` to every call of `op` until cleared
    pub fn inject(&self, op: DocOp, fault: Fault) {
        self.state.lock().faults.push((op, fault));
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn calls(&self, op: DocOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: DocOp) -> anyhow::Result<()> {
        let fault = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            state
                .faults
                .iter()
                .find(|(faulted, _)| *faulted == op)
                .map(|(_, fault)| *fault)
        };

        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(anyhow!("injected {:?} failure", op)),
            Some(Fault::Stall) => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Some(Fault::Delay(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<D: MediaDocument> DocumentStore<D> for MemoryDocumentStore<D> {
    async fn find_by_id(&self, id: &DocumentId) -> anyhow::Result<Option<D>> {
        self.enter(DocOp::Find).await?;
        let value = self.state.lock().documents.get(id).cloned();
        value
            .map(|value| {
                serde_json::from_value(value)
                    .with_context(|| format!("{} {} is malformed", D::KIND, id))
            })
            .transpose()
    }

    async fn save(&self, document: &D) -> anyhow::Result<()> {
        self.enter(DocOp::Save).await?;
        let value = serde_json::to_value(document)?;
        self.state.lock().documents.insert(document.id().clone(), value);
        Ok(())
    }

    async fn update_one(&self, id: &DocumentId, patch: Value) -> anyhow::Result<()> {
        self.enter(DocOp::Update).await?;
        let Value::Object(fields) = patch else {
            bail!("update patch must be an object");
        };

        let mut state = self.state.lock();
        let document = state
            .documents
            .get_mut(id)
            .ok_or_else(|| anyhow!("{} {} does not exist", D::KIND, id))?;
        let Value::Object(target) = document else {
            bail!("{} {} is not an object", D::KIND, id);
        };
        for (field, value) in fields {
            target.insert(field, value);
        }
        Ok(())
    }

    async fn remove_by_id(&self, id: &DocumentId) -> anyhow::Result<()> {
        self.enter(DocOp::Remove).await?;
        self.state.lock().documents.remove(id);
        Ok(())
    }
}
