//! In-memory remote backend
//!
//! Stands in for the hosted backend in tests and offline demos. Failures,
//! latency and held calls can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{RemoteError, RemotePort, RemoteResult};
use crate::models::{OwnerId, RecordId, SyncStatus, Syncable};

/// How upserts are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// Many records per owner, keyed by id
    Collection,
    /// At most one aggregate per owner; an upsert replaces it
    Singleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Upsert,
    Fetch,
    Delete,
}

/// Call counters, for asserting what a sync session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    pub upserts: usize,
    pub upserted_records: usize,
    pub fetches: usize,
    pub deletes: usize,
}

#[derive(Default)]
struct Gate {
    entered: Notify,
    release: Notify,
}

struct Inner<R> {
    owners: HashMap<OwnerId, BTreeMap<RecordId, R>>,
    failures: HashMap<RemoteOp, RemoteError>,
    gates: HashMap<RemoteOp, Arc<Gate>>,
    calls: RemoteCalls,
    latency: Duration,
}

/// In-memory `RemotePort`
pub struct MemoryRemote<R> {
    mode: RemoteMode,
    inner: Arc<Mutex<Inner<R>>>,
}

impl<R> Clone for MemoryRemote<R> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Syncable> MemoryRemote<R> {
    pub fn new(mode: RemoteMode) -> Self {
        Self {
            mode,
            inner: Arc::new(Mutex::new(Inner {
                owners: HashMap::new(),
                failures: HashMap::new(),
                gates: HashMap::new(),
                calls: RemoteCalls::default(),
                latency: Duration::ZERO,
            })),
        }
    }

    pub fn collection() -> Self {
        Self::new(RemoteMode::Collection)
    }

    pub fn singleton() -> Self {
        Self::new(RemoteMode::Singleton)
    }

    /// Store records as if another device had uploaded them.
    pub async fn seed(&self, owner: &OwnerId, records: Vec<R>) {
        let mut inner = self.inner.lock().await;
        Self::store(self.mode, &mut inner, owner, records);
    }

    /// Records currently stored for `owner`, ordered by id.
    pub async fn records(&self, owner: &OwnerId) -> Vec<R> {
        let inner = self.inner.lock().await;
        inner
            .owners
            .get(owner)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn calls(&self) -> RemoteCalls {
        self.inner.lock().await.calls
    }

    /// Make every call of `op` fail with `error` until `recover` is called.
    pub async fn fail(&self, op: RemoteOp, error: RemoteError) {
        self.inner.lock().await.failures.insert(op, error);
    }

    pub async fn recover(&self, op: RemoteOp) {
        self.inner.lock().await.failures.remove(&op);
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.inner.lock().await.latency = latency;
    }

    /// Park the next calls of `op` until `release` is called.
    pub async fn hold(&self, op: RemoteOp) {
        self.inner
            .lock()
            .await
            .gates
            .insert(op, Arc::new(Gate::default()));
    }

    /// Wait until a call of a held `op` is parked.
    pub async fn wait_until_held(&self, op: RemoteOp) {
        let gate = self.inner.lock().await.gates.get(&op).cloned();
        if let Some(gate) = gate {
            gate.entered.notified().await;
        }
    }

    pub async fn release(&self, op: RemoteOp) {
        let gate = self.inner.lock().await.gates.remove(&op);
        if let Some(gate) = gate {
            gate.release.notify_one();
        }
    }

    /// Count the call, then apply latency, gates and injected failures.
    async fn enter(&self, op: RemoteOp, records: usize) -> RemoteResult<()> {
        let (latency, gate) = {
            let mut inner = self.inner.lock().await;
            match op {
                RemoteOp::Upsert => {
                    inner.calls.upserts += 1;
                    inner.calls.upserted_records += records;
                }
                RemoteOp::Fetch => inner.calls.fetches += 1,
                RemoteOp::Delete => inner.calls.deletes += 1,
            }
            (inner.latency, inner.gates.get(&op).cloned())
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        match self.inner.lock().await.failures.get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn store(mode: RemoteMode, inner: &mut Inner<R>, owner: &OwnerId, records: Vec<R>) {
        let stored = inner.owners.entry(owner.clone()).or_default();
        if mode == RemoteMode::Singleton && !records.is_empty() {
            stored.clear();
        }
        for mut record in records {
            // Whatever status the client held, the remote copy is acknowledged
            record.meta_mut().sync_status = SyncStatus::Synced;
            stored.insert(record.id(), record);
        }
    }
}

#[async_trait]
impl<R: Syncable> RemotePort<R> for MemoryRemote<R> {
    async fn upsert(&self, records: &[R], owner: &OwnerId) -> RemoteResult<()> {
        self.enter(RemoteOp::Upsert, records.len()).await?;
        let mut inner = self.inner.lock().await;
        let batch = match self.mode {
            // Newest aggregate wins when several arrive at once
            RemoteMode::Singleton => records
                .iter()
                .max_by_key(|record| record.updated_at())
                .cloned()
                .into_iter()
                .collect(),
            RemoteMode::Collection => records.to_vec(),
        };
        Self::store(self.mode, &mut inner, owner, batch);
        Ok(())
    }

    async fn fetch(&self, owner: &OwnerId) -> RemoteResult<Vec<R>> {
        self.enter(RemoteOp::Fetch, 0).await?;
        Ok(self.records(owner).await)
    }

    async fn delete(&self, id: RecordId, owner: &OwnerId) -> RemoteResult<()> {
        self.enter(RemoteOp::Delete, 0).await?;
        let mut inner = self.inner.lock().await;
        if let Some(records) = inner.owners.get_mut(owner) {
            records.remove(&id);
        }
        Ok(())
    }
}
