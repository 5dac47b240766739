//! CapabilityRegistry: the in-memory source of truth for registered workers and
//! the capability index, guarded by a single lock shared with the recovery log
//! so every mutation and its log entry commit atomically in the same order.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::capability::{CapabilityDefinition, SchemaValidator, ValidationError};
use crate::recovery_log::{RecoveryLog, RecoveryLogEntry, RecoveryLogError};
use crate::routing::{RouteContext, RoundRobinCursor};
use crate::worker::WorkerRecord;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("worker not registered: {0}")]
    WorkerNotRegistered(String),

    #[error("no worker available for capability {0}")]
    NoWorkerAvailable(String),
}

/// Outcome of a successful `/route` lookup. An owned copy, never a reference into
/// live state, so callers can't observe a worker being mutated underneath them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub worker_id: String,
    pub worker_url: String,
}

/// One capability key with the workers currently offering it.
#[derive(Debug, Clone)]
pub struct CapabilityListing {
    pub verb: String,
    pub name: String,
    pub version: String,
    pub workers: Vec<String>,
    pub healthy_workers: usize,
}

/// The full registry state, serializable for federation (`export_state`) and
/// deserializable for ingestion (`import_remote_state`). Both are stubs per the
/// spec — present, round-trip-correct, and unused by the shipped controller.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportedState {
    pub workers: Vec<WorkerRecord>,
}

struct State {
    workers: HashMap<String, WorkerRecord>,
    /// capability key -> worker ids in insertion order (Invariant I3).
    index: HashMap<String, Vec<String>>,
    cursors: HashMap<String, RoundRobinCursor>,
    log: Option<RecoveryLog>,
}

impl State {
    fn index_insert(&mut self, key: &str, worker_id: &str) {
        let entry = self.index.entry(key.to_string()).or_default();
        if !entry.iter().any(|id| id == worker_id) {
            entry.push(worker_id.to_string());
        }
    }

    fn unindex_worker(&mut self, worker_id: &str, capabilities: &[CapabilityDefinition]) {
        for cap in capabilities {
            let key = cap.key();
            if let Some(ids) = self.index.get_mut(&key) {
                ids.retain(|id| id != worker_id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }

    fn append_log(&mut self, entry: RecoveryLogEntry) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.append(&entry) {
                // Disk full / I/O error on append: the in-memory mutation still
                // committed above; recovery-log durability is best-effort.
                warn!("recovery log append failed: {}", e);
            }
        }
    }
}

/// The registry. Cheap to clone the handle (`Arc` it at the call site); the state
/// itself lives behind one `parking_lot::Mutex`.
pub struct CapabilityRegistry {
    state: Mutex<State>,
    validator: SchemaValidator,
    stale_timeout: Duration,
}

impl CapabilityRegistry {
    pub fn new(stale_timeout_seconds: u64, log: Option<RecoveryLog>) -> Self {
        Self {
            state: Mutex::new(State {
                workers: HashMap::new(),
                index: HashMap::new(),
                cursors: HashMap::new(),
                log,
            }),
            validator: SchemaValidator::new(),
            stale_timeout: Duration::seconds(stale_timeout_seconds as i64),
        }
    }

    /// Load the registry from replayed recovery-log entries. Per §4.2 step 3,
    /// `last_heartbeat_at` is set to the value recorded in the log, not `now`, so
    /// StaleReaper naturally eliminates workers that never come back.
    pub fn load_from_replay(&self, entries: Vec<RecoveryLogEntry>) {
        let mut state = self.state.lock();
        for entry in entries {
            match entry {
                RecoveryLogEntry::Register { worker, .. } => {
                    if let Some(old) = state.workers.remove(&worker.worker_id) {
                        state.unindex_worker(&old.worker_id, &old.capabilities);
                    }
                    for cap in &worker.capabilities {
                        state.index_insert(&cap.key(), &worker.worker_id);
                    }
                    state.workers.insert(worker.worker_id.clone(), worker);
                }
                RecoveryLogEntry::Heartbeat { worker_id, ts } => {
                    if let Some(w) = state.workers.get_mut(&worker_id) {
                        w.last_heartbeat_at = ts;
                    }
                }
                RecoveryLogEntry::Deregister { worker_id, .. } => {
                    if let Some(old) = state.workers.remove(&worker_id) {
                        state.unindex_worker(&old.worker_id, &old.capabilities);
                    }
                }
            }
        }
        info!(
            worker_count = state.workers.len(),
            "registry warmed from recovery log replay"
        );
    }

    /// Register (or re-register) a worker. Validates every capability first; a
    /// failure leaves state untouched and appends nothing.
    pub fn register(
        &self,
        worker_id: &str,
        worker_url: &str,
        capabilities: Vec<CapabilityDefinition>,
        peer_identity: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.validator.validate_batch(&capabilities)?;

        let record = WorkerRecord::new(
            worker_id.to_string(),
            worker_url.to_string(),
            capabilities,
            peer_identity,
            now,
        );

        let mut state = self.state.lock();

        if let Some(old) = state.workers.remove(worker_id) {
            state.unindex_worker(worker_id, &old.capabilities);
        }
        for cap in &record.capabilities {
            state.index_insert(&cap.key(), worker_id);
        }
        state.workers.insert(worker_id.to_string(), record.clone());

        state.append_log(RecoveryLogEntry::Register {
            ts: now,
            worker: record,
        });

        info!(worker_id, "worker registered");
        Ok(())
    }

    /// Update `last_heartbeat_at`. An unknown worker is not an exception — it's
    /// the protocol signal that forces the worker to re-register.
    pub fn heartbeat(&self, worker_id: &str, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let mut state = self.state.lock();

        if !state.workers.contains_key(worker_id) {
            warn!(worker_id, "heartbeat from unknown worker");
            return Err(RegistryError::WorkerNotRegistered(worker_id.to_string()));
        }

        state.workers.get_mut(worker_id).unwrap().last_heartbeat_at = now;
        state.append_log(RecoveryLogEntry::Heartbeat {
            ts: now,
            worker_id: worker_id.to_string(),
        });

        Ok(())
    }

    /// Remove a worker. Idempotent: deregistering an unknown worker is a silent
    /// no-op, not an error.
    pub fn deregister(&self, worker_id: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock();

        if let Some(old) = state.workers.remove(worker_id) {
            state.unindex_worker(worker_id, &old.capabilities);
            state.append_log(RecoveryLogEntry::Deregister {
                ts: now,
                worker_id: worker_id.to_string(),
            });
            info!(worker_id, "worker deregistered");
        }
    }

    /// Select one healthy worker for `verb:name` via RoutingPolicy.
    pub fn route(
        &self,
        verb: &str,
        name: &str,
        ctx: &RouteContext,
        now: DateTime<Utc>,
    ) -> Result<RouteOutcome, RegistryError> {
        let key = format!("{verb}:{name}");
        let mut state = self.state.lock();

        let healthy: Vec<WorkerRecord> = state
            .index
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|id| state.workers.get(id))
            .filter(|w| w.is_healthy(now, self.stale_timeout))
            .cloned()
            .collect();

        let cursor = state.cursors.entry(key.clone()).or_default();
        let chosen = cursor.select(&healthy, ctx).cloned();

        match chosen {
            Some(worker) => Ok(RouteOutcome {
                worker_id: worker.worker_id,
                worker_url: worker.worker_url,
            }),
            None => Err(RegistryError::NoWorkerAvailable(key)),
        }
    }

    /// Remove every worker whose heartbeat has expired. Returns the count
    /// removed. Each removal appends a `deregister` entry so a controller
    /// restarted from the log converges to what a live controller would see.
    pub fn cleanup_stale(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();

        let stale_ids: Vec<String> = state
            .workers
            .iter()
            .filter(|(_, w)| !w.is_healthy(now, self.stale_timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale_ids {
            if let Some(old) = state.workers.remove(id) {
                state.unindex_worker(id, &old.capabilities);
                state.append_log(RecoveryLogEntry::Deregister {
                    ts: now,
                    worker_id: id.clone(),
                });
                warn!(worker_id = %id, "reaped stale worker");
            }
        }

        stale_ids.len()
    }

    /// Every capability key with its workers and health counts.
    pub fn get_all_capabilities(&self, now: DateTime<Utc>) -> Vec<CapabilityListing> {
        let state = self.state.lock();
        let mut listings = Vec::new();

        for (key, worker_ids) in &state.index {
            let Some((verb, name)) = key.split_once(':') else {
                continue;
            };

            let mut version = String::new();
            let mut healthy_workers = 0;
            for id in worker_ids {
                if let Some(worker) = state.workers.get(id) {
                    if let Some(cap) = worker.capabilities.iter().find(|c| c.key() == *key) {
                        version = cap.version.clone();
                    }
                    if worker.is_healthy(now, self.stale_timeout) {
                        healthy_workers += 1;
                    }
                }
            }

            listings.push(CapabilityListing {
                verb: verb.to_string(),
                name: name.to_string(),
                version,
                workers: worker_ids.clone(),
                healthy_workers,
            });
        }

        listings
    }

    /// Every worker record, as a point-in-time snapshot.
    pub fn get_all_workers(&self) -> Vec<WorkerRecord> {
        self.state.lock().workers.values().cloned().collect()
    }

    /// Every worker record paired with its health against the registry's
    /// configured `stale_timeout`, so callers never have to guess the
    /// threshold themselves the way `cleanup_stale`/`get_all_capabilities` do.
    pub fn get_all_workers_with_health(&self, now: DateTime<Utc>) -> Vec<(WorkerRecord, bool)> {
        self.state
            .lock()
            .workers
            .values()
            .map(|w| {
                let healthy = w.is_healthy(now, self.stale_timeout);
                (w.clone(), healthy)
            })
            .collect()
    }

    /// Serialize the live registry for federation.
    pub fn export_state(&self) -> ExportedState {
        ExportedState {
            workers: self.get_all_workers(),
        }
    }

    /// Ingest a peer's serialized state. Merge policy: a record with the same
    /// `worker_id` and identical `registered_at` is a no-op; otherwise the record
    /// with the more recent `last_heartbeat_at` wins. Stub for multi-controller
    /// federation — present and round-trip-correct, never called by the shipped
    /// controller.
    pub fn import_remote_state(&self, _controller_id: &str, remote: ExportedState) {
        let mut state = self.state.lock();

        for incoming in remote.workers {
            match state.workers.get(&incoming.worker_id) {
                Some(existing) if existing.registered_at == incoming.registered_at => {
                    // Same worker, same registration instant: no-op.
                }
                Some(existing) if existing.last_heartbeat_at >= incoming.last_heartbeat_at => {
                    // Local record is at least as fresh: keep it.
                }
                _ => {
                    if let Some(old) = state.workers.remove(&incoming.worker_id) {
                        state.unindex_worker(&incoming.worker_id, &old.capabilities);
                    }
                    for cap in &incoming.capabilities {
                        state.index_insert(&cap.key(), &incoming.worker_id);
                    }
                    state.workers.insert(incoming.worker_id.clone(), incoming);
                }
            }
        }
    }

    /// Write a checkpoint: one `register` per currently-live worker, replacing
    /// the log atomically. Opportunistic; correctness never depends on it.
    pub fn checkpoint(&self, state_dir: &std::path::Path) -> Result<(), RecoveryLogError> {
        let workers = self.get_all_workers();
        RecoveryLog::checkpoint(state_dir, workers.into_iter())
    }
}
