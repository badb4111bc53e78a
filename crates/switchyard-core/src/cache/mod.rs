//! Runtime cache: one compiled graph per workflow id.
//!
//! Bookkeeping lives behind a single mutex that is never held across a
//! build. Each build runs as its own task; every caller interested in that
//! key, including the one that started it, waits on the build's watch
//! channel and then re-reads the cache.
//!
//! Invalidation is lazy: `invalidate` marks an entry dirty and bumps the
//! global epoch. A build that started before the invalidation installs its
//! result still dirty, so the next `get` rebuilds.
//!
//! A replaced or evicted graph is retired rather than torn down: when callers
//! still hold its runtime, its resources are released after the last of them
//! lets go, so requests already running on it finish normally.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};
use crate::graph::{BuildOutcome, BuiltGraph, CompiledRuntime, GraphBuilder, GraphKind};

/// Observer invoked with `(workflow_id, new_runtime)` after each successful build.
pub type RebuildCallback = Arc<dyn Fn(&str, Arc<CompiledRuntime>) + Send + Sync>;

/// `None` while building; the outcome once finished.
type BuildSignal = Option<std::result::Result<Arc<CompiledRuntime>, String>>;

#[derive(Default)]
struct GraphCacheEntry {
    graph: Option<BuiltGraph>,
    fallback_reason: Option<String>,
    /// Epoch at which the installed graph's build started.
    built_epoch: u64,
    /// Epoch of the most recent invalidation of this key.
    invalidated_epoch: u64,
    dirty: bool,
    building: Option<watch::Receiver<BuildSignal>>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, GraphCacheEntry>,
    epoch: u64,
    pending: HashMap<String, JoinHandle<()>>,
}

struct CacheShared {
    builder: Arc<dyn GraphBuilder>,
    state: Mutex<CacheState>,
    callbacks: RwLock<Vec<RebuildCallback>>,
}

impl CacheShared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Externally visible state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    Clean,
    Dirty,
    Building,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    pub workflow_id: String,
    pub state: EntryState,
    pub kind: Option<GraphKind>,
    pub built_epoch: u64,
    pub fallback_reason: Option<String>,
    pub resources: usize,
}

#[derive(Clone)]
pub struct RuntimeCache {
    shared: Arc<CacheShared>,
}

enum Next {
    Ready(Arc<CompiledRuntime>),
    Wait(watch::Receiver<BuildSignal>),
    Build,
}

impl RuntimeCache {
    pub fn new(builder: Arc<dyn GraphBuilder>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                builder,
                state: Mutex::new(CacheState::default()),
                callbacks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// The runtime for `workflow_id`, building or joining a build when the
    /// entry is absent or dirty.
    pub async fn get(&self, workflow_id: &str) -> Result<Arc<CompiledRuntime>> {
        loop {
            let next = {
                let state = self.shared.lock();
                match state.entries.get(workflow_id) {
                    Some(GraphCacheEntry {
                        building: Some(rx), ..
                    }) => Next::Wait(rx.clone()),
                    Some(GraphCacheEntry {
                        graph: Some(graph),
                        dirty: false,
                        ..
                    }) => Next::Ready(graph.runtime.clone()),
                    _ => Next::Build,
                }
            };

            let rx = match next {
                Next::Ready(runtime) => return Ok(runtime),
                Next::Wait(rx) => rx,
                Next::Build => self.start_or_join(workflow_id),
            };
            wait_for_build(rx).await?;
        }
    }

    /// Build now, or join the build already in progress for this key.
    pub async fn rebuild(&self, workflow_id: &str) -> Result<Arc<CompiledRuntime>> {
        let rx = self.start_or_join(workflow_id);
        wait_for_build(rx).await
    }

    /// Mark one entry dirty without rebuilding.
    pub fn invalidate(&self, workflow_id: &str) {
        let mut state = self.shared.lock();
        state.epoch += 1;
        let epoch = state.epoch;
        if let Some(entry) = state.entries.get_mut(workflow_id) {
            entry.dirty = true;
            entry.invalidated_epoch = epoch;
        }
        tracing::debug!("[RuntimeCache] Invalidated '{}' at epoch {}", workflow_id, epoch);
    }

    pub fn invalidate_all(&self) {
        let mut state = self.shared.lock();
        state.epoch += 1;
        let epoch = state.epoch;
        for entry in state.entries.values_mut() {
            entry.dirty = true;
            entry.invalidated_epoch = epoch;
        }
        tracing::debug!("[RuntimeCache] Invalidated all entries at epoch {}", epoch);
    }

    /// Schedule a rebuild after `debounce`. Returns false when one is already
    /// scheduled for this key; the earlier timer is kept, not reset.
    pub fn request_rebuild(&self, workflow_id: &str, debounce: Duration) -> bool {
        let mut state = self.shared.lock();
        if let Some(handle) = state.pending.get(workflow_id) {
            if !handle.is_finished() {
                return false;
            }
        }

        let cache = self.clone();
        let key = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            cache.shared.lock().pending.remove(&key);
            cache.invalidate(&key);
            if let Err(e) = cache.get(&key).await {
                tracing::warn!("[RuntimeCache] Debounced rebuild of '{}' failed: {}", key, e);
            }
        });
        state.pending.insert(workflow_id.to_string(), handle);
        tracing::debug!(
            "[RuntimeCache] Rebuild of '{}' scheduled in {:?}",
            workflow_id,
            debounce
        );
        true
    }

    pub fn register_rebuild_callback<F>(&self, callback: F)
    where
        F: Fn(&str, Arc<CompiledRuntime>) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.shared.callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Release one entry's resources. Returns whether a graph was cached.
    /// A build in progress for the key is left to finish.
    pub async fn close(&self, workflow_id: &str) -> bool {
        let graph = {
            let mut state = self.shared.lock();
            if let Some(handle) = state.pending.remove(workflow_id) {
                handle.abort();
            }
            match state.entries.get_mut(workflow_id) {
                Some(entry) => {
                    let graph = entry.graph.take();
                    if entry.building.is_none() {
                        state.entries.remove(workflow_id);
                    }
                    graph
                }
                None => None,
            }
        };

        match graph {
            Some(graph) => {
                retire(workflow_id, graph).await;
                tracing::info!("[RuntimeCache] Closed '{}'", workflow_id);
                true
            }
            None => false,
        }
    }

    /// Release every cached entry and drop scheduled rebuilds.
    pub async fn close_all(&self) {
        let graphs: Vec<(String, BuiltGraph)> = {
            let mut state = self.shared.lock();
            for (_, handle) in state.pending.drain() {
                handle.abort();
            }
            let graphs = state
                .entries
                .iter_mut()
                .filter_map(|(id, entry)| entry.graph.take().map(|g| (id.clone(), g)))
                .collect();
            state.entries.retain(|_, entry| entry.building.is_some());
            graphs
        };

        let count = graphs.len();
        for (id, graph) in graphs {
            retire(&id, graph).await;
        }
        tracing::info!("[RuntimeCache] Closed {} cached runtime(s)", count);
    }

    pub fn epoch(&self) -> u64 {
        self.shared.lock().epoch
    }

    pub fn state(&self, workflow_id: &str) -> EntryState {
        self.shared
            .lock()
            .entries
            .get(workflow_id)
            .map(entry_state)
            .unwrap_or(EntryState::Absent)
    }

    /// Every known key, sorted by workflow id.
    pub fn snapshot(&self) -> Vec<CacheEntryInfo> {
        let state = self.shared.lock();
        let mut infos: Vec<CacheEntryInfo> = state
            .entries
            .iter()
            .map(|(id, entry)| CacheEntryInfo {
                workflow_id: id.clone(),
                state: entry_state(entry),
                kind: entry.graph.as_ref().map(|g| g.runtime.kind()),
                built_epoch: entry.built_epoch,
                fallback_reason: entry.fallback_reason.clone(),
                resources: entry.graph.as_ref().map(|g| g.scope.len()).unwrap_or(0),
            })
            .collect();
        infos.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        infos
    }

    fn start_or_join(&self, workflow_id: &str) -> watch::Receiver<BuildSignal> {
        let mut state = self.shared.lock();
        let start_epoch = state.epoch;
        let entry = state.entries.entry(workflow_id.to_string()).or_default();
        if let Some(rx) = &entry.building {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        entry.building = Some(rx.clone());
        drop(state);

        let shared = self.shared.clone();
        let key = workflow_id.to_string();
        tokio::spawn(run_build(shared, key, start_epoch, tx));
        rx
    }
}

fn entry_state(entry: &GraphCacheEntry) -> EntryState {
    if entry.building.is_some() {
        EntryState::Building
    } else if entry.graph.is_none() {
        EntryState::Absent
    } else if entry.dirty {
        EntryState::Dirty
    } else {
        EntryState::Clean
    }
}

async fn wait_for_build(mut rx: watch::Receiver<BuildSignal>) -> Result<Arc<CompiledRuntime>> {
    let signal = rx
        .wait_for(|signal| signal.is_some())
        .await
        .map_err(|_| EngineError::Build("build task ended without a result".to_string()))?
        .clone();
    match signal {
        Some(Ok(runtime)) => Ok(runtime),
        Some(Err(message)) => Err(EngineError::Build(message)),
        None => Err(EngineError::Internal("empty build signal".to_string())),
    }
}

/// Clears the building marker and releases waiters if a build task unwinds
/// or is dropped before finishing.
struct BuildGuard {
    shared: Arc<CacheShared>,
    key: String,
    tx: Option<watch::Sender<BuildSignal>>,
}

impl BuildGuard {
    fn disarm(&mut self) -> Option<watch::Sender<BuildSignal>> {
        self.tx.take()
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Some(entry) = self.shared.lock().entries.get_mut(&self.key) {
                entry.building = None;
            }
            tracing::error!("[RuntimeCache] Build of '{}' aborted", self.key);
            tx.send_replace(Some(Err(format!("build of '{}' was aborted", self.key))));
        }
    }
}

async fn run_build(
    shared: Arc<CacheShared>,
    key: String,
    start_epoch: u64,
    tx: watch::Sender<BuildSignal>,
) {
    let mut guard = BuildGuard {
        shared: shared.clone(),
        key: key.clone(),
        tx: Some(tx),
    };

    tracing::debug!("[RuntimeCache] Building '{}' (epoch {})", key, start_epoch);
    let result = shared.builder.build(&key).await;
    let Some(tx) = guard.disarm() else {
        return;
    };

    let (signal, replaced) = {
        let mut state = shared.lock();
        let entry = state.entries.entry(key.clone()).or_default();
        entry.building = None;
        match result {
            Ok(outcome) => {
                let reason = match &outcome {
                    BuildOutcome::Fallback { reason, .. } => Some(reason.clone()),
                    BuildOutcome::Workflow(_) => None,
                };
                let graph = outcome.into_graph();
                let runtime = graph.runtime.clone();
                let replaced = entry.graph.replace(graph);
                entry.fallback_reason = reason;
                entry.built_epoch = start_epoch;
                entry.dirty = entry.invalidated_epoch > start_epoch;
                (Ok(runtime), replaced)
            }
            Err(e) => (Err(e.to_string()), None),
        }
    };

    match &signal {
        Ok(_) => tracing::info!("[RuntimeCache] Installed runtime for '{}'", key),
        Err(e) => tracing::error!("[RuntimeCache] Build of '{}' failed: {}", key, e),
    }
    tx.send_replace(Some(signal.clone()));

    if let Ok(runtime) = signal {
        notify(&shared, &key, &runtime);
    }

    if let Some(old) = replaced {
        retire(&key, old).await;
    }
}

/// Release a graph's scope now if nothing else holds its runtime, otherwise
/// once the last holder drops it.
async fn retire(key: &str, graph: BuiltGraph) {
    let BuiltGraph { runtime, mut scope } = graph;
    match Arc::try_unwrap(runtime) {
        Ok(_unused) => scope.close().await,
        Err(runtime) => {
            tracing::debug!(
                "[RuntimeCache] '{}' still held by {} caller(s); deferring release",
                key,
                Arc::strong_count(&runtime) - 1
            );
            runtime.defer_release(scope);
        }
    }
}

fn notify(shared: &CacheShared, key: &str, runtime: &Arc<CompiledRuntime>) {
    let callbacks: Vec<RebuildCallback> = shared
        .callbacks
        .read()
        .map(|c| c.to_vec())
        .unwrap_or_default();
    for callback in callbacks {
        let outcome = catch_unwind(AssertUnwindSafe(|| callback(key, runtime.clone())));
        if outcome.is_err() {
            tracing::warn!("[RuntimeCache] Rebuild callback for '{}' panicked", key);
        }
    }
}
