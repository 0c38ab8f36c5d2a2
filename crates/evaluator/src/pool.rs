use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{SandboxRuntime, SandboxSpec};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::handle::{CompletionObserver, HandleId, HandleState, SandboxHandle};
use crate::types::Outcome;

/// Sizing and sandbox settings for a [`SandboxPool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Hard cap on ready + occupied sandboxes.
    pub max_active: usize,
    /// How many idle sandboxes to keep prepared.
    pub ready_target: usize,
    pub spec: SandboxSpec,
    /// Directory inside each sandbox that staged files are extracted to and
    /// commands run in.
    pub upload_dir: String,
    pub exec_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub ready: usize,
    pub occupied: usize,
}

/// Bounded pool of single-use sandboxes.
///
/// Handles live in an arena keyed by [`HandleId`]; `ready` (a stack, so
/// allocation is LIFO) and `occupied` hold IDs only. Every mutation goes
/// through the one state mutex, which keeps
/// `ready + occupied <= max_active` and keeps each ID in at most one of the
/// two sets, whichever task allocates or releases.
///
/// Cloning is cheap and shares the same pool.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runtime: Arc<dyn SandboxRuntime>,
    options: PoolOptions,
    state: Mutex<PoolState>,
}

struct PoolState {
    /// Cleared by `drain_all`; an inactive pool neither allocates nor
    /// backfills.
    active: bool,
    next_id: HandleId,
    handles: HashMap<HandleId, Arc<SandboxHandle>>,
    ready: Vec<HandleId>,
    occupied: HashSet<HandleId>,
}

impl SandboxPool {
    /// Create the pool and prepare the initial batch of ready sandboxes.
    pub async fn start(runtime: Arc<dyn SandboxRuntime>, options: PoolOptions) -> Self {
        info!(
            runtime = runtime.name(),
            max_active = options.max_active,
            ready_target = options.ready_target,
            image = %options.spec.image,
            "initializing sandbox pool"
        );

        let inner = Arc::new(PoolInner {
            runtime,
            options,
            state: Mutex::new(PoolState {
                active: true,
                next_id: 0,
                handles: HashMap::new(),
                ready: Vec::new(),
                occupied: HashSet::new(),
            }),
        });

        {
            let mut state = inner.state.lock().await;
            inner.backfill(&mut state).await;
            info!(ready = state.ready.len(), "sandbox pool initialized");
        }

        Self { inner }
    }

    /// Take the most recently prepared sandbox, or `None` if none is ready.
    ///
    /// Never waits for a sandbox to become available. The returned handle
    /// is released back to the pool (and destroyed) by an observer that
    /// fires when its command completes.
    pub async fn allocate(&self) -> Option<Arc<SandboxHandle>> {
        let mut state = self.inner.state.lock().await;
        if !state.active {
            warn!("allocation refused: pool is drained");
            return None;
        }

        let Some(id) = state.ready.pop() else {
            info!(occupied = state.occupied.len(), "no sandbox ready");
            return None;
        };
        let handle = Arc::clone(state.handles.get(&id)?);
        if !handle.transition(HandleState::Ready, HandleState::Occupied) {
            warn!(sandbox = %handle.name(), state = %handle.state(), "allocated sandbox was not ready");
        }
        state.occupied.insert(id);
        handle
            .add_completion_observer(Arc::new(ReleaseTrigger {
                pool: Arc::downgrade(&self.inner),
                id,
            }))
            .await;

        info!(
            sandbox = %handle.name(),
            ready = state.ready.len(),
            occupied = state.occupied.len(),
            "sandbox allocated"
        );

        self.inner.backfill(&mut state).await;
        Some(handle)
    }

    /// Retire an occupied sandbox: forget it, destroy it, then backfill.
    ///
    /// Releasing an ID that is not occupied (including a second release of
    /// the same sandbox) is an error.
    pub async fn release(&self, id: HandleId) -> PoolResult<()> {
        self.inner.release(id).await
    }

    /// Destroy every ready sandbox and stop the pool from creating more.
    ///
    /// Occupied sandboxes are left to their in-flight tasks.
    pub async fn drain_all(&self) {
        let drained: Vec<Arc<SandboxHandle>> = {
            let mut state = self.inner.state.lock().await;
            state.active = false;
            let ids = std::mem::take(&mut state.ready);
            ids.into_iter()
                .filter_map(|id| state.handles.remove(&id))
                .collect()
        };

        info!(count = drained.len(), "removing all ready sandboxes");
        for handle in drained {
            handle.remove().await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            ready: state.ready.len(),
            occupied: state.occupied.len(),
        }
    }
}

impl PoolInner {
    async fn release(&self, id: HandleId) -> PoolResult<()> {
        let handle = {
            let mut state = self.state.lock().await;
            if !state.occupied.remove(&id) {
                return Err(PoolError::InvalidState(id));
            }
            state.handles.remove(&id)
        };

        if let Some(handle) = handle {
            info!(sandbox = %handle.name(), "cleaning up sandbox");
            handle.remove().await;
        }

        let mut state = self.state.lock().await;
        if state.active {
            self.backfill(&mut state).await;
        }
        Ok(())
    }

    /// Create sandboxes until `ready` reaches the target or the pool
    /// reaches `max_active`, whichever comes first.
    ///
    /// Runs with the state lock held, so the counts seen right after an
    /// `allocate` or `release` already include the new sandboxes. The cost
    /// is that concurrent `allocate`, `release` and `stats` calls wait for
    /// container creation to finish.
    async fn backfill(&self, state: &mut PoolState) {
        let wanted = backfill_count(
            self.options.ready_target,
            self.options.max_active,
            state.ready.len(),
            state.occupied.len(),
        );
        if wanted == 0 {
            return;
        }
        info!(count = wanted, "preparing sandboxes");

        let mut join_set = JoinSet::new();
        for _ in 0..wanted {
            let runtime = Arc::clone(&self.runtime);
            let spec = self.options.spec.clone();
            join_set.spawn(async move { runtime.create(&spec).await });
        }

        let mut created = 0;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(name)) => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let handle = SandboxHandle::new(
                        id,
                        name,
                        Arc::clone(&self.runtime),
                        self.options.upload_dir.clone(),
                        self.options.exec_timeout,
                    );
                    state.handles.insert(id, Arc::new(handle));
                    state.ready.push(id);
                    created += 1;
                }
                Ok(Err(e)) => error!(error = %e, "failed to create sandbox"),
                Err(e) => error!(error = %e, "sandbox creation task panicked"),
            }
        }

        if created < wanted {
            warn!(
                requested = wanted,
                created,
                "prepared fewer sandboxes than requested"
            );
        }
    }
}

/// Number of sandboxes a backfill creates:
/// `min(ready_target - ready, max_active - occupied - ready)`, never negative.
fn backfill_count(ready_target: usize, max_active: usize, ready: usize, occupied: usize) -> usize {
    let wanted = ready_target.saturating_sub(ready);
    let room = max_active.saturating_sub(occupied + ready);
    wanted.min(room)
}

/// Releases its sandbox once the sandbox's command has completed.
struct ReleaseTrigger {
    pool: Weak<PoolInner>,
    id: HandleId,
}

#[async_trait]
impl CompletionObserver for ReleaseTrigger {
    async fn on_completion(&self, _outcome: Outcome) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if let Err(e) = pool.release(self.id).await {
            warn!(error = %e, "release after completion failed");
        }
    }
}
