//! Session registry: one live [`Session`] per caller identity
//!
//! Each identity owns a slot guarded by its own async mutex, so creating a
//! session for one identity never blocks requests of another. The identity
//! map itself is only locked briefly to find or insert a slot.
//!
//! A slot removed from the map by the sweeper is marked `Retired`; a request
//! that was waiting on it starts over with a fresh lookup, which keeps the
//! one-session-per-identity invariant while eviction races with new requests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::config::{FunctionConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::identity::CallerIdentity;
use crate::session::{EngineFactory, Session};

#[derive(Debug)]
enum SlotState {
    Absent,
    Active(Arc<Session>),
    /// Removed from the registry map; holders must look the identity up again
    Retired,
}

#[derive(Debug)]
struct SessionSlot {
    state: AsyncMutex<SlotState>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            state: AsyncMutex::new(SlotState::Absent),
        }
    }
}

/// Maps caller identities to their engine sessions
#[derive(Debug)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<CallerIdentity, Arc<SessionSlot>>>,
    /// Active sessions, maintained alongside the slot states
    live: Mutex<HashMap<CallerIdentity, Arc<Session>>>,
    factory: Arc<dyn EngineFactory>,
    cache: Arc<MetadataCache>,
    session_config: SessionConfig,
    function_config: FunctionConfig,
    shutting_down: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        cache: Arc<MetadataCache>,
        session_config: SessionConfig,
        function_config: FunctionConfig,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            factory,
            cache,
            session_config,
            function_config,
            shutting_down: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Session of `identity`, opening one if it has none
    ///
    /// Concurrent calls for the same identity wait on one another and end up
    /// with the same session. Idle or over-age sessions found here are
    /// replaced. A failed open leaves the identity without a session, so the
    /// next call tries again.
    pub async fn get_or_create(&self, identity: &CallerIdentity) -> Result<Arc<Session>> {
        loop {
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }

            let slot = {
                let mut slots = self.slots.lock();
                Arc::clone(
                    slots
                        .entry(identity.clone())
                        .or_insert_with(|| Arc::new(SessionSlot::new())),
                )
            };

            let mut state = slot.state.lock().await;

            let stale = match &*state {
                SlotState::Retired => continue,
                SlotState::Active(session) => {
                    if self.is_stale(session, Instant::now()) {
                        Some(Arc::clone(session))
                    } else {
                        session.touch();
                        return Ok(Arc::clone(session));
                    }
                }
                SlotState::Absent => None,
            };

            if let Some(session) = stale {
                info!(%identity, session_id = %session.id(), "Replacing stale session");
                self.forget(&session);
                session.close();
                *state = SlotState::Absent;
            }

            // shutdown may have drained the map after this slot was looked up
            if self.is_shutting_down() {
                return Err(Error::ShuttingDown);
            }

            let session = self.open_session(identity).map_err(|e| {
                warn!(%identity, "Failed to create session: {}", e);
                Error::SessionCreation {
                    identity: identity.to_string(),
                    source: Box::new(e),
                }
            })?;

            info!(%identity, session_id = %session.id(), "Created session");
            let session = Arc::new(session);
            *state = SlotState::Active(Arc::clone(&session));
            self.live.lock().insert(identity.clone(), Arc::clone(&session));
            return Ok(session);
        }
    }

    fn open_session(&self, identity: &CallerIdentity) -> Result<Session> {
        let ctx = self.factory.create(identity)?;
        Session::open(
            identity.clone(),
            ctx,
            Arc::clone(&self.cache),
            &self.function_config,
            self.session_config.max_concurrent_queries,
        )
    }

    fn is_stale(&self, session: &Session, now: Instant) -> bool {
        if session.is_closed() {
            return true;
        }
        if session.active_queries() > 0 {
            return false;
        }
        session.is_idle(now, self.session_config.idle_timeout())
            || session.is_expired(now, self.session_config.max_lifetime())
    }

    /// Evict sessions idle past the timeout or older than the max lifetime
    ///
    /// Returns the number of sessions closed. Slots busy opening a session are
    /// skipped until the next sweep.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let slots: Vec<(CallerIdentity, Arc<SessionSlot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(identity, slot)| (identity.clone(), Arc::clone(slot)))
            .collect();

        let mut evicted = 0;
        for (identity, slot) in slots {
            let Ok(mut state) = slot.state.try_lock() else {
                continue;
            };

            let evict = match &*state {
                SlotState::Absent => true,
                SlotState::Active(session) => self.is_stale(session, now),
                SlotState::Retired => false,
            };
            if !evict {
                continue;
            }

            {
                let mut slots = self.slots.lock();
                if slots
                    .get(&identity)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    slots.remove(&identity);
                }
            }

            if let SlotState::Active(session) = std::mem::replace(&mut *state, SlotState::Retired) {
                debug!(
                    %identity,
                    session_id = %session.id(),
                    idle_ms = now.saturating_duration_since(session.last_used()).as_millis() as u64,
                    "Evicting session"
                );
                self.forget(&session);
                session.close();
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = self.len(), "Session sweep complete");
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) periodically on the current Tokio runtime
    ///
    /// The task holds a weak reference and ends once the registry is dropped
    /// or shut down.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.session_config.sweep_interval().max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if registry.is_shutting_down() {
                    break;
                }
                registry.sweep();
            }
            debug!("Session sweeper stopped");
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Close every session and refuse further requests
    ///
    /// Returns the number of sessions closed.
    pub async fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return 0;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        let slots: Vec<Arc<SessionSlot>> = self.slots.lock().drain().map(|(_, slot)| slot).collect();

        let mut closed = 0;
        for slot in slots {
            let mut state = slot.state.lock().await;
            if let SlotState::Active(session) = std::mem::replace(&mut *state, SlotState::Retired) {
                self.forget(&session);
                session.close();
                closed += 1;
            }
        }

        info!(closed, "Session registry shut down");
        closed
    }

    /// Number of identities with an active session
    pub fn len(&self) -> usize {
        self.active_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities with an active session, sorted
    pub fn identities(&self) -> Vec<CallerIdentity> {
        let mut identities: Vec<CallerIdentity> = self
            .active_sessions()
            .into_iter()
            .map(|session| session.identity().clone())
            .collect();
        identities.sort();
        identities
    }

    fn active_sessions(&self) -> Vec<Arc<Session>> {
        self.live.lock().values().cloned().collect()
    }

    /// Drop `session` from the live set unless a newer session replaced it
    fn forget(&self, session: &Arc<Session>) {
        let mut live = self.live.lock();
        if live
            .get(session.identity())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            live.remove(session.identity());
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
