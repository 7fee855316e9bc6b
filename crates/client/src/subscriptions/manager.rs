//! Channel registry with bounded retry and re-entrant-safe teardown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chatsync_shared::{ChannelSpec, ChannelStatus};
use futures_util::future::join_all;
use tokio::task::JoinHandle;

use super::state::{ChannelKey, RetryPolicy, SubscriptionState};
use crate::transport::{FrameSink, Transport};

/// One registered channel.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub key: ChannelKey,
    pub spec: ChannelSpec,
    pub state: SubscriptionState,
    /// Failed attempts since the last successful subscribe.
    pub retry_count: u32,
    /// Bumped whenever a new connect loop takes over the handle.
    generation: u64,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    handles: HashMap<ChannelKey, SubscriptionHandle>,
    next_generation: u64,
}

impl Registry {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

struct ManagerInner {
    viewer_id: String,
    transport: Arc<dyn Transport>,
    sink: FrameSink,
    conversation_policy: RetryPolicy,
    global_policy: RetryPolicy,
    registry: Mutex<Registry>,
    cleanup_in_progress: AtomicBool,
}

/// Owns every channel subscription of one engine.
///
/// Only this type mutates the registry; everything else asks it questions.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        viewer_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        sink: FrameSink,
        conversation_policy: RetryPolicy,
        global_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                viewer_id: viewer_id.into(),
                transport,
                sink,
                conversation_policy,
                global_policy,
                registry: Mutex::new(Registry::default()),
                cleanup_in_progress: AtomicBool::new(false),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panic while holding the lock leaves the map itself consistent.
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn policy_for(&self, key: &ChannelKey) -> &RetryPolicy {
        match key {
            ChannelKey::Global => &self.inner.global_policy,
            ChannelKey::Conversation(_) => &self.inner.conversation_policy,
        }
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.inner.cleanup_in_progress.load(Ordering::Acquire)
    }

    /// Subscribe the viewer's global channel.
    pub fn start(&self) -> bool {
        self.subscribe(ChannelKey::Global)
    }

    /// Register a channel and start connecting. No-op if a handle exists.
    pub fn subscribe(&self, key: ChannelKey) -> bool {
        if self.is_cleaning_up() {
            crate::log_debug!("Skipping subscribe for {} during teardown", key);
            return false;
        }

        let mut registry = self.registry();
        if registry.handles.contains_key(&key) {
            return false;
        }

        let generation = registry.next_generation();
        let spec = key.spec(&self.inner.viewer_id);
        let task = tokio::spawn(self.clone().connect_loop(key.clone(), generation, None));
        registry.handles.insert(
            key.clone(),
            SubscriptionHandle {
                key: key.clone(),
                spec,
                state: SubscriptionState::Idle,
                retry_count: 0,
                generation,
                task: Some(task),
            },
        );
        crate::log_debug!("Registered subscription for {}", key);
        true
    }

    /// Fresh attempt for a channel that exhausted its retries, or a first
    /// attempt for an unknown one.
    pub fn resubscribe(&self, key: ChannelKey) -> bool {
        {
            let mut registry = self.registry();
            match registry.handles.get(&key) {
                Some(handle) if handle.state.is_failed() => {
                    crate::log_info!("Retrying failed subscription for {}", key);
                    registry.handles.remove(&key);
                }
                Some(_) => return false,
                None => {}
            }
        }
        self.subscribe(key)
    }

    /// Tear down one channel.
    pub async fn unsubscribe(&self, key: &ChannelKey) -> bool {
        let Some(handle) = self.registry().handles.remove(key) else {
            return false;
        };
        if let Some(task) = &handle.task {
            task.abort();
        }
        if let Err(e) = self.inner.transport.unsubscribe(&handle.spec.name).await {
            crate::log_warn!("Failed to unsubscribe {}: {}", handle.spec.name, e);
        }
        crate::log_debug!("Unsubscribed {}", key);
        true
    }

    /// Unsubscribe and discard every handle. A call made while another
    /// teardown is running returns immediately.
    pub async fn stop(&self) {
        if self
            .inner
            .cleanup_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            crate::log_debug!("Teardown already in progress");
            return;
        }

        let handles: Vec<SubscriptionHandle> = self
            .registry()
            .handles
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        for handle in &handles {
            if let Some(task) = &handle.task {
                task.abort();
            }
        }

        let transport = &self.inner.transport;
        let results = join_all(
            handles
                .iter()
                .map(|handle| transport.unsubscribe(&handle.spec.name)),
        )
        .await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                crate::log_warn!("Failed to unsubscribe {}: {}", handle.spec.name, e);
            }
        }

        crate::log_info!("Tore down {} subscriptions", handles.len());
        self.inner.cleanup_in_progress.store(false, Ordering::Release);
    }

    /// Make conversation handles match `conversation_ids`: stale handles are
    /// torn down, missing ones subscribed. The global channel is untouched.
    pub async fn sync_with(&self, conversation_ids: &[String]) {
        let wanted: HashSet<&str> = conversation_ids.iter().map(String::as_str).collect();
        let (stale, missing) = {
            let registry = self.registry();
            let stale: Vec<ChannelKey> = registry
                .handles
                .keys()
                .filter(|key| match key {
                    ChannelKey::Conversation(id) => !wanted.contains(id.as_str()),
                    ChannelKey::Global => false,
                })
                .cloned()
                .collect();
            let missing: Vec<ChannelKey> = wanted
                .iter()
                .map(|id| ChannelKey::conversation(*id))
                .filter(|key| !registry.handles.contains_key(key))
                .collect();
            (stale, missing)
        };

        for key in &stale {
            self.unsubscribe(key).await;
        }
        for key in missing {
            self.subscribe(key);
        }
    }

    /// React to a status change reported after subscribing.
    pub fn handle_status(&self, channel: &str, status: ChannelStatus) {
        if status.is_subscribed() || self.is_cleaning_up() {
            return;
        }

        let mut registry = self.registry();
        let Some(key) = registry
            .handles
            .values()
            .find(|h| h.spec.name == channel)
            .map(|h| h.key.clone())
        else {
            crate::log_debug!("Status {} for unknown channel {}", status, channel);
            return;
        };

        let generation = registry.next_generation();
        let Some(handle) = registry.handles.get_mut(&key) else {
            return;
        };
        if !handle.state.is_subscribed() {
            // A connect loop is already running, or the channel gave up.
            return;
        }

        crate::log_warn!("Channel {} reported {}, reconnecting", channel, status);
        if let Some(task) = handle.task.take() {
            task.abort();
        }
        handle.generation = generation;
        handle.task = Some(tokio::spawn(self.clone().connect_loop(
            key,
            generation,
            Some(status.to_string()),
        )));
    }

    pub fn state(&self, key: &ChannelKey) -> Option<SubscriptionState> {
        self.registry().handles.get(key).map(|h| h.state.clone())
    }

    pub fn retry_count(&self, key: &ChannelKey) -> Option<u32> {
        self.registry().handles.get(key).map(|h| h.retry_count)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.registry().handles.contains_key(key)
    }

    /// Conversation ids that currently own a handle.
    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry()
            .handles
            .keys()
            .filter_map(|key| match key {
                ChannelKey::Conversation(id) => Some(id.clone()),
                ChannelKey::Global => None,
            })
            .collect();
        ids.sort();
        ids
    }

    /// Run `f` on the handle if it still belongs to `generation`.
    fn with_handle<R>(
        &self,
        key: &ChannelKey,
        generation: u64,
        f: impl FnOnce(&mut SubscriptionHandle) -> R,
    ) -> Option<R> {
        let mut registry = self.registry();
        let handle = registry.handles.get_mut(key)?;
        if handle.generation != generation {
            return None;
        }
        Some(f(handle))
    }

    /// Count a failed attempt. Returns the delay before the next attempt, or
    /// `None` once the channel is failed or the handle is gone.
    fn record_failure(
        &self,
        key: &ChannelKey,
        generation: u64,
        reason: String,
    ) -> Option<std::time::Duration> {
        let policy = self.policy_for(key).clone();
        self.with_handle(key, generation, |handle| {
            handle.retry_count += 1;
            if handle.retry_count >= policy.max_attempts {
                crate::log_error!(
                    "Giving up on {} after {} attempts: {}",
                    key,
                    handle.retry_count,
                    reason
                );
                handle.state = SubscriptionState::Failed { reason };
                return None;
            }
            let delay = policy.delay_for_attempt(handle.retry_count - 1);
            crate::log_warn!(
                "Subscribe for {} failed ({}), retrying in {:?} (attempt {})",
                key,
                reason,
                delay,
                handle.retry_count + 1
            );
            handle.state = SubscriptionState::Retrying {
                attempt: handle.retry_count,
            };
            Some(delay)
        })
        .flatten()
    }

    async fn connect_loop(self, key: ChannelKey, generation: u64, initial_failure: Option<String>) {
        let mut pending_failure = initial_failure;

        loop {
            if let Some(reason) = pending_failure.take() {
                let Some(delay) = self.record_failure(&key, generation, reason) else {
                    return;
                };
                tokio::time::sleep(delay).await;
            }

            if self.is_cleaning_up() {
                crate::log_debug!("Dropping retry for {} during teardown", key);
                return;
            }

            let Some(spec) = self.with_handle(&key, generation, |handle| {
                handle.state = SubscriptionState::Connecting;
                handle.spec.clone()
            }) else {
                return;
            };

            match self
                .inner
                .transport
                .subscribe(&spec, self.inner.sink.clone())
                .await
            {
                Ok(ChannelStatus::Subscribed) => {
                    let owned = self.with_handle(&key, generation, |handle| {
                        handle.state = SubscriptionState::Subscribed;
                        handle.retry_count = 0;
                    });
                    if owned.is_none() {
                        // Handle was torn down while the subscribe was in flight.
                        if let Err(e) = self.inner.transport.unsubscribe(&spec.name).await {
                            crate::log_warn!("Failed to unsubscribe {}: {}", spec.name, e);
                        }
                        return;
                    }
                    crate::log_info!("Subscribed to {}", spec.name);
                    return;
                }
                Ok(status) => pending_failure = Some(status.to_string()),
                Err(e) => pending_failure = Some(e.to_string()),
            }
        }
    }
}
