//! Subscription bookkeeping.
//!
//! The registry is the single source of truth for subscriptions and the
//! only mutable state shared between the control task and the read loop.
//! Every operation is atomic under one mutex; iteration always goes
//! through [`SubscriptionRegistry::snapshot`] so no lock is held across
//! I/O or handler invocation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{BoxError, Error};
use crate::protocol::OperationPayload;

/// Length of subscription keys and wire ids.
const KEY_LEN: usize = 16;

/// A fresh identifier: 16 characters drawn uniformly from `[a-zA-Z0-9]`.
pub(crate) fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LEN)
        .map(char::from)
        .collect()
}

/// Callback receiving subscription results.
///
/// `Ok(bytes)` is the raw JSON of an execution result's `data` field,
/// byte-identical to the wire. `Err` is an operation-level server error.
/// Returning an error from the handler terminates the whole session with
/// that error.
pub type SubscriptionHandler =
    Arc<dyn Fn(Result<&[u8], Error>) -> Result<(), BoxError> + Send + Sync>;

/// Where a subscription stands on the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Registered but not yet started on the current connection.
    Waiting,
    /// The start frame went out on the current connection.
    Running,
    /// The client requested a stop.
    Unsubscribed,
    /// The server sent the terminal event.
    Completed,
}

/// A durable binding between a GraphQL operation and a data handler.
///
/// The `key` is assigned at `subscribe` and never changes, surviving any
/// number of reconnects; the wire `id` is regenerated for every
/// connection. The public identifier is always the key.
#[derive(Clone)]
pub struct Subscription {
    key: String,
    id: String,
    payload: OperationPayload,
    handler: SubscriptionHandler,
    status: SubscriptionStatus,
}

impl Subscription {
    pub(crate) fn new(key: String, payload: OperationPayload, handler: SubscriptionHandler) -> Self {
        let id = key.clone();
        Self {
            key,
            id,
            payload,
            handler,
            status: SubscriptionStatus::Waiting,
        }
    }

    /// The stable client-side key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The wire id on the current connection. Equals the key until the
    /// first reconnect.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The stored operation payload.
    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    /// Current status.
    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub(crate) fn handler(&self) -> &SubscriptionHandler {
        &self.handler
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("status", &self.status)
            .field("query", &self.payload.query)
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    by_key: HashMap<String, Subscription>,
    key_by_id: HashMap<String, String>,
}

/// Thread-safe table of subscriptions, indexed by stable key and by the
/// wire id of the current connection.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    /// Register a new subscription. Fails if the key is already present.
    pub fn insert(&self, sub: Subscription) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.by_key.contains_key(&sub.key) {
            return Err(Error::DuplicateKey(sub.key));
        }
        inner.key_by_id.insert(sub.id.clone(), sub.key.clone());
        inner.by_key.insert(sub.key.clone(), sub);
        Ok(())
    }

    pub fn get_by_key(&self, key: &str) -> Option<Subscription> {
        self.lock().by_key.get(key).cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Subscription> {
        let inner = self.lock();
        let key = inner.key_by_id.get(id)?;
        inner.by_key.get(key).cloned()
    }

    /// Rebind a subscription to a fresh wire id. Used on reconnect; the
    /// key stays untouched.
    pub fn update_id(&self, key: &str, new_id: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        let sub = inner
            .by_key
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        let old_id = std::mem::replace(&mut sub.id, new_id.to_string());
        inner.key_by_id.remove(&old_id);
        inner.key_by_id.insert(new_id.to_string(), key.to_string());
        Ok(())
    }

    pub fn set_status(&self, key: &str, status: SubscriptionStatus) -> Result<(), Error> {
        let mut inner = self.lock();
        let sub = inner
            .by_key
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        sub.status = status;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Subscription> {
        let mut inner = self.lock();
        let sub = inner.by_key.remove(key)?;
        inner.key_by_id.remove(&sub.id);
        Some(sub)
    }

    /// A consistent copy of the table, optionally filtered by status.
    /// The lock is released before the caller touches any entry.
    pub fn snapshot(&self, filter: Option<&[SubscriptionStatus]>) -> Vec<Subscription> {
        self.lock()
            .by_key
            .values()
            .filter(|s| filter.map_or(true, |wanted| wanted.contains(&s.status)))
            .cloned()
            .collect()
    }

    pub fn count(&self, filter: Option<&[SubscriptionStatus]>) -> usize {
        self.lock()
            .by_key
            .values()
            .filter(|s| filter.map_or(true, |wanted| wanted.contains(&s.status)))
            .count()
    }

    /// Put every retained subscription back to `Waiting` so a later run
    /// replays it. Ids are left alone; replay regenerates them anyway.
    pub fn reset_to_waiting(&self) {
        let mut inner = self.lock();
        for sub in inner.by_key.values_mut() {
            sub.status = SubscriptionStatus::Waiting;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // A poisoned registry mutex means a panic mid-update; propagating
        // the panic is the only sound option.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(key: &str) -> Subscription {
        Subscription::new(
            key.to_string(),
            OperationPayload::query("subscription{helloSaid{msg}}"),
            Arc::new(|_| Ok(())),
        )
    }

    #[test]
    fn random_keys_are_sixteen_alphanumerics() {
        for _ in 0..100 {
            let key = random_key();
            assert_eq!(key.len(), 16);
            assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn insert_rejects_duplicate_keys() {
        let registry = SubscriptionRegistry::default();
        registry.insert(sub("k1")).unwrap();
        assert!(matches!(
            registry.insert(sub("k1")),
            Err(Error::DuplicateKey(_))
        ));
    }

    #[test]
    fn id_index_follows_update_id() {
        let registry = SubscriptionRegistry::default();
        registry.insert(sub("k1")).unwrap();
        assert_eq!(registry.get_by_id("k1").unwrap().key(), "k1");

        registry.update_id("k1", "w9").unwrap();
        assert!(registry.get_by_id("k1").is_none());
        let rebound = registry.get_by_id("w9").unwrap();
        assert_eq!(rebound.key(), "k1");
        assert_eq!(rebound.id(), "w9");
    }

    #[test]
    fn remove_clears_both_indexes() {
        let registry = SubscriptionRegistry::default();
        registry.insert(sub("k1")).unwrap();
        registry.update_id("k1", "w1").unwrap();
        registry.remove("k1").unwrap();
        assert!(registry.get_by_key("k1").is_none());
        assert!(registry.get_by_id("w1").is_none());
        assert!(registry.remove("k1").is_none());
    }

    #[test]
    fn snapshot_and_count_filter_by_status() {
        let registry = SubscriptionRegistry::default();
        registry.insert(sub("k1")).unwrap();
        registry.insert(sub("k2")).unwrap();
        registry
            .set_status("k2", SubscriptionStatus::Running)
            .unwrap();

        assert_eq!(registry.count(None), 2);
        assert_eq!(registry.count(Some(&[SubscriptionStatus::Waiting])), 1);
        let running = registry.snapshot(Some(&[SubscriptionStatus::Running]));
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].key(), "k2");
    }

    #[test]
    fn reset_to_waiting_touches_every_entry() {
        let registry = SubscriptionRegistry::default();
        registry.insert(sub("k1")).unwrap();
        registry.insert(sub("k2")).unwrap();
        registry
            .set_status("k1", SubscriptionStatus::Running)
            .unwrap();
        registry
            .set_status("k2", SubscriptionStatus::Completed)
            .unwrap();

        registry.reset_to_waiting();
        assert_eq!(registry.count(Some(&[SubscriptionStatus::Waiting])), 2);
    }

    #[test]
    fn set_status_on_unknown_key_fails() {
        let registry = SubscriptionRegistry::default();
        assert!(matches!(
            registry.set_status("nope", SubscriptionStatus::Running),
            Err(Error::UnknownKey(_))
        ));
    }
}
