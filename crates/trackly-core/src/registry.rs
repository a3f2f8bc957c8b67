// ── Subscription registry ──
//
// Reference-counted interest in server channels. Pure bookkeeping: no I/O,
// no locks. The engine actor owns the registry and forwards whatever
// control messages it returns to the connection manager.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use trackly_api::{Channel, ClientMessage};

use crate::model::EntityKey;

/// Identifies one consumer's hold on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    ref_count: usize,
    /// The server currently holds this subscription.
    active: bool,
}

/// Result of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribed {
    pub handle: HandleId,
    /// This was the first consumer for the key.
    pub created: bool,
    /// Message to send now, if connected and newly created.
    pub message: Option<ClientMessage>,
}

/// Result of [`SubscriptionRegistry::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub key: EntityKey,
    /// The last consumer let go; local state for the key is gone.
    pub removed: bool,
    /// Message to send now, if the server held the subscription.
    pub message: Option<ClientMessage>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: IndexMap<EntityKey, Subscription>,
    handles: HashMap<HandleId, EntityKey>,
    next_handle: u64,
    connected: bool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more consumer for `key`.
    pub fn subscribe(&mut self, key: EntityKey) -> Subscribed {
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.handles.insert(handle, key.clone());

        let connected = self.connected;
        let entry = self.entries.entry(key.clone()).or_insert(Subscription {
            ref_count: 0,
            active: false,
        });
        entry.ref_count += 1;

        let created = entry.ref_count == 1;
        let message = if created && connected {
            entry.active = true;
            Some(ClientMessage::Subscribe(Channel::from(&key)))
        } else {
            None
        };

        tracing::debug!(%key, %handle, ref_count = entry.ref_count, sent = message.is_some(), "Subscribed");
        Subscribed {
            handle,
            created,
            message,
        }
    }

    /// Drop one consumer. Unknown or already released handles are ignored.
    pub fn release(&mut self, handle: HandleId) -> Option<Released> {
        let key = self.handles.remove(&handle)?;
        let entry = self.entries.get_mut(&key)?;
        entry.ref_count = entry.ref_count.saturating_sub(1);

        if entry.ref_count > 0 {
            tracing::debug!(%key, %handle, ref_count = entry.ref_count, "Released");
            return Some(Released {
                key,
                removed: false,
                message: None,
            });
        }

        let was_active = entry.active;
        self.entries.shift_remove(&key);
        let message = (was_active && self.connected)
            .then(|| ClientMessage::Unsubscribe(Channel::from(&key)));

        tracing::debug!(%key, %handle, sent = message.is_some(), "Subscription removed");
        Some(Released {
            key,
            removed: true,
            message,
        })
    }

    /// A link came up: every live entry is (re)subscribed exactly once.
    pub fn on_connected(&mut self) -> Vec<ClientMessage> {
        self.connected = true;
        self.entries
            .iter_mut()
            .map(|(key, entry)| {
                entry.active = true;
                ClientMessage::Subscribe(Channel::from(key))
            })
            .collect()
    }

    /// The link dropped: the server no longer holds anything.
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        for (key, entry) in &mut self.entries {
            if entry.active {
                tracing::debug!(%key, "Subscription dropped by disconnect");
            }
            entry.active = false;
        }
    }

    pub fn ref_count(&self, key: &EntityKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.ref_count)
    }

    pub fn is_active(&self, key: &EntityKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.active)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Key a handle refers to, if it is still held.
    pub fn key_of(&self, handle: HandleId) -> Option<&EntityKey> {
        self.handles.get(&handle)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Subscribed keys in first-subscribed order.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
