//! Typing indicators.
//!
//! One signal per (channel, user). Each start arms a fresh expiry timer
//! tagged with a generation number; a timer only clears the signal if its
//! generation is still current, so a refresh can never be undone by the
//! timer it replaced. Broadcasts happen under the signal lock so started and
//! stopped events for one signal reach subscribers in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use murmur_shared::protocol::{ServerEvent, TypingSignal};
use murmur_shared::types::{ChannelId, UserId};

use crate::auth::Identity;
use crate::registry::{ConnectionRegistry, Skip};

type SignalKey = (ChannelId, UserId);

struct ActiveSignal {
    generation: u64,
    display_name: String,
    expiry: JoinHandle<()>,
}

struct TypingInner {
    registry: ConnectionRegistry,
    timeout: Duration,
    next_generation: AtomicU64,
    signals: Mutex<HashMap<SignalKey, ActiveSignal>>,
}

#[derive(Clone)]
pub struct TypingManager {
    inner: Arc<TypingInner>,
}

impl TypingManager {
    pub fn new(registry: ConnectionRegistry, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                registry,
                timeout,
                next_generation: AtomicU64::new(1),
                signals: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start or refresh a signal and tell the room's other users.
    /// Callers check membership first.
    pub async fn start(&self, identity: &Identity, channel_id: ChannelId) {
        let key = (channel_id, identity.user_id);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut signals = self.inner.signals.lock().await;
        let expiry = tokio::spawn(expire(self.inner.clone(), key, generation));
        let replaced = signals.insert(
            key,
            ActiveSignal {
                generation,
                display_name: identity.display_name.clone(),
                expiry,
            },
        );
        if let Some(previous) = replaced {
            previous.expiry.abort();
        }

        self.inner
            .registry
            .broadcast_room(
                channel_id,
                ServerEvent::TypingStarted(signal(key, Some(identity.display_name.clone()))),
                Skip::User(identity.user_id),
            )
            .await;
    }

    /// Clear a signal. Returns `false` (and emits nothing) when none was active.
    pub async fn stop(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        let key = (channel_id, user_id);
        let mut signals = self.inner.signals.lock().await;
        let Some(active) = signals.remove(&key) else {
            return false;
        };
        active.expiry.abort();
        self.inner.announce_stop(key, active.display_name).await;
        true
    }

    /// Clear every signal held by a user, e.g. when their connection closes.
    pub async fn stop_all(&self, user_id: UserId) -> usize {
        let mut signals = self.inner.signals.lock().await;
        let keys: Vec<SignalKey> = signals
            .keys()
            .filter(|(_, user)| *user == user_id)
            .copied()
            .collect();

        for key in &keys {
            if let Some(active) = signals.remove(key) {
                active.expiry.abort();
                self.inner.announce_stop(*key, active.display_name).await;
            }
        }
        keys.len()
    }

    #[cfg(test)]
    pub async fn is_typing(&self, user_id: UserId, channel_id: ChannelId) -> bool {
        self.inner
            .signals
            .lock()
            .await
            .contains_key(&(channel_id, user_id))
    }
}

impl TypingInner {
    async fn announce_stop(&self, key: SignalKey, display_name: String) {
        self.registry
            .broadcast_room(
                key.0,
                ServerEvent::TypingStopped(signal(key, Some(display_name))),
                Skip::User(key.1),
            )
            .await;
    }
}

async fn expire(inner: Arc<TypingInner>, key: SignalKey, generation: u64) {
    tokio::time::sleep(inner.timeout).await;

    let mut signals = inner.signals.lock().await;
    let current = signals.get(&key).map(|s| s.generation);
    if current != Some(generation) {
        return;
    }
    if let Some(active) = signals.remove(&key) {
        debug!(channel = %key.0, user = %key.1, "Typing signal expired");
        inner.announce_stop(key, active.display_name).await;
    }
}

fn signal(key: SignalKey, display_name: Option<String>) -> TypingSignal {
    TypingSignal {
        user_id: key.1,
        channel_id: key.0,
        display_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registration;
    use tokio::sync::mpsc;

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: UserId::new(),
            display_name: name.to_string(),
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Started(UserId),
        Stopped(UserId),
    }

    fn typing_events(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<Seen> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ServerEvent::TypingStarted(s) => seen.push(Seen::Started(s.user_id)),
                ServerEvent::TypingStopped(s) => seen.push(Seen::Stopped(s.user_id)),
                _ => {}
            }
        }
        seen
    }

    async fn room(registry: &ConnectionRegistry, channel: ChannelId, who: &Identity) -> Registration {
        let reg = registry.register(who.clone()).await;
        registry.join_room(reg.id, channel).await;
        reg
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_expires_after_timeout() {
        let registry = ConnectionRegistry::new(16);
        let typing = TypingManager::new(registry.clone(), Duration::from_secs(2));
        let channel = ChannelId::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let mut alice_conn = room(&registry, channel, &alice).await;
        let mut bob_conn = room(&registry, channel, &bob).await;

        typing.start(&alice, channel).await;

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(typing_events(&mut bob_conn.outbound), vec![Seen::Started(alice.user_id)]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(typing_events(&mut bob_conn.outbound), vec![Seen::Stopped(alice.user_id)]);
        assert!(!typing.is_typing(alice.user_id, channel).await);

        // the typist never hears about their own signal
        assert!(typing_events(&mut alice_conn.outbound).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_signal() {
        let registry = ConnectionRegistry::new(16);
        let typing = TypingManager::new(registry.clone(), Duration::from_secs(2));
        let channel = ChannelId::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let _alice_conn = room(&registry, channel, &alice).await;
        let mut bob_conn = room(&registry, channel, &bob).await;

        typing.start(&alice, channel).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        typing.start(&alice, channel).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // the first timer would have fired at 2s; the refresh keeps it alive
        assert!(typing.is_typing(alice.user_id, channel).await);
        let seen = typing_events(&mut bob_conn.outbound);
        assert!(seen.iter().all(|s| matches!(s, Seen::Started(_))));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(typing_events(&mut bob_conn.outbound), vec![Seen::Stopped(alice.user_id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_emits_once() {
        let registry = ConnectionRegistry::new(16);
        let typing = TypingManager::new(registry.clone(), Duration::from_secs(2));
        let channel = ChannelId::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let _alice_conn = room(&registry, channel, &alice).await;
        let mut bob_conn = room(&registry, channel, &bob).await;

        typing.start(&alice, channel).await;
        assert!(typing.stop(alice.user_id, channel).await);
        assert!(!typing.stop(alice.user_id, channel).await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            typing_events(&mut bob_conn.outbound),
            vec![Seen::Started(alice.user_id), Seen::Stopped(alice.user_id)]
        );
    }

    #[tokio::test]
    async fn test_stop_without_signal_is_silent() {
        let registry = ConnectionRegistry::new(16);
        let typing = TypingManager::new(registry.clone(), Duration::from_secs(2));
        let channel = ChannelId::new();
        let bob = identity("bob");
        let mut bob_conn = room(&registry, channel, &bob).await;

        assert!(!typing.stop(UserId::new(), channel).await);
        assert!(typing_events(&mut bob_conn.outbound).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_clears_every_channel() {
        let registry = ConnectionRegistry::new(16);
        let typing = TypingManager::new(registry.clone(), Duration::from_secs(2));
        let general = ChannelId::new();
        let random = ChannelId::new();
        let alice = identity("alice");
        let bob = identity("bob");
        let mut bob_conn = registry.register(bob.clone()).await;
        registry.join_room(bob_conn.id, general).await;
        registry.join_room(bob_conn.id, random).await;

        typing.start(&alice, general).await;
        typing.start(&alice, random).await;
        assert_eq!(typing.stop_all(alice.user_id).await, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let seen = typing_events(&mut bob_conn.outbound);
        assert_eq!(seen.iter().filter(|s| matches!(s, Seen::Stopped(_))).count(), 2);
    }
}
