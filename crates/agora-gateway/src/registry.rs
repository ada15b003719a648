//! Conversation registry: who is subscribed to what, and the per-conversation
//! sequencer that keeps delivery order equal to commit order.
//!
//! State is sharded into one [`Slot`] per conversation. The top-level maps are
//! only held long enough to find or create a slot; all fan-out and membership
//! bookkeeping happens under the slot's own lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::trace;

use agora_types::events::ServerEvent;
use agora_types::{ConversationId, SessionId, UserId};

use crate::sessions::{Outbound, SessionHandle};

pub struct Slot {
    /// Held from the start of a commit until every subscriber has the event.
    order: Arc<Mutex<()>>,
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    subscribers: HashMap<SessionId, Arc<SessionHandle>>,
    /// Active member ids, loaded lazily from the store.
    members: Option<HashSet<UserId>>,
    /// Registry epoch of the last membership change, or of the slot's
    /// creation. A load that started before it cannot install its set.
    changed: u64,
}

impl Slot {
    fn new(epoch: u64) -> Self {
        Self {
            order: Arc::new(Mutex::new(())),
            state: Mutex::new(SlotState {
                changed: epoch,
                ..SlotState::default()
            }),
        }
    }
}

/// Result of a member cache lookup.
pub enum CachedMembers {
    Hit(HashSet<UserId>),
    /// Load from the store, then hand the set back with this epoch.
    Miss { epoch: u64 },
}

#[derive(Default)]
pub struct Registry {
    /// Monotonic across all slots, so a slot that was pruned and recreated
    /// still rejects loads that began before it existed.
    epoch: AtomicU64,
    slots: RwLock<HashMap<ConversationId, Arc<Slot>>>,
    /// session -> subscribed conversations
    by_session: RwLock<HashMap<SessionId, HashSet<ConversationId>>>,
    /// user seen since startup -> joined conversations
    by_user: RwLock<HashMap<UserId, HashSet<ConversationId>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn slot(&self, conversation_id: ConversationId) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(&conversation_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Slot::new(self.bump())))
            .clone()
    }

    /// Take the conversation's sequencing lock.
    pub async fn sequence(&self, conversation_id: ConversationId) -> OwnedMutexGuard<()> {
        let slot = self.slot(conversation_id).await;
        slot.order.clone().lock_owned().await
    }

    // -- Subscriptions --

    pub async fn subscribe(&self, session: &Arc<SessionHandle>, conversation_id: ConversationId) {
        let slot = self.slot(conversation_id).await;
        slot.state
            .lock()
            .await
            .subscribers
            .insert(session.id, session.clone());
        self.by_session
            .write()
            .await
            .entry(session.id)
            .or_default()
            .insert(conversation_id);
    }

    pub async fn unsubscribe(&self, session_id: SessionId, conversation_id: ConversationId) -> bool {
        let slot = self.slots.read().await.get(&conversation_id).cloned();
        let removed = match slot {
            Some(slot) => slot.state.lock().await.subscribers.remove(&session_id).is_some(),
            None => false,
        };
        if let Some(convs) = self.by_session.write().await.get_mut(&session_id) {
            convs.remove(&conversation_id);
        }
        removed
    }

    /// Drop every subscription of a session. Returns how many there were.
    pub async fn unsubscribe_all(&self, session_id: SessionId) -> usize {
        let Some(convs) = self.by_session.write().await.remove(&session_id) else {
            return 0;
        };
        let slots: Vec<Arc<Slot>> = {
            let slots = self.slots.read().await;
            convs.iter().filter_map(|cid| slots.get(cid).cloned()).collect()
        };
        for slot in &slots {
            slot.state.lock().await.subscribers.remove(&session_id);
        }
        convs.len()
    }

    pub async fn subscriptions(&self, session_id: SessionId) -> Vec<ConversationId> {
        let mut convs: Vec<ConversationId> = self
            .by_session
            .read()
            .await
            .get(&session_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        convs.sort_unstable();
        convs
    }

    // -- Fan-out --

    /// Enqueue `event` on every subscriber of the conversation. Returns how
    /// many sessions accepted it.
    pub async fn broadcast(&self, conversation_id: ConversationId, event: ServerEvent) -> usize {
        let Some(slot) = self.slots.read().await.get(&conversation_id).cloned() else {
            return 0;
        };
        let event: Outbound = Arc::new(event);
        let state = slot.state.lock().await;
        let delivered = state
            .subscribers
            .values()
            .filter(|s| s.push(event.clone()))
            .count();
        trace!(conversation_id, delivered, "broadcast");
        delivered
    }

    /// Deliver once to every session subscribed to any of the conversations.
    pub async fn broadcast_many(&self, conversation_ids: &[ConversationId], event: ServerEvent) -> usize {
        let slots: Vec<Arc<Slot>> = {
            let slots = self.slots.read().await;
            conversation_ids.iter().filter_map(|cid| slots.get(cid).cloned()).collect()
        };

        let mut targets: HashMap<SessionId, Arc<SessionHandle>> = HashMap::new();
        for slot in &slots {
            let state = slot.state.lock().await;
            for (id, session) in &state.subscribers {
                targets.entry(*id).or_insert_with(|| session.clone());
            }
        }

        let event: Outbound = Arc::new(event);
        targets.values().filter(|s| s.push(event.clone())).count()
    }

    // -- Member cache --

    pub async fn cached_members(&self, conversation_id: ConversationId) -> CachedMembers {
        let slot = self.slot(conversation_id).await;
        let state = slot.state.lock().await;
        match &state.members {
            Some(members) => CachedMembers::Hit(members.clone()),
            None => CachedMembers::Miss {
                epoch: self.epoch.load(Ordering::SeqCst),
            },
        }
    }

    /// Install a freshly loaded member set unless membership changed since
    /// the load began. Returns whether it was installed.
    pub async fn fill_members(&self, conversation_id: ConversationId, epoch: u64, members: HashSet<UserId>) -> bool {
        let slot = self.slot(conversation_id).await;
        let mut state = slot.state.lock().await;
        if state.changed > epoch {
            return false;
        }
        state.members = Some(members);
        true
    }

    pub async fn member_added(&self, conversation_id: ConversationId, user_id: UserId) {
        let slot = self.slot(conversation_id).await;
        {
            let mut state = slot.state.lock().await;
            state.changed = self.bump();
            if let Some(members) = state.members.as_mut() {
                members.insert(user_id);
            }
        }
        if let Some(convs) = self.by_user.write().await.get_mut(&user_id) {
            convs.insert(conversation_id);
        }
    }

    pub async fn member_removed(&self, conversation_id: ConversationId, user_id: UserId) {
        let slot = self.slot(conversation_id).await;
        {
            let mut state = slot.state.lock().await;
            state.changed = self.bump();
            if let Some(members) = state.members.as_mut() {
                members.remove(&user_id);
            }
        }
        if let Some(convs) = self.by_user.write().await.get_mut(&user_id) {
            convs.remove(&conversation_id);
        }
    }

    // -- User index --

    pub async fn track_user(&self, user_id: UserId, conversation_ids: &[ConversationId]) {
        self.by_user
            .write()
            .await
            .insert(user_id, conversation_ids.iter().copied().collect());
    }

    pub async fn user_conversations(&self, user_id: UserId) -> Vec<ConversationId> {
        let mut convs: Vec<ConversationId> = self
            .by_user
            .read()
            .await
            .get(&user_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        convs.sort_unstable();
        convs
    }

    /// Drop slots nobody is subscribed to or holding. Returns how many went.
    pub async fn prune_idle_slots(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 || Arc::strong_count(&slot.order) > 1 {
                return true;
            }
            match slot.state.try_lock() {
                Ok(state) => !state.subscribers.is_empty(),
                Err(_) => true,
            }
        });
        before - slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionManager;
    use agora_types::models::{Principal, Role};
    use chrono::{Duration, Utc};

    async fn session(manager: &SessionManager, user_id: UserId) -> (Arc<SessionHandle>, tokio::sync::mpsc::Receiver<Outbound>) {
        manager
            .register(
                Principal {
                    user_id,
                    username: format!("u{}", user_id),
                    role: Role::User,
                    expires_at: Utc::now() + Duration::hours(1),
                },
                String::new(),
            )
            .await
    }

    fn pong() -> ServerEvent {
        ServerEvent::Pong { timestamp: Utc::now() }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let manager = SessionManager::new(8);
        let registry = Registry::new();
        let (a, mut rx_a) = session(&manager, 1).await;
        let (b, mut rx_b) = session(&manager, 2).await;

        registry.subscribe(&a, 10).await;
        registry.subscribe(&b, 11).await;

        assert_eq!(registry.broadcast(10, pong()).await, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        assert!(registry.unsubscribe(a.id, 10).await);
        assert_eq!(registry.broadcast(10, pong()).await, 0);
        assert!(registry.subscriptions(a.id).await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_many_deduplicates_sessions() {
        let manager = SessionManager::new(8);
        let registry = Registry::new();
        let (a, mut rx_a) = session(&manager, 1).await;
        registry.subscribe(&a, 1).await;
        registry.subscribe(&a, 2).await;

        assert_eq!(registry.broadcast_many(&[1, 2, 3], pong()).await, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());

        assert_eq!(registry.unsubscribe_all(a.id).await, 2);
        assert_eq!(registry.broadcast_many(&[1, 2], pong()).await, 0);
    }

    #[tokio::test]
    async fn stale_member_load_is_discarded() {
        let registry = Registry::new();

        let CachedMembers::Miss { epoch } = registry.cached_members(5).await else {
            panic!("cache should start empty");
        };
        // Membership changes while the load is in flight.
        registry.member_added(5, 9).await;
        assert!(!registry.fill_members(5, epoch, HashSet::from([1])).await);

        let CachedMembers::Miss { epoch } = registry.cached_members(5).await else {
            panic!("stale load must not be installed");
        };
        assert!(registry.fill_members(5, epoch, HashSet::from([1, 9])).await);

        registry.member_removed(5, 1).await;
        match registry.cached_members(5).await {
            CachedMembers::Hit(members) => assert_eq!(members, HashSet::from([9])),
            CachedMembers::Miss { .. } => panic!("expected cached members"),
        }
    }

    #[tokio::test]
    async fn load_spanning_a_pruned_slot_is_discarded() {
        let registry = Registry::new();

        let CachedMembers::Miss { epoch } = registry.cached_members(5).await else {
            panic!("cache should start empty");
        };
        registry.member_added(5, 9).await;
        // Nobody holds the slot, so it goes and comes back fresh.
        assert_eq!(registry.prune_idle_slots().await, 1);
        assert!(!registry.fill_members(5, epoch, HashSet::from([1])).await);

        let CachedMembers::Miss { epoch } = registry.cached_members(5).await else {
            panic!("stale load must not be installed");
        };
        assert!(registry.fill_members(5, epoch, HashSet::from([1, 9])).await);
    }

    #[tokio::test]
    async fn sequencer_is_exclusive_per_conversation() {
        let registry = Registry::new();
        let guard = registry.sequence(1).await;
        // Another conversation is unaffected.
        let _other = registry.sequence(2).await;

        let slot = registry.slot(1).await;
        assert!(slot.order.try_lock().is_err());
        drop(guard);
        assert!(slot.order.try_lock().is_ok());
    }

    #[tokio::test]
    async fn idle_slots_are_pruned() {
        let manager = SessionManager::new(8);
        let registry = Registry::new();
        let (a, _rx) = session(&manager, 1).await;
        registry.subscribe(&a, 1).await;
        drop(registry.sequence(2).await);

        assert_eq!(registry.prune_idle_slots().await, 1);
        assert_eq!(registry.broadcast(1, pong()).await, 1);
    }

    #[tokio::test]
    async fn user_index_tracks_membership_changes() {
        let registry = Registry::new();
        registry.track_user(4, &[1, 2]).await;
        registry.member_added(3, 4).await;
        registry.member_removed(1, 4).await;
        assert_eq!(registry.user_conversations(4).await, vec![2, 3]);
        assert!(registry.user_conversations(5).await.is_empty());
    }
}
