use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tb_shared::AttributeUpdate;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub type AttributeCallback = Arc<dyn Fn(&AttributeUpdate) + Send + Sync>;

/// Which device's notifications a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// The connected client itself (`v1/devices/me/attributes`).
    OwnDevice,
    /// Every device behind the gateway.
    AnyDevice,
    Device(String),
}

impl SubscriptionTarget {
    fn matches(&self, device: Option<&str>) -> bool {
        match (self, device) {
            (SubscriptionTarget::OwnDevice, None) => true,
            (SubscriptionTarget::AnyDevice, Some(_)) => true,
            (SubscriptionTarget::Device(name), Some(device)) => name == device,
            _ => false,
        }
    }
}

/// Which keys of a notification a subscription cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeScope {
    All,
    Key(String),
}

impl AttributeScope {
    fn matches(&self, update: &AttributeUpdate) -> bool {
        match self {
            AttributeScope::All => true,
            AttributeScope::Key(key) => update.data.get(key).is_some(),
        }
    }
}

/// One registered attribute callback.
pub struct AttributeSubscription {
    pub id: u32,
    pub target: SubscriptionTarget,
    pub scope: AttributeScope,
    callback: AttributeCallback,
}

impl fmt::Debug for AttributeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeSubscription")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Subscription id → callback table for attribute notifications.
pub struct AttributeSubscriptionRegistry {
    next_id: AtomicU32,
    subscriptions: Arc<RwLock<HashMap<u32, AttributeSubscription>>>,
}

impl Default for AttributeSubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeSubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a callback and returns its subscription id. Ids are never reused.
    pub async fn subscribe(
        &self,
        target: SubscriptionTarget,
        scope: AttributeScope,
        callback: AttributeCallback,
    ) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscription = AttributeSubscription {
            id,
            target: target.clone(),
            scope: scope.clone(),
            callback,
        };

        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(id, subscription);

        info!("Attribute subscription {} registered for {:?} ({:?})", id, target, scope);
        id
    }

    /// Removes exactly one subscription. Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: u32) -> bool {
        let removed = self.subscriptions.write().await.remove(&id).is_some();
        if removed {
            info!("Attribute subscription {} removed", id);
        } else {
            debug!("Attribute subscription {} not found, nothing to remove", id);
        }
        removed
    }

    /// Drops every subscription bound to `device`, returning their ids.
    pub async fn remove_device(&self, device: &str) -> Vec<u32> {
        let mut subscriptions = self.subscriptions.write().await;
        let ids: Vec<u32> = subscriptions
            .values()
            .filter(|s| s.target == SubscriptionTarget::Device(device.to_string()))
            .map(|s| s.id)
            .collect();
        for id in &ids {
            subscriptions.remove(id);
        }
        ids
    }

    /// Invokes every matching callback outside the lock; returns how many ran.
    pub async fn dispatch(&self, update: &AttributeUpdate) -> usize {
        let mut matching: Vec<(u32, AttributeCallback)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .values()
                .filter(|s| s.target.matches(update.device.as_deref()) && s.scope.matches(update))
                .map(|s| (s.id, s.callback.clone()))
                .collect()
        };
        matching.sort_by_key(|(id, _)| *id);

        for (_, callback) in &matching {
            callback(update);
        }

        debug!("Attribute update for {:?} delivered to {} subscriptions", update.device, matching.len());
        matching.len()
    }

    pub async fn count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn contains(&self, id: u32) -> bool {
        self.subscriptions.read().await.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback() -> (AttributeCallback, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = counter.clone();
        let callback: AttributeCallback = Arc::new(move |_: &AttributeUpdate| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (callback, counter)
    }

    fn update(device: Option<&str>, data: serde_json::Value) -> AttributeUpdate {
        AttributeUpdate { device: device.map(str::to_string), data }
    }

    #[tokio::test]
    async fn test_scopes_are_matched() {
        let registry = AttributeSubscriptionRegistry::new();
        let (everything, everything_count) = counting_callback();
        let (image_key, image_count) = counting_callback();
        let (own, own_count) = counting_callback();

        registry.subscribe(SubscriptionTarget::AnyDevice, AttributeScope::All, everything).await;
        registry
            .subscribe(SubscriptionTarget::Device("ImageTest".into()), AttributeScope::Key("image".into()), image_key)
            .await;
        registry.subscribe(SubscriptionTarget::OwnDevice, AttributeScope::All, own).await;

        registry.dispatch(&update(Some("ImageTest"), json!({"image": "v2"}))).await;
        registry.dispatch(&update(Some("ImageTest"), json!({"other": 1}))).await;
        registry.dispatch(&update(Some("Other"), json!({"image": "v3"}))).await;
        registry.dispatch(&update(None, json!({"image": "v4"}))).await;

        assert_eq!(everything_count.load(Ordering::SeqCst), 3);
        assert_eq!(image_count.load(Ordering::SeqCst), 1);
        assert_eq!(own_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_exactly_one() {
        let registry = AttributeSubscriptionRegistry::new();
        let (first, first_count) = counting_callback();
        let (second, second_count) = counting_callback();

        let device = SubscriptionTarget::Device("ImageTest".into());
        let first_id = registry.subscribe(device.clone(), AttributeScope::All, first).await;
        let second_id = registry.subscribe(device, AttributeScope::All, second).await;
        assert_ne!(first_id, second_id);

        assert!(registry.unsubscribe(second_id).await);
        assert!(!registry.unsubscribe(second_id).await);

        registry.dispatch(&update(Some("ImageTest"), json!({"image": 1}))).await;
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_device() {
        let registry = AttributeSubscriptionRegistry::new();
        let (callback, _) = counting_callback();

        let a = registry.subscribe(SubscriptionTarget::Device("A".into()), AttributeScope::All, callback.clone()).await;
        let b = registry.subscribe(SubscriptionTarget::Device("B".into()), AttributeScope::All, callback).await;

        assert_eq!(registry.remove_device("A").await, vec![a]);
        assert!(!registry.contains(a).await);
        assert!(registry.contains(b).await);
        assert!(!registry.unsubscribe(a).await);
    }
}
