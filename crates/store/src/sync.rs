//! Cross-client favorites sync over a named broadcast channel.
//!
//! Messages always carry the full set, never a delta, so a lost or reordered message
//! is corrected by the next one. Each catalog's favorites travel on their own channel.

use serde::{Deserialize, Serialize};
use tally_core::Catalog;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const FAVORITES_CHANNEL: &str = "favorites";
pub const CPU_FAVORITES_CHANNEL: &str = "cpu-favorites";
pub const MODEL_FAVORITES_CHANNEL: &str = "model-favorites";

pub fn favorites_channel(catalog: Catalog) -> &'static str {
    match catalog {
        Catalog::Gpu => FAVORITES_CHANNEL,
        Catalog::Cpu => CPU_FAVORITES_CHANNEL,
        Catalog::Model => MODEL_FAVORITES_CHANNEL,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BroadcastMessage {
    Updated { favorites: Vec<String>, source: String },
}

impl BroadcastMessage {
    pub fn updated(favorites: Vec<String>, source: &str) -> Self {
        BroadcastMessage::Updated { favorites, source: source.to_string() }
    }

    pub fn source(&self) -> &str {
        match self {
            BroadcastMessage::Updated { source, .. } => source,
        }
    }
}

pub type Handler = Box<dyn Fn(BroadcastMessage) + Send + Sync + 'static>;

/// A live subscription. Dropping it, or calling `unsubscribe`, stops delivery.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) { self.stop(); }

    fn stop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.stop(); }
}

pub trait SyncChannel: Send + Sync {
    fn name(&self) -> &str;
    fn publish(&self, msg: &BroadcastMessage);
    fn subscribe(&self, handler: Handler) -> Subscription;
}

/// In-process bus. Payloads travel as JSON, as they would between browser tabs.
/// Delivery is at most once; a lagging receiver skips what it missed.
#[derive(Clone)]
pub struct LocalBus {
    name: String,
    tx: broadcast::Sender<String>,
}

impl LocalBus {
    pub fn new(name: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { name: name.to_string(), tx }
    }

    pub fn favorites(catalog: Catalog) -> Self { Self::new(favorites_channel(catalog), 64) }
}

impl SyncChannel for LocalBus {
    fn name(&self) -> &str { &self.name }

    fn publish(&self, msg: &BroadcastMessage) {
        match serde_json::to_string(msg) {
            // no receivers is fine
            Ok(payload) => { let _ = self.tx.send(payload); }
            Err(e) => warn!(channel = %self.name, error = %e, "sync: encode failed"),
        }
    }

    fn subscribe(&self, handler: Handler) -> Subscription {
        let mut rx = self.tx.subscribe();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => match serde_json::from_str::<BroadcastMessage>(&payload) {
                        Ok(msg) => handler(msg),
                        Err(e) => warn!(channel = %name, error = %e, "sync: dropping malformed message"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(channel = %name, skipped = n, "sync: receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task: Some(task) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn wire_shape() {
        let m = BroadcastMessage::updated(vec!["a".into()], "tab-1");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v, serde_json::json!({"type": "updated", "favorites": ["a"], "source": "tab-1"}));
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let bus = LocalBus::favorites(Catalog::Gpu);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s2 = seen.clone();
        let sub = bus.subscribe(Box::new(move |m| s2.lock().unwrap().push(m)));
        bus.publish(&BroadcastMessage::updated(vec!["a".into()], "x"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(sub);
        tokio::task::yield_now().await;
        bus.publish(&BroadcastMessage::updated(vec!["b".into()], "x"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn every_catalog_has_its_own_channel() {
        let names: Vec<String> = Catalog::ALL.iter().map(|c| LocalBus::favorites(*c).name().to_string()).collect();
        assert_eq!(names, vec!["favorites", "cpu-favorites", "model-favorites"]);
    }
}
