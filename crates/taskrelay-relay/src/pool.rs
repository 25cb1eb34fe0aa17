//! Relay pool: one link per relay URL, multiplexed across all scopes.
//!
//! The pool fans subscriptions and publishes out to the relays each caller
//! names. Inbound frames from every link funnel into a single dispatcher task
//! that routes them to the owning [`Subscription`] by subscription id.
//! Duplicate deliveries of the same event by several relays are passed
//! through untouched; suppressing them is the merge engine's job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use taskrelay_protocol::{ClientMessage, Event, Filter, RelayMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::link::{Inbound, LinkStatus, RelayConfig, RelayLink};

/// What a subscription observes.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A relay delivered an event for this subscription.
    Event { event: Box<Event>, relay_url: String },
    /// A relay finished sending stored events.
    Eose { relay_url: String },
    /// A relay ended the subscription on its side.
    Closed { relay_url: String, message: String },
}

struct SubscriptionEntry {
    relays: Vec<String>,
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
}

struct PoolInner {
    config: RelayConfig,
    links: Mutex<HashMap<String, RelayLink>>,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionEntry>>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    dispatcher: JoinHandle<()>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Shared handle to the relay pool.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create an empty pool. Must be called inside a tokio runtime.
    pub fn new(config: RelayConfig) -> Self {
        let (inbound, rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch(rx, Arc::clone(&subscriptions)));
        Self {
            inner: Arc::new(PoolInner {
                config,
                links: Mutex::new(HashMap::new()),
                subscriptions,
                inbound,
                dispatcher,
            }),
        }
    }

    /// Make the open link set exactly `urls`.
    ///
    /// New URLs get a link (with every subscription that names them
    /// registered); links for URLs no longer listed are closed and forgotten.
    pub fn set_relays<I, S>(&self, urls: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let wanted: Vec<String> = urls
            .into_iter()
            .map(|url| normalize_url(url.as_ref()))
            .collect::<Result<_>>()?;

        let mut links = lock(&self.inner.links);
        links.retain(|url, link| {
            let keep = wanted.contains(url);
            if !keep {
                info!("Closing relay link {}", url);
                link.close();
            }
            keep
        });
        for url in wanted {
            self.link_for(&mut links, &url);
        }
        Ok(())
    }

    /// URLs with a link in the pool.
    pub fn relays(&self) -> Vec<String> {
        let mut urls: Vec<String> = lock(&self.inner.links).keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Connection status of one relay, if it is in the pool.
    pub fn status(&self, url: &str) -> Option<LinkStatus> {
        let url = normalize_url(url).ok()?;
        lock(&self.inner.links).get(&url).map(RelayLink::status)
    }

    /// Subscribe on every listed relay.
    pub fn subscribe(&self, relay_urls: &[String], filters: Vec<Filter>) -> Result<Subscription> {
        let relays: Vec<String> = relay_urls
            .iter()
            .map(|url| normalize_url(url))
            .collect::<Result<_>>()?;
        if relays.is_empty() {
            return Err(Error::NoRelays);
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.subscriptions).insert(
            id.clone(),
            SubscriptionEntry {
                relays: relays.clone(),
                filters: filters.clone(),
                sender,
            },
        );

        let mut links = lock(&self.inner.links);
        for url in &relays {
            let fresh = !links.get(url).map(RelayLink::is_alive).unwrap_or(false);
            let link = self.link_for(&mut links, url);
            if fresh {
                // a new link registers every subscription naming it
                continue;
            }
            if link.subscribe(&id, filters.clone()).is_err() {
                // Dead task: respawn, which re-registers this subscription.
                links.remove(url);
                self.link_for(&mut links, url);
            }
        }
        debug!("Subscription {} opened on {} relays", id, relays.len());

        Ok(Subscription {
            id,
            receiver,
            pool: self.clone(),
            closed: false,
        })
    }

    /// Best-effort `EVENT` fan-out. Returns how many links took the frame.
    ///
    /// Success means the frame was accepted locally, not that a relay
    /// stored it.
    pub fn publish(&self, relay_urls: &[String], event: &Event) -> Result<usize> {
        if relay_urls.is_empty() {
            return Err(Error::NoRelays);
        }
        let message = ClientMessage::Event(event.clone());
        let mut links = lock(&self.inner.links);
        let mut accepted = 0;
        for url in relay_urls {
            let url = normalize_url(url)?;
            let link = self.link_for(&mut links, &url);
            match link.send(&message) {
                Ok(()) => accepted += 1,
                Err(Error::LinkClosed(_)) => {
                    links.remove(&url);
                    if self.link_for(&mut links, &url).send(&message).is_ok() {
                        accepted += 1;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        trace!("Event {} handed to {} relays", event.id, accepted);
        Ok(accepted)
    }

    /// Close every link and drop all subscriptions.
    pub fn shutdown(&self) {
        let mut links = lock(&self.inner.links);
        for link in links.values() {
            link.close();
        }
        links.clear();
        lock(&self.inner.subscriptions).clear();
    }

    fn unsubscribe(&self, id: &str) {
        let entry = lock(&self.inner.subscriptions).remove(id);
        if let Some(entry) = entry {
            let links = lock(&self.inner.links);
            for url in &entry.relays {
                if let Some(link) = links.get(url) {
                    link.unsubscribe(id);
                }
            }
            debug!("Subscription {} closed", id);
        }
    }

    fn link_for<'a>(
        &self,
        links: &'a mut HashMap<String, RelayLink>,
        url: &str,
    ) -> &'a RelayLink {
        if links.get(url).map(RelayLink::is_alive) == Some(false) {
            links.remove(url);
        }
        links.entry(url.to_string()).or_insert_with(|| {
            info!("Opening relay link {}", url);
            let link = RelayLink::spawn(url, self.inner.config.clone(), self.inner.inbound.clone());
            let subscriptions = lock(&self.inner.subscriptions);
            for (id, entry) in subscriptions.iter() {
                if entry.relays.iter().any(|relay| relay == url) {
                    let _ = link.subscribe(id, entry.filters.clone());
                }
            }
            link
        })
    }
}

/// Inbound side of a pool subscription.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) stops delivery and
/// sends `CLOSE` to its relays. Publishes are never affected.
pub struct Subscription {
    id: String,
    receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
    pool: RelayPool,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event; `None` once unsubscribed or the pool is gone.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.pool.unsubscribe(&self.id);
            self.receiver.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionEntry>>>,
) {
    while let Some(Inbound { relay_url, message }) = rx.recv().await {
        let (subscription_id, event) = match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => (
                subscription_id,
                SubscriptionEvent::Event {
                    event,
                    relay_url,
                },
            ),
            RelayMessage::Eose(subscription_id) => {
                (subscription_id, SubscriptionEvent::Eose { relay_url })
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => (
                subscription_id,
                SubscriptionEvent::Closed { relay_url, message },
            ),
            RelayMessage::Ok { .. } | RelayMessage::Notice(_) => continue,
        };

        let subscriptions = lock(&subscriptions);
        match subscriptions.get(&subscription_id) {
            Some(entry) => {
                let _ = entry.sender.send(event);
            }
            None => trace!("Frame for unknown subscription {}", subscription_id),
        }
    }
}

fn normalize_url(url: &str) -> Result<String> {
    let url = url.trim();
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    Ok(url.trim_end_matches('/').to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use taskrelay_protocol::{Identity, UnsignedEvent, KIND_ENTITY};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    fn fast_config() -> RelayConfig {
        RelayConfig {
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            max_queued: 16,
        }
    }

    fn sample_event() -> Event {
        UnsignedEvent::new(KIND_ENTITY, "{}")
            .tag("d", "task-1")
            .sign(&Identity::generate(), 100)
            .unwrap()
    }

    /// Relay that answers every REQ with one stored event and EOSE, and
    /// forwards every received text frame to `frames`.
    async fn spawn_relay(
        stored: Event,
        frames: mpsc::UnboundedSender<String>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let stored = stored.clone();
                let frames = frames.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let _ = frames.send(text.clone());
                        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                        if frame[0] == "REQ" {
                            let sub = frame[1].as_str().unwrap().to_string();
                            let event = serde_json::to_value(&stored).unwrap();
                            let reply = serde_json::json!(["EVENT", sub, event]).to_string();
                            ws.send(Message::Text(reply)).await.unwrap();
                            let eose = serde_json::json!(["EOSE", sub]).to_string();
                            ws.send(Message::Text(eose)).await.unwrap();
                        }
                    }
                });
            }
        });
        format!("ws://{}", addr)
    }

    #[test]
    fn url_normalization() {
        assert_eq!(normalize_url("wss://relay.example/").unwrap(), "wss://relay.example");
        assert!(normalize_url("https://relay.example").is_err());
    }

    #[tokio::test]
    async fn publish_reaches_relay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let url = spawn_relay(sample_event(), tx).await;
        let pool = RelayPool::new(fast_config());

        let event = sample_event();
        let accepted = pool.publish(&[url], &event).unwrap();
        assert_eq!(accepted, 1);

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed[0], "EVENT");
        assert_eq!(parsed[1]["id"], event.id.as_str());
    }

    #[tokio::test]
    async fn duplicate_deliveries_are_not_suppressed() {
        let stored = sample_event();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = spawn_relay(stored.clone(), tx.clone()).await;
        let second = spawn_relay(stored.clone(), tx).await;

        let pool = RelayPool::new(fast_config());
        pool.set_relays([&first, &second]).unwrap();
        let mut sub = pool
            .subscribe(&[first.clone(), second.clone()], vec![Filter::new().kinds([KIND_ENTITY])])
            .unwrap();

        let mut events = Vec::new();
        let mut eose = 0;
        while events.len() < 2 || eose < 2 {
            match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap() {
                Some(SubscriptionEvent::Event { event, relay_url }) => {
                    events.push((event.id.clone(), relay_url))
                }
                Some(SubscriptionEvent::Eose { .. }) => eose += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(events.iter().all(|(id, _)| *id == stored.id));
        assert_ne!(events[0].1, events[1].1);
    }

    #[tokio::test]
    async fn subscription_replayed_after_reconnect() {
        // First connection is dropped right after the REQ; the second must
        // see the same subscription id again.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            for round in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(Message::Text(text))) = ws.next().await {
                    let _ = tx.send(text);
                }
                if round == 0 {
                    let _ = ws.close(None).await;
                } else {
                    // keep the second connection open
                    while ws.next().await.is_some() {}
                }
            }
        });

        let pool = RelayPool::new(fast_config());
        let sub = pool
            .subscribe(&[url], vec![Filter::new().kinds([KIND_ENTITY])])
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let first: serde_json::Value = serde_json::from_str(&first).unwrap();
        let second: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(first[0], "REQ");
        assert_eq!(second[0], "REQ");
        assert_eq!(first[1], sub.id());
        assert_eq!(second[1], sub.id());
    }

    #[tokio::test]
    async fn publish_while_down_is_flushed_on_connect() {
        // Reserve a port, release it, publish, then start the relay there.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let pool = RelayPool::new(fast_config());
        let event = sample_event();
        pool.publish(&[format!("ws://{}", addr)], &event).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("unexpected {other:?}"),
        };
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed[1]["id"], event.id.as_str());
    }

    #[tokio::test]
    async fn set_relays_drops_unwanted_links() {
        let pool = RelayPool::new(fast_config());
        pool.set_relays(["ws://127.0.0.1:1", "ws://127.0.0.1:2"]).unwrap();
        assert_eq!(pool.relays().len(), 2);

        pool.set_relays(["ws://127.0.0.1:2"]).unwrap();
        assert_eq!(pool.relays(), vec!["ws://127.0.0.1:2".to_string()]);
        assert!(pool.set_relays(["http://nope"]).is_err());
    }

    #[tokio::test]
    async fn empty_relay_list_is_an_error() {
        let pool = RelayPool::new(fast_config());
        assert!(matches!(pool.publish(&[], &sample_event()), Err(Error::NoRelays)));
        assert!(matches!(pool.subscribe(&[], vec![]), Err(Error::NoRelays)));
    }

    #[tokio::test]
    async fn unsubscribed_frames_are_not_delivered() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let url = spawn_relay(sample_event(), tx).await;
        let pool = RelayPool::new(fast_config());
        let sub = pool.subscribe(&[url], vec![Filter::new()]).unwrap();
        let id = sub.id().to_string();
        sub.unsubscribe();
        assert!(!lock(&pool.inner.subscriptions).contains_key(&id));
    }
}
