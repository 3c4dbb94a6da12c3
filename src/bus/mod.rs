//! Publish/subscribe core with journaling.
//!
//! Every inter-component message in the process goes through the
//! [`EventBus`]. Publishing journals the event synchronously, then fans
//! out to all matching handlers concurrently; a failing handler never
//! affects its siblings or future publishes. Subjects are matched either
//! exactly or through precompiled glob patterns.

pub mod event;
pub mod journal;
pub mod pattern;
pub mod topics;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::error::Result;

pub use event::Event;
pub use journal::{Journal, JournalEntry, MemoryJournal, JOURNAL_CAP};
pub use pattern::Pattern;

/// Grace period handlers get to finish during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// An asynchronous event handler registered on the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Identity used when logging handler failures.
    fn name(&self) -> &str;

    async fn handle(&self, event: Event) -> Result<()>;
}

struct FnHandler {
    name: String,
    f: Box<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Event) -> Result<()> {
        (self.f)(event).await
    }
}

/// Wrap an async closure into a named handler.
pub fn handler<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f: Box::new(move |event| Box::pin(f(event))),
    })
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

struct Entry {
    token: SubscriptionToken,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Registry {
    /// Exact-subject subscriptions, looked up first.
    exact: HashMap<String, Vec<Entry>>,
    /// Wildcard subscriptions, evaluated against every published subject.
    globs: Vec<(Pattern, Entry)>,
}

struct InFlight {
    count: AtomicUsize,
    done: Notify,
}

struct FlightGuard(Arc<InFlight>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.count.fetch_sub(1, Ordering::SeqCst);
        self.0.done.notify_waiters();
    }
}

/// The process-wide pub/sub bus. Constructed once in the composition
/// root with an injectable journal and shared by reference everywhere.
pub struct EventBus {
    registry: RwLock<Registry>,
    journal: Arc<dyn Journal>,
    next_token: AtomicU64,
    closed: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl EventBus {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            journal,
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            in_flight: Arc::new(InFlight {
                count: AtomicUsize::new(0),
                done: Notify::new(),
            }),
        }
    }

    /// Register a handler for an exact subject or a glob pattern.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let entry = Entry { token, handler };
        let mut registry = self.registry.write();
        if Pattern::is_wildcard(pattern) {
            registry.globs.push((Pattern::compile(pattern), entry));
        } else {
            registry.exact.entry(pattern.to_string()).or_default().push(entry);
        }
        token
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut registry = self.registry.write();
        for entries in registry.exact.values_mut() {
            entries.retain(|e| e.token != token);
        }
        registry.exact.retain(|_, entries| !entries.is_empty());
        registry.globs.retain(|(_, e)| e.token != token);
    }

    /// Journal the event and schedule every matching handler. Returns
    /// immediately; handlers run concurrently on the runtime. Journal
    /// failures are logged and never propagated.
    pub fn publish(&self, event: Event) {
        if self.closed.load(Ordering::SeqCst) {
            warn!(subject = %event.subject, "event dropped, bus is shut down");
            return;
        }

        if let Err(e) = self.journal.append(JournalEntry::from_event(&event)) {
            warn!(subject = %event.subject, error = %e, "journal append failed");
        }

        let handlers = self.matching_handlers(&event.subject);
        for handler in handlers {
            self.in_flight.count.fetch_add(1, Ordering::SeqCst);
            let guard = FlightGuard(Arc::clone(&self.in_flight));
            let event = event.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let subject = event.subject.clone();
                if let Err(e) = handler.handle(event).await {
                    error!(
                        subject = %subject,
                        handler = %handler.name(),
                        error = %e,
                        "event handler failed"
                    );
                }
            });
        }
    }

    /// Build and publish a typed payload in one step.
    pub fn emit<T: serde::Serialize>(&self, subject: &str, payload: &T) {
        match Event::encode(subject, payload) {
            Ok(event) => self.publish(event),
            Err(e) => warn!(subject, error = %e, "failed to encode event payload"),
        }
    }

    /// The last `limit` journal entries, newest first.
    pub fn query_recent(&self, limit: usize) -> Vec<JournalEntry> {
        match self.journal.recent(limit) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "journal read failed");
                Vec::new()
            }
        }
    }

    /// Stop accepting events and wait for in-flight handlers, up to the
    /// grace period. Stragglers are abandoned with a warning.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.in_flight.count.load(Ordering::SeqCst);
            if remaining == 0 {
                return;
            }
            let notified = self.in_flight.done.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(remaining, "abandoning in-flight event handlers after grace period");
                return;
            }
        }
    }

    fn matching_handlers(&self, subject: &str) -> Vec<Arc<dyn EventHandler>> {
        let registry = self.registry.read();
        let mut handlers = Vec::new();
        if let Some(entries) = registry.exact.get(subject) {
            handlers.extend(entries.iter().map(|e| Arc::clone(&e.handler)));
        }
        for (pattern, entry) in &registry.globs {
            if pattern.matches(subject) {
                handlers.push(Arc::clone(&entry.handler));
            }
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryJournal::new()))
    }

    fn counting_handler(name: &str, tx: mpsc::UnboundedSender<String>) -> Arc<dyn EventHandler> {
        let name_owned = name.to_string();
        handler(name, move |event: Event| {
            let tx = tx.clone();
            let name = name_owned.clone();
            async move {
                tx.send(format!("{name}:{}", event.subject)).ok();
                Ok(())
            }
        })
    }

    async fn recv_n(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let msg = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for handler")
                .expect("channel closed");
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(
            "t.x",
            handler("bad", |_| async { Err(crate::error::Error::Execution("boom".into())) }),
        );
        bus.subscribe("t.x", counting_handler("a", tx.clone()));
        bus.subscribe("t.*", counting_handler("b", tx.clone()));

        bus.publish(Event::new("t.x", json!({})));

        let mut got = recv_n(&mut rx, 2).await;
        got.sort();
        assert_eq!(got, vec!["a:t.x", "b:t.x"]);
    }

    #[tokio::test]
    async fn wildcard_and_exact_subscriptions_both_fire() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("pm.account.loaded", counting_handler("exact", tx.clone()));
        bus.subscribe("pm.*", counting_handler("glob", tx.clone()));

        bus.publish(Event::new("pm.account.loaded", json!({})));
        let mut got = recv_n(&mut rx, 2).await;
        got.sort();
        assert_eq!(got, vec!["exact:pm.account.loaded", "glob:pm.account.loaded"]);
    }

    #[tokio::test]
    async fn duplicate_subscription_is_invoked_twice() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let h = counting_handler("dup", tx.clone());
        bus.subscribe("t.x", Arc::clone(&h));
        bus.subscribe("t.x", h);

        bus.publish(Event::new("t.x", json!({})));
        assert_eq!(recv_n(&mut rx, 2).await.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = bus.subscribe("t.*", counting_handler("gone", tx.clone()));
        bus.subscribe("t.x", counting_handler("kept", tx.clone()));
        bus.unsubscribe(token);

        bus.publish(Event::new("t.x", json!({})));
        let got = recv_n(&mut rx, 1).await;
        assert_eq!(got, vec!["kept:t.x"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn journal_preserves_publish_order() {
        let bus = bus();
        for i in 0..5 {
            bus.publish(Event::new("t.seq", json!({ "i": i })));
        }
        let recent = bus.query_recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].data, json!({ "i": 4 }).to_string());
        assert_eq!(recent[4].data, json!({ "i": 0 }).to_string());
    }

    #[tokio::test]
    async fn shutdown_drops_new_events() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("t.x", counting_handler("late", tx.clone()));

        bus.shutdown(Duration::from_millis(100)).await;
        bus.publish(Event::new("t.x", json!({})));

        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        // Dropped events are not journaled either.
        assert!(bus.query_recent(10).is_empty());
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handlers() {
        let bus = Arc::new(bus());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            "t.slow",
            handler("slow", move |_| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    tx.send("done".to_string()).ok();
                    Ok(())
                }
            }),
        );
        bus.publish(Event::new("t.slow", json!({})));
        bus.shutdown(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), "done");
    }
}
