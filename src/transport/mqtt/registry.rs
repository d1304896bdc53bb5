//! Handler registry: subscription pattern to message handler
//!
//! Subscriptions are kept in registration order. Resolution prefers an entry
//! whose pattern is textually identical to the topic, then the earliest
//! registered wildcard pattern that matches.

use super::dispatcher::MessageHandler;
use super::topic;
use std::sync::{Arc, PoisonError, RwLock};

struct Subscription {
    pattern: String,
    handler: Arc<dyn MessageHandler>,
}

/// A handler chosen for a concrete topic
#[derive(Clone)]
pub struct ResolvedHandler {
    /// Pattern the handler was registered under
    pub pattern: String,
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for ResolvedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedHandler")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Thread-safe pattern to handler map
///
/// Lookups and mutations are serialized by a reader/writer lock, so a
/// resolver never observes a half-applied registration.
#[derive(Default)]
pub struct HandlerRegistry {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.patterns())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`, returning the handler it replaced
    ///
    /// Re-registering a pattern swaps the handler but keeps the original
    /// position in the resolution order.
    pub fn register(
        &self,
        pattern: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let pattern = pattern.into();
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = subscriptions.iter_mut().find(|s| s.pattern == pattern) {
            return Some(std::mem::replace(&mut existing.handler, handler));
        }
        subscriptions.push(Subscription { pattern, handler });
        None
    }

    /// Remove the handler for `pattern`
    pub fn unregister(&self, pattern: &str) -> Option<Arc<dyn MessageHandler>> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let index = subscriptions.iter().position(|s| s.pattern == pattern)?;
        Some(subscriptions.remove(index).handler)
    }

    /// Find the handler for a concrete topic
    pub fn resolve(&self, topic: &str) -> Option<ResolvedHandler> {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        subscriptions
            .iter()
            .find(|s| s.pattern == topic)
            .or_else(|| {
                subscriptions
                    .iter()
                    .find(|s| topic::matches(&s.pattern, topic))
            })
            .map(|s| ResolvedHandler {
                pattern: s.pattern.clone(),
                handler: Arc::clone(&s.handler),
            })
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s.pattern == pattern)
    }

    /// Registered patterns in resolution order
    pub fn patterns(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.pattern.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::dispatcher::{handler_fn, InboundMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn(|_| {})
    }

    fn resolved_pattern(registry: &HandlerRegistry, topic: &str) -> Option<String> {
        registry.resolve(topic).map(|r| r.pattern)
    }

    #[test]
    fn test_exact_match_wins_over_wildcard() {
        let registry = HandlerRegistry::new();
        registry.register("devices/+/data", noop());
        registry.register("devices/dev-1/data", noop());

        assert_eq!(
            resolved_pattern(&registry, "devices/dev-1/data").as_deref(),
            Some("devices/dev-1/data")
        );
        assert_eq!(
            resolved_pattern(&registry, "devices/dev-2/data").as_deref(),
            Some("devices/+/data")
        );
    }

    #[test]
    fn test_wildcards_resolve_in_registration_order() {
        let registry = HandlerRegistry::new();
        registry.register("devices/+/status", noop());
        registry.register("devices/#", noop());

        assert_eq!(
            resolved_pattern(&registry, "devices/dev-1/status").as_deref(),
            Some("devices/+/status")
        );
        assert_eq!(
            resolved_pattern(&registry, "devices/dev-1/config").as_deref(),
            Some("devices/#")
        );

        let reversed = HandlerRegistry::new();
        reversed.register("devices/#", noop());
        reversed.register("devices/+/status", noop());
        assert_eq!(
            resolved_pattern(&reversed, "devices/dev-1/status").as_deref(),
            Some("devices/#")
        );
    }

    #[tokio::test]
    async fn test_register_replaces_handler_in_place() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        registry.register("a/#", noop());
        registry.register("a/+", noop());
        let previous = registry.register(
            "a/#",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(previous.is_some());
        assert_eq!(registry.patterns(), vec!["a/#", "a/+"]);

        let resolved = registry.resolve("a/b").unwrap();
        assert_eq!(resolved.pattern, "a/#");
        resolved
            .handler
            .handle(&InboundMessage::new("a/b", b"x".to_vec()))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = HandlerRegistry::new();
        registry.register("devices/+/data", noop());
        assert!(registry.contains("devices/+/data"));

        assert!(registry.unregister("devices/+/data").is_some());
        assert!(registry.unregister("devices/+/data").is_none());
        assert!(registry.resolve("devices/dev-1/data").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_no_handler() {
        let registry = HandlerRegistry::new();
        registry.register("devices/+/data", noop());
        assert!(registry.resolve("sensors/dev-1/data").is_none());
    }

    #[test]
    fn test_concurrent_registration_and_resolution() {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("devices/#", noop());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for n in 0..100 {
                        let pattern = format!("devices/w{i}-{n}/data");
                        registry.register(pattern.clone(), noop());
                        registry.unregister(&pattern);
                    }
                })
            })
            .collect();

        for _ in 0..400 {
            assert!(registry.resolve("devices/x/data").is_some());
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(registry.len(), 1);
    }
}
