//! C5 — Routing Engine: forwards matching messages across queues within
//! a domain (spec §4.5).
//!
//! Grounded on the teacher's `RootActor::publish` fan-out over a radix
//! tree (`brokers/pub-sub/actor.rs`) for the general publish-then-forward
//! shape; the per-message visited-queue cycle guard has no teacher
//! analogue (the teacher's pub/sub has no rule chaining) and is built
//! directly from the spec's invariant.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::message::Message;
use crate::queue::QueueDirectory;
use crate::routing::predicate::Predicate;

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub destination: String,
    pub predicate: Predicate,
}

pub struct RoutingEngine {
    rules: DashMap<(String, String), Vec<RoutingRule>>,
    queues: QueueDirectory,
    max_hops: usize,
}

impl RoutingEngine {
    pub fn new(queues: QueueDirectory, max_hops: usize) -> Self {
        Self {
            rules: DashMap::new(),
            queues,
            max_hops,
        }
    }

    /// Installs a rule forwarding matches from `source` to `destination`
    /// within `domain`. Predicate construction is validated by the caller
    /// at deserialization time — a malformed predicate never reaches
    /// here, satisfying "a malformed predicate fails rule installation,
    /// not message publish" (spec §4.5) one layer up.
    pub fn install_rule(&self, domain: &str, source: &str, destination: &str, predicate: Predicate) {
        self.rules
            .entry((domain.to_string(), source.to_string()))
            .or_default()
            .push(RoutingRule {
                destination: destination.to_string(),
                predicate,
            });
    }

    pub fn remove_routes_for_queue(&self, domain: &str, queue: &str) {
        self.rules.remove(&(domain.to_string(), queue.to_string()));
        for mut entry in self.rules.iter_mut() {
            if entry.key().0 == domain {
                entry.value_mut().retain(|rule| rule.destination != queue);
            }
        }
    }

    pub fn remove_routes_for_domain(&self, domain: &str) {
        self.rules.retain(|key, _| key.0 != domain);
    }

    /// Evaluates every rule whose source is `queue`, internally
    /// re-publishing matches to their destination and recursing there.
    /// Call after the message has already been accepted into `queue`.
    pub async fn route(&self, domain: &str, queue: &str, message: &Message) {
        let mut visited = HashSet::new();
        visited.insert(queue.to_string());

        let mut frontier: VecDeque<(String, Message)> = VecDeque::new();
        frontier.push_back((queue.to_string(), message.clone()));
        let mut hops = 0usize;

        while let Some((current, msg)) = frontier.pop_front() {
            let Some(rules) = self
                .rules
                .get(&(domain.to_string(), current.clone()))
                .map(|entry| entry.value().clone())
            else {
                continue;
            };

            for rule in rules {
                if hops >= self.max_hops {
                    warn!(domain, "routing max hops exceeded, aborting remaining propagation");
                    return;
                }
                hops += 1;

                if !rule.predicate.evaluate(&msg) {
                    continue;
                }
                if visited.contains(&rule.destination) {
                    debug!(domain, source = %current, destination = %rule.destination, "routing cycle detected, skipping");
                    continue;
                }

                let Some(handle) = self
                    .queues
                    .get(&(domain.to_string(), rule.destination.clone()))
                    .map(|entry| entry.value().clone())
                else {
                    continue;
                };

                if handle.enqueue(msg.clone()).await.is_ok() {
                    visited.insert(rule.destination.clone());
                    frontier.push_back((rule.destination.clone(), msg.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::Cancellation;
    use crate::config::{BreakerDefaults, QueueDefaults, RetryDefaults};
    use crate::message::PredicateValue;
    use crate::queue::{self, QueueConfig};
    use crate::repository::MessageRepository;
    use crate::routing::predicate::Operator;
    use bytes::Bytes;
    use std::collections::HashMap as Map;

    fn spawn_queue(repository: &Arc<MessageRepository>, domain: &str, name: &str) -> queue::QueueHandle {
        let d = QueueDefaults::default();
        let cfg = QueueConfig {
            persistent: false,
            max_size: 0,
            ttl_ms: 0,
            worker_count: 2,
            enqueue_wait: d.enqueue_wait,
            stop_grace: d.stop_grace,
            retry: RetryDefaults::default(),
            breaker: BreakerDefaults::default(),
        };
        let (failures, _) = tokio::sync::broadcast::channel(16);
        queue::spawn(domain.to_string(), name.to_string(), cfg, Arc::clone(repository), Cancellation::root(), failures)
    }

    #[tokio::test]
    async fn scenario_s5_eq_predicate_routes_matching_only() {
        let repository = Arc::new(MessageRepository::new());
        let queues: QueueDirectory = Arc::new(DashMap::new());
        queues.insert(("D".into(), "in".into()), spawn_queue(&repository, "D", "in"));
        let out_handle = spawn_queue(&repository, "D", "out");
        queues.insert(("D".into(), "out".into()), out_handle.clone());

        let engine = RoutingEngine::new(Arc::clone(&queues), 64);
        engine.install_rule(
            "D",
            "in",
            "out",
            Predicate::new(Operator::Eq, "priority", PredicateValue::String("high".into())),
        );

        let mut meta = Map::new();
        meta.insert("priority".to_string(), serde_json::Value::String("high".into()));
        let high = Message::new("t", Bytes::from_static(b"{}")).with_metadata(meta);
        engine.route("D", "in", &high).await;

        let mut meta_low = Map::new();
        meta_low.insert("priority".to_string(), serde_json::Value::String("low".into()));
        let low = Message::new("t", Bytes::from_static(b"{}")).with_metadata(meta_low);
        engine.route("D", "in", &low).await;

        assert_eq!(out_handle.stats().await.unwrap().len, 1);
    }

    #[tokio::test]
    async fn cycle_is_skipped_not_infinite() {
        let repository = Arc::new(MessageRepository::new());
        let queues: QueueDirectory = Arc::new(DashMap::new());
        queues.insert(("D".into(), "a".into()), spawn_queue(&repository, "D", "a"));
        queues.insert(("D".into(), "b".into()), spawn_queue(&repository, "D", "b"));

        let engine = RoutingEngine::new(Arc::clone(&queues), 64);
        engine.install_rule("D", "a", "b", Predicate::new(Operator::Eq, "x", PredicateValue::Number(1.0)));
        engine.install_rule("D", "b", "a", Predicate::new(Operator::Eq, "x", PredicateValue::Number(1.0)));

        let mut meta = Map::new();
        meta.insert("x".to_string(), serde_json::Value::from(1));
        let msg = Message::new("t", Bytes::from_static(b"{}")).with_metadata(meta);

        tokio::time::timeout(std::time::Duration::from_secs(2), engine.route("D", "a", &msg))
            .await
            .expect("routing must terminate despite the a<->b cycle");
    }
}
