//! C6 — Domain/Queue Manager: owns domain and queue lifecycle and schema
//! enforcement (spec §4.6).
//!
//! Grounded on the teacher's `QueueManager`/`PubSubManager` registries
//! (`brokers/queues/queue_manager.rs`, `brokers/pub-sub/pub_sub_manager.rs`):
//! a `DashMap` keyed registry owning actor handles, spawning on create and
//! tearing down (stop + purge) on delete — generalized here from a flat
//! queue-name registry into a two-level domain/queue one, since this spec
//! scopes queues to a schema-bearing domain rather than a single flat
//! namespace.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::cancellation::Cancellation;
use crate::config::Config;
use crate::consumer_group::ConsumerGroupRegistry;
use crate::domain::schema::Schema;
use crate::error::{CoreError, CoreResult};
use crate::message::Message;
use crate::queue::{self, QueueConfig, QueueDirectory, QueueHandle};
use crate::repository::MessageRepository;
use crate::routing::RoutingEngine;
use crate::supervisor::FailureSender;

pub const SYSTEM_DOMAIN: &str = "SYSTEM";
pub const ACCOUNT_REQUESTS_QUEUE: &str = "_account_requests";

struct DomainEntry {
    schema: Option<Schema>,
    queues: parking_lot::Mutex<HashSet<String>>,
    cancellation: Cancellation,
}

pub struct DomainManager {
    domains: DashMap<String, DomainEntry>,
    queues: QueueDirectory,
    repository: Arc<MessageRepository>,
    routing: Arc<RoutingEngine>,
    groups: Arc<ConsumerGroupRegistry>,
    config: Config,
    root: Cancellation,
    failures: FailureSender,
}

impl DomainManager {
    pub fn new(
        repository: Arc<MessageRepository>,
        queues: QueueDirectory,
        routing: Arc<RoutingEngine>,
        groups: Arc<ConsumerGroupRegistry>,
        config: Config,
        root: Cancellation,
        failures: FailureSender,
    ) -> Self {
        let manager = Self {
            domains: DashMap::new(),
            queues,
            repository,
            routing,
            groups,
            config,
            root,
            failures,
        };
        manager.bootstrap_system_domain();
        manager
    }

    fn bootstrap_system_domain(&self) {
        self.create_domain_internal(SYSTEM_DOMAIN, None);
        let mut cfg = QueueConfig::from_defaults(&self.config, true);
        cfg.retry.enabled = true;
        cfg.breaker.enabled = true;
        self.create_queue_internal(SYSTEM_DOMAIN, ACCOUNT_REQUESTS_QUEUE, cfg)
            .expect("bootstrapping the system domain must not fail");
    }

    pub fn create_domain(&self, name: &str, schema: Option<Schema>) -> CoreResult<()> {
        if name == SYSTEM_DOMAIN {
            return Err(CoreError::Validation(format!("'{SYSTEM_DOMAIN}' is reserved")));
        }
        self.create_domain_internal(name, schema)
    }

    fn create_domain_internal(&self, name: &str, schema: Option<Schema>) -> CoreResult<()> {
        if self.domains.contains_key(name) {
            return Err(CoreError::AlreadyExists(format!("domain '{name}'")));
        }
        self.domains.insert(
            name.to_string(),
            DomainEntry {
                schema,
                queues: parking_lot::Mutex::new(HashSet::new()),
                cancellation: self.root.child(),
            },
        );
        Ok(())
    }

    /// Every domain except the reserved `SYSTEM` one (spec §4.6).
    pub fn list_domains(&self) -> Vec<String> {
        self.domains
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| name != SYSTEM_DOMAIN)
            .collect()
    }

    pub fn create_queue(&self, domain: &str, name: &str, cfg: QueueConfig) -> CoreResult<()> {
        if !self.domains.contains_key(domain) {
            return Err(CoreError::NotFound(format!("domain '{domain}'")));
        }
        self.create_queue_internal(domain, name, cfg)
    }

    fn create_queue_internal(&self, domain: &str, name: &str, cfg: QueueConfig) -> CoreResult<()> {
        let key = (domain.to_string(), name.to_string());
        if self.queues.contains_key(&key) {
            return Err(CoreError::AlreadyExists(format!("queue '{domain}/{name}'")));
        }

        let domain_entry = self
            .domains
            .get(domain)
            .ok_or_else(|| CoreError::NotFound(format!("domain '{domain}'")))?;
        let queue_cancellation = domain_entry.cancellation.child();
        domain_entry.queues.lock().insert(name.to_string());

        let handle = queue::spawn(
            domain.to_string(),
            name.to_string(),
            cfg,
            Arc::clone(&self.repository),
            queue_cancellation,
            self.failures.clone(),
        );
        self.queues.insert(key, handle);
        Ok(())
    }

    /// Stops the queue's runtime, removes routes referencing it, and
    /// purges its messages (spec §4.6).
    pub async fn delete_queue(&self, domain: &str, name: &str) -> CoreResult<()> {
        let key = (domain.to_string(), name.to_string());
        let Some((_, handle)) = self.queues.remove(&key) else {
            return Err(CoreError::NotFound(format!("queue '{domain}/{name}'")));
        };
        handle.stop().await;
        self.routing.remove_routes_for_queue(domain, name);
        self.repository.purge_queue(domain, name);
        if let Some(entry) = self.domains.get(domain) {
            entry.queues.lock().remove(name);
        }
        Ok(())
    }

    /// Deletes every queue in `domain`, then the domain itself.
    pub async fn delete_domain(&self, name: &str) -> CoreResult<()> {
        if name == SYSTEM_DOMAIN {
            return Err(CoreError::Validation(format!("'{SYSTEM_DOMAIN}' cannot be deleted")));
        }
        let Some((_, entry)) = self.domains.remove(name) else {
            return Err(CoreError::NotFound(format!("domain '{name}'")));
        };
        entry.cancellation.cancel();
        let queue_names: Vec<String> = entry.queues.lock().iter().cloned().collect();
        for queue_name in queue_names {
            let _ = self.delete_queue(name, &queue_name).await;
        }
        self.routing.remove_routes_for_domain(name);
        self.repository.purge_domain(name);
        info!(domain = name, "domain deleted");
        Ok(())
    }

    pub fn queue_handle(&self, domain: &str, queue: &str) -> CoreResult<QueueHandle> {
        self.queues
            .get(&(domain.to_string(), queue.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::NotFound(format!("queue '{domain}/{queue}'")))
    }

    /// Point-in-time stats for every live queue across every domain
    /// (spec §2 component table: Supervisor / Stats).
    pub async fn queue_stats(&self) -> Vec<queue::QueueStats> {
        let handles: Vec<QueueHandle> = self.queues.iter().map(|e| e.value().clone()).collect();
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(s) = handle.stats().await {
                stats.push(s);
            }
        }
        stats
    }

    /// `caller -> C6 (schema check) -> C2 (store) -> C3 (enqueue) -> C5`:
    /// validates against the domain's schema (if any), enqueues into the
    /// target queue, then lets the routing engine forward matches.
    pub async fn publish(&self, domain: &str, queue: &str, message: Message) -> CoreResult<u64> {
        if let Some(entry) = self.domains.get(domain) {
            if let Some(schema) = &entry.schema {
                let payload = message
                    .payload_as_json()
                    .ok_or_else(|| CoreError::Validation("schema-bound domain requires a JSON payload".into()))?;
                schema.validate(&payload).map_err(CoreError::Validation)?;
            }
        } else {
            return Err(CoreError::NotFound(format!("domain '{domain}'")));
        }

        let handle = self.queue_handle(domain, queue)?;
        let forwarded = message.clone();
        let index = handle.enqueue(message).await?;
        self.routing.route(domain, queue, &forwarded).await;
        Ok(index)
    }

    pub fn groups(&self) -> &Arc<ConsumerGroupRegistry> {
        &self.groups
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashMap;

    fn manager() -> DomainManager {
        let repository = Arc::new(MessageRepository::new());
        let queues: QueueDirectory = Arc::new(DashMap::new());
        let config = Config::default();
        let routing = Arc::new(RoutingEngine::new(Arc::clone(&queues), config.routing.max_hops));
        let groups = Arc::new(ConsumerGroupRegistry::new(
            Arc::clone(&repository),
            Arc::clone(&queues),
            config.group.clone(),
        ));
        let (failures, _) = tokio::sync::broadcast::channel(16);
        DomainManager::new(repository, queues, routing, groups, config, Cancellation::root(), failures)
    }

    #[tokio::test]
    async fn system_domain_is_bootstrapped_and_hidden() {
        let mgr = manager();
        assert!(!mgr.list_domains().contains(&SYSTEM_DOMAIN.to_string()));
        assert!(mgr.create_domain(SYSTEM_DOMAIN, None).is_err());
    }

    #[tokio::test]
    async fn publish_rejects_schema_mismatch() {
        let mgr = manager();
        let mut fields = HashMap::new();
        fields.insert("age".to_string(), crate::domain::schema::FieldType::Number);
        mgr.create_domain("D", Some(Schema::new(fields))).unwrap();
        mgr.create_queue("D", "q", QueueConfig::from_defaults(&Config::default(), false))
            .unwrap();

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let bad = Message::new("t", Bytes::from(r#"{"age":"not a number"}"#)).with_headers(headers);
        assert!(mgr.publish("D", "q", bad).await.is_err());
    }

    #[tokio::test]
    async fn delete_domain_cascades_to_queues_and_routes() {
        let mgr = manager();
        mgr.create_domain("D", None).unwrap();
        mgr.create_queue("D", "in", QueueConfig::from_defaults(&Config::default(), false))
            .unwrap();
        mgr.create_queue("D", "out", QueueConfig::from_defaults(&Config::default(), false))
            .unwrap();
        mgr.routing().install_rule(
            "D",
            "in",
            "out",
            crate::routing::Predicate::new(
                crate::routing::Operator::Eq,
                "x",
                crate::message::PredicateValue::Number(1.0),
            ),
        );

        mgr.delete_domain("D").await.unwrap();
        assert!(mgr.publish("D", "in", Message::new("t", Bytes::from_static(b"{}"))).await.is_err());
    }
}
