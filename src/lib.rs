//! GoRTMS core: a message broker with schema-validated domains, durable
//! channel queues, consumer groups, predicate-based routing between
//! queues and an encrypted-at-rest store for users, service accounts and
//! account requests.
//!
//! `Core` is the explicitly-constructed aggregate root (spec §2,
//! Design Notes): unlike the teacher's `NexoEngine::new`, which builds
//! its managers behind a process-wide `Config::global()`, `Core::new`
//! takes an owned `Config` and wires every component itself so tests can
//! build a fresh, independently-configured instance per case.

pub mod ack_matrix;
pub mod cancellation;
pub mod config;
pub mod consumer_group;
pub mod debounce;
pub mod domain;
pub mod error;
pub mod message;
pub mod queue;
pub mod repository;
pub mod routing;
pub mod secure;
pub mod supervisor;
pub mod time;

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;

use cancellation::Cancellation;
use config::Config;
use consumer_group::ConsumerGroupRegistry;
use domain::{DomainManager, ACCOUNT_REQUESTS_QUEUE, SYSTEM_DOMAIN};
use error::{CoreError, CoreResult};
use queue::QueueDirectory;
use repository::MessageRepository;
use routing::RoutingEngine;
use secure::{AccountRequestStore, AccountRequestWatcher, ServiceAccountStore, UserStore};
use supervisor::{FailureEvent, Supervisor, SupervisorSnapshot};

/// The broker aggregate: every component the spec names, constructed and
/// owned in one place. Cloning a `Core` is shallow (every field is an
/// `Arc` or cheap), mirroring the teacher's `#[derive(Clone)] NexoEngine`.
#[derive(Clone)]
pub struct Core {
    pub repository: Arc<MessageRepository>,
    pub domains: Arc<DomainManager>,
    pub groups: Arc<ConsumerGroupRegistry>,
    pub routing: Arc<RoutingEngine>,
    pub users: Arc<UserStore>,
    pub service_accounts: Arc<ServiceAccountStore>,
    pub account_requests: Arc<AccountRequestStore>,
    pub supervisor: Arc<Supervisor>,
    root: Cancellation,
    _watcher: Option<Arc<AccountRequestWatcher>>,
}

impl Core {
    /// Builds every component, bootstraps the `SYSTEM` domain, and spawns
    /// the two background loops the core owns directly: the consumer
    /// group TTL sweep and the account-request file watcher.
    pub fn new(config: Config) -> CoreResult<Self> {
        let root = Cancellation::root();
        let supervisor = Arc::new(Supervisor::new());

        let repository = Arc::new(MessageRepository::new());
        let queues: QueueDirectory = Arc::new(DashMap::new());
        let routing = Arc::new(RoutingEngine::new(Arc::clone(&queues), config.routing.max_hops));
        let groups = Arc::new(ConsumerGroupRegistry::new(
            Arc::clone(&repository),
            Arc::clone(&queues),
            config.group.clone(),
        ));
        let domains = Arc::new(DomainManager::new(
            Arc::clone(&repository),
            Arc::clone(&queues),
            Arc::clone(&routing),
            Arc::clone(&groups),
            config.clone(),
            root.clone(),
            supervisor.failure_sender(),
        ));
        supervisor.spawn_group_sweep(Arc::clone(&groups), config.group.sweep_interval, root.child());

        let data_dir = PathBuf::from(&config.secure.data_dir);
        std::fs::create_dir_all(&data_dir).map_err(|e| CoreError::Internal(format!("failed to create data dir: {e}")))?;
        let key = secure::derive_key(&secure::machine_id());

        let users = UserStore::load(&data_dir, key, config.secure.clone())?;
        let service_accounts = ServiceAccountStore::load(&data_dir, key, &config.secure)?;
        let account_requests = AccountRequestStore::load(&data_dir, key, config.secure.clone())?;

        let requests_file = data_dir.join("incoming_account_requests.json");
        let notify_queue = domains
            .queue_handle(SYSTEM_DOMAIN, ACCOUNT_REQUESTS_QUEUE)
            .expect("the SYSTEM/_account_requests queue is bootstrapped by DomainManager::new");
        let watcher = AccountRequestWatcher::start(
            requests_file,
            Arc::clone(&account_requests),
            notify_queue,
            config.secure.watcher_debounce,
            Arc::clone(&supervisor),
        )
        .ok();
        if watcher.is_none() {
            supervisor.emit_background_failure("account_request_watcher", "failed to start file watcher");
        }

        info!("core initialized");
        Ok(Self {
            repository,
            domains,
            groups,
            routing,
            users,
            service_accounts,
            account_requests,
            supervisor,
            root,
            _watcher: watcher.map(Arc::new),
        })
    }

    /// Aggregates a point-in-time snapshot across every live queue (spec
    /// §2 component table: Supervisor / Stats).
    pub async fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            queues: self.domains.queue_stats().await,
            uptime: self.supervisor.uptime(),
        }
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailureEvent> {
        self.supervisor.subscribe_failures()
    }

    /// Cancels every domain/queue task tree. Background loops owned
    /// directly by `Core` (group sweep) observe the same root token.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}
