//! Store fixture and connected test clients

use std::sync::{Arc, Mutex};
use std::time::Duration;

use setlist_common::config::ComposerConfig;
use setlist_common::models::ServiceRecord;
use setlist_common::{time, ClientId, EntryId, TenantId, UserId};
use setlist_compose::authz::Role;
use setlist_compose::identity::StaticIdentity;
use setlist_compose::store::{InMemoryStore, StoreLink};
use setlist_compose::usage::UsageLedger;
use setlist_compose::{Composer, Dispatcher, DispatcherHandle, NoticeKind, SharedLedger};

/// Upper bound for anything a test waits on
pub const SETTLE: Duration = Duration::from_secs(5);

/// Short timeouts so failure paths run quickly
pub fn fast_config() -> ComposerConfig {
    let mut config = ComposerConfig::default();
    config.sync.submit_timeout_ms = 250;
    config.sync.heartbeat_interval_ms = 30;
    config.sync.heartbeat_miss_limit = 2;
    config.sync.retry_budget_ms = 10_000;
    config.sync.resync_banner_after = 3;
    config.sync.resync_backoff_max_ms = 120;
    config.sync.event_channel_capacity = 256;
    config
}

pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub tenant: TenantId,
    pub service: ServiceRecord,
    pub config: ComposerConfig,
    pub ledger: SharedLedger,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: ComposerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new(config.sync.event_channel_capacity));
        let tenant = TenantId::new();
        let service = store.create_service(tenant, "Sunday morning", time::now());
        Self {
            store,
            tenant,
            service,
            config,
            ledger: Arc::new(Mutex::new(UsageLedger::new())),
        }
    }

    /// Connected client whose local role matches its store grant
    pub async fn client(&self, role: Role) -> TestClient {
        self.client_with(role, role).await
    }

    /// Connected client believing it holds `local` while the store grants `granted`
    pub async fn client_with(&self, local: Role, granted: Role) -> TestClient {
        let user = UserId::new();
        self.store.grant(user, self.tenant, granted);
        let identity = StaticIdentity::new(user).with_role(self.tenant, local);
        let link = self.store.link();
        let composer = Composer::connect(&identity, &link, &self.service, ClientId::new(), &self.config)
            .await
            .unwrap()
            .with_ledger(Arc::clone(&self.ledger));
        TestClient {
            composer,
            link,
            dispatcher: None,
            config: self.config.clone(),
        }
    }

    /// Connected client with its dispatcher running
    pub async fn started(&self, role: Role) -> TestClient {
        let mut client = self.client(role).await;
        client.start().await;
        client
    }

    /// Entry ids in store order
    pub fn canonical_ids(&self) -> Vec<EntryId> {
        self.store
            .entries(self.service.id)
            .iter()
            .map(|e| e.id)
            .collect()
    }

    /// Every client is idle and shows exactly the store's order
    pub fn converged(&self, clients: &[&TestClient]) -> bool {
        let canonical = self.canonical_ids();
        clients
            .iter()
            .all(|c| c.composer.pending_count() == 0 && c.ids() == canonical)
    }
}

pub struct TestClient {
    pub composer: Composer,
    pub link: StoreLink,
    dispatcher: Option<DispatcherHandle>,
    config: ComposerConfig,
}

impl TestClient {
    pub async fn start(&mut self) {
        let handle = Dispatcher::start(
            self.composer.clone(),
            Arc::new(self.link.clone()),
            self.config.sync.clone(),
        )
        .await
        .unwrap();
        self.dispatcher = Some(handle);
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            handle.stop().await;
        }
    }

    /// Visible entry ids in order
    pub fn ids(&self) -> Vec<EntryId> {
        self.composer.ordered_entries().iter().map(|e| e.id).collect()
    }

    pub fn has_notice(&self, kind: NoticeKind) -> bool {
        self.composer.notices().iter().any(|n| n.kind == kind)
    }
}

/// Poll `condition` until it holds; false if `limit` passes first
pub async fn eventually<F>(limit: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
