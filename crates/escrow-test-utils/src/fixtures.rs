//! Registry fixtures and a wired-up pipeline configuration.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use escrow_core::{FakeClock, StorageBackend};
use escrow_staging::config::{StagingConfig, StagingSettings};
use escrow_staging::crypto::{Encryptor, XChaChaEncryptor};
use escrow_staging::cursor::CursorStore;
use escrow_staging::deposit::{DepositDocument, DepositPaths, DepositReport};
use escrow_staging::mode::CursorType;
use escrow_staging::resource::memory::MemoryResourceStore;
use escrow_staging::resource::{
    ContactState, DomainState, HostState, Partition, RegistrarState, RegistrarStatus,
    ResourceState,
};
use escrow_staging::upload::memory::InMemoryUploadQueue;

use crate::storage::TracingMemoryBackend;

/// Deposit key material used by fixtures.
pub const FIXTURE_KEY: [u8; 32] = [7; 32];

/// Midnight UTC on the given day of January 2024.
#[must_use]
pub fn jan(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

/// A small registry with the collaborators a staging run needs.
///
/// Resources are committed with explicit commit times so point-in-time
/// reads can be exercised. Every handle is shared, so assertions see what
/// the pipeline wrote.
#[derive(Debug, Clone)]
pub struct RegistryFixture {
    /// Versioned registry data.
    pub resources: Arc<MemoryResourceStore>,
    /// Artifact, cursor, lock and shuffle storage.
    pub storage: TracingMemoryBackend,
    /// Upload queue.
    pub queue: Arc<InMemoryUploadQueue>,
    /// Clock handed to the pipeline.
    pub clock: FakeClock,
    /// Artifact encryption.
    pub encryptor: Arc<XChaChaEncryptor>,
    /// Settings used by [`Self::config`].
    pub settings: StagingSettings,
}

impl RegistryFixture {
    /// Creates an empty registry with four index shards and the clock at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            resources: Arc::new(MemoryResourceStore::new(4)),
            storage: TracingMemoryBackend::new(),
            queue: Arc::new(InMemoryUploadQueue::new()),
            clock: FakeClock::new(now),
            encryptor: Arc::new(XChaChaEncryptor::new(FIXTURE_KEY).unwrap()),
            settings: StagingSettings::default(),
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: StagingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the transaction cooldown.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.settings.transaction_cooldown = cooldown;
        self
    }

    /// Registers an escrow-enabled TLD.
    pub fn tld(&self, tld: &str) -> &Self {
        self.resources.put_partition(Partition::enabled(tld)).unwrap();
        self
    }

    /// Registers a TLD with escrow disabled.
    pub fn disabled_tld(&self, tld: &str) -> &Self {
        self.resources
            .put_partition(Partition {
                tld: tld.to_string(),
                escrow_enabled: false,
            })
            .unwrap();
        self
    }

    /// Adds an active registrar.
    pub fn registrar(&self, registrar_id: &str, name: &str) -> &Self {
        self.resources
            .put_registrar(RegistrarState {
                registrar_id: registrar_id.to_string(),
                name: name.to_string(),
                iana_id: Some(9999),
                status: RegistrarStatus::Active,
            })
            .unwrap();
        self
    }

    /// Commits `state` at `commit_time`.
    pub fn commit(&self, commit_time: DateTime<Utc>, state: impl Into<ResourceState>) -> &Self {
        self.resources.commit(commit_time, state.into()).unwrap();
        self
    }

    /// Creates a domain at `created`, committed at the same instant.
    pub fn domain(&self, fqdn: &str, sponsor: &str, created: DateTime<Utc>) -> DomainState {
        let state = domain_state(fqdn, sponsor, created);
        self.commit(created, state.clone());
        state
    }

    /// Creates a host at `created`, committed at the same instant.
    pub fn host(&self, fqdn: &str, sponsor: &str, created: DateTime<Utc>) -> HostState {
        let state = host_state(fqdn, sponsor, created);
        self.commit(created, state.clone());
        state
    }

    /// Creates a contact at `created`, committed at the same instant.
    pub fn contact(&self, contact_id: &str, sponsor: &str, created: DateTime<Utc>) -> ContactState {
        let state = contact_state(contact_id, sponsor, created);
        self.commit(created, state.clone());
        state
    }

    /// Pipeline configuration wired to this fixture.
    #[must_use]
    pub fn config(&self) -> StagingConfig {
        StagingConfig::new(
            self.settings.clone(),
            self.resources.clone(),
            Arc::new(self.storage.clone()) as Arc<dyn StorageBackend>,
            self.encryptor.clone(),
            self.queue.clone(),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }

    /// Cursor store over the fixture's storage.
    #[must_use]
    pub fn cursors(&self) -> CursorStore {
        self.config().cursor_store()
    }

    /// Creates the cursor of `tld` at `position`.
    pub async fn cursor_at(&self, tld: &str, cursor_type: CursorType, position: DateTime<Utc>) {
        self.cursors()
            .initialize(tld, cursor_type, position)
            .await
            .unwrap();
    }

    /// Reads and decrypts a deposit document.
    pub async fn document(&self, paths: &DepositPaths) -> DepositDocument {
        let sealed = self.storage.inner().get(&paths.document).await.unwrap();
        let plain = self.encryptor.decrypt(&paths.document, &sealed).unwrap();
        serde_json::from_slice(&plain).unwrap()
    }

    /// Reads and decrypts a deposit report.
    pub async fn report(&self, paths: &DepositPaths) -> DepositReport {
        let sealed = self.storage.inner().get(&paths.report).await.unwrap();
        let plain = self.encryptor.decrypt(&paths.report, &sealed).unwrap();
        serde_json::from_slice(&plain).unwrap()
    }
}

fn repo_id(prefix: &str, name: &str) -> String {
    format!("{prefix}-{}", name.replace('.', "_").to_uppercase())
}

/// A live domain sponsored by `sponsor`, registered for one year.
#[must_use]
pub fn domain_state(fqdn: &str, sponsor: &str, created: DateTime<Utc>) -> DomainState {
    let tld = fqdn.rsplit('.').next().unwrap_or(fqdn).to_string();
    DomainState {
        repo_id: repo_id("D", fqdn),
        fqdn: fqdn.to_string(),
        tld,
        sponsor: sponsor.to_string(),
        statuses: BTreeSet::from(["ok".to_string()]),
        nameservers: BTreeSet::new(),
        registrant: Some("jd1234".to_string()),
        contacts: BTreeSet::from(["jd1234".to_string()]),
        creation_time: created,
        expiration_time: created + Duration::days(365),
        deletion_time: None,
        pending_transfer: None,
    }
}

/// A live host without glue.
#[must_use]
pub fn host_state(fqdn: &str, sponsor: &str, created: DateTime<Utc>) -> HostState {
    HostState {
        repo_id: repo_id("H", fqdn),
        fqdn: fqdn.to_string(),
        sponsor: sponsor.to_string(),
        addresses: BTreeSet::new(),
        creation_time: created,
        deletion_time: None,
    }
}

/// A live contact with an email address.
#[must_use]
pub fn contact_state(contact_id: &str, sponsor: &str, created: DateTime<Utc>) -> ContactState {
    ContactState {
        repo_id: repo_id("C", contact_id),
        contact_id: contact_id.to_string(),
        sponsor: sponsor.to_string(),
        name: Some("Jane Doe".to_string()),
        email: Some(format!("{contact_id}@example.test")),
        creation_time: created,
        deletion_time: None,
    }
}
