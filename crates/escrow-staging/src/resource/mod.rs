//! Registry resources and the store that holds them.
//!
//! Domains, hosts and contacts are versioned: every committed mutation is
//! kept as a revision so any past instant can be reconstructed. Registrars are
//! not versioned and are always read as current.
//!
//! - [`ResourceStore`]: the sharded, strongly consistent store contract
//! - [`history::RevisionLog`]: a resource's append-only revision trail
//! - [`reader::PointInTimeReader`]: "state as of watermark" reads
//! - [`memory::MemoryResourceStore`]: in-process store

pub mod history;
pub mod memory;
pub mod reader;

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use history::RevisionLog;

/// Kinds of registry resources that appear in deposits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A registered domain name.
    Domain,
    /// A name server host.
    Host,
    /// A contact object.
    Contact,
    /// A sponsoring registrar.
    Registrar,
}

impl ResourceKind {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Host => "host",
            Self::Contact => "contact",
            Self::Registrar => "registrar",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a versioned resource in the sharded index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind (never [`ResourceKind::Registrar`]).
    pub kind: ResourceKind,
    /// Repository identifier, unique across kinds.
    pub repo_id: String,
}

impl ResourceKey {
    /// Creates a key.
    #[must_use]
    pub fn new(kind: ResourceKind, repo_id: impl Into<String>) -> Self {
        Self {
            kind,
            repo_id: repo_id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.repo_id)
    }
}

/// One fixed partition of the resource index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{:04}", self.0)
    }
}

/// A TLD known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// The TLD, without a leading dot.
    pub tld: String,
    /// Whether deposits are generated for this TLD.
    pub escrow_enabled: bool,
}

impl Partition {
    /// Creates an escrow-enabled partition.
    #[must_use]
    pub fn enabled(tld: impl Into<String>) -> Self {
        Self {
            tld: tld.into(),
            escrow_enabled: true,
        }
    }
}

/// A transfer awaiting approval; the server approves it automatically at
/// `auto_approve_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    /// Registrar that requested the transfer.
    pub gaining_registrar: String,
    /// When the request was made.
    pub requested_at: DateTime<Utc>,
    /// When the transfer completes if nobody acts on it.
    pub auto_approve_at: DateTime<Utc>,
}

/// Domain state at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainState {
    /// Repository identifier.
    pub repo_id: String,
    /// Fully qualified domain name.
    pub fqdn: String,
    /// TLD the domain is registered under.
    pub tld: String,
    /// Sponsoring registrar ID.
    pub sponsor: String,
    /// EPP status values.
    pub statuses: BTreeSet<String>,
    /// Host names of delegated name servers.
    pub nameservers: BTreeSet<String>,
    /// Registrant contact ID.
    pub registrant: Option<String>,
    /// Admin/tech/billing contact IDs.
    pub contacts: BTreeSet<String>,
    /// Creation time.
    pub creation_time: DateTime<Utc>,
    /// Registration expiration time.
    pub expiration_time: DateTime<Utc>,
    /// Deletion time, once deleted.
    pub deletion_time: Option<DateTime<Utc>>,
    /// In-flight transfer, if any.
    pub pending_transfer: Option<PendingTransfer>,
}

/// Host state at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    /// Repository identifier.
    pub repo_id: String,
    /// Fully qualified host name.
    pub fqdn: String,
    /// Sponsoring registrar ID.
    pub sponsor: String,
    /// Glue addresses.
    pub addresses: BTreeSet<IpAddr>,
    /// Creation time.
    pub creation_time: DateTime<Utc>,
    /// Deletion time, once deleted.
    pub deletion_time: Option<DateTime<Utc>>,
}

/// Contact state at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactState {
    /// Repository identifier.
    pub repo_id: String,
    /// Client-visible contact ID.
    pub contact_id: String,
    /// Sponsoring registrar ID.
    pub sponsor: String,
    /// Postal name.
    pub name: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Creation time.
    pub creation_time: DateTime<Utc>,
    /// Deletion time, once deleted.
    pub deletion_time: Option<DateTime<Utc>>,
}

/// Registrar account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrarStatus {
    /// Active and allowed to transact.
    Active,
    /// Suspended by the registry.
    Suspended,
    /// Disabled; kept for historical sponsorship.
    Disabled,
}

/// Registrar state (always current; registrars keep no history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrarState {
    /// Registrar client ID.
    pub registrar_id: String,
    /// Display name.
    pub name: String,
    /// IANA registrar identifier.
    pub iana_id: Option<u64>,
    /// Account status.
    pub status: RegistrarStatus,
}

/// State of a versioned resource at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceState {
    /// Domain revision.
    Domain(DomainState),
    /// Host revision.
    Host(HostState),
    /// Contact revision.
    Contact(ContactState),
}

impl ResourceState {
    /// Index key of this resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Domain(d) => ResourceKey::new(ResourceKind::Domain, &d.repo_id),
            Self::Host(h) => ResourceKey::new(ResourceKind::Host, &h.repo_id),
            Self::Contact(c) => ResourceKey::new(ResourceKind::Contact, &c.repo_id),
        }
    }

    /// Creation time of the resource.
    #[must_use]
    pub fn creation_time(&self) -> DateTime<Utc> {
        match self {
            Self::Domain(d) => d.creation_time,
            Self::Host(h) => h.creation_time,
            Self::Contact(c) => c.creation_time,
        }
    }

    /// Deletion time of the resource, if deleted.
    #[must_use]
    pub fn deletion_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Domain(d) => d.deletion_time,
            Self::Host(h) => h.deletion_time,
            Self::Contact(c) => c.deletion_time,
        }
    }

    /// Whether the resource existed at `at`.
    #[must_use]
    pub fn exists_at(&self, at: DateTime<Utc>) -> bool {
        self.creation_time() <= at && self.deletion_time().is_none_or(|deleted| at < deleted)
    }

    /// Projects this revision forward to `at`, applying server-side state
    /// changes that happen by the passage of time alone.
    ///
    /// Returns `None` if the resource did not exist at `at`.
    #[must_use]
    pub fn project_to(&self, at: DateTime<Utc>) -> Option<ResourceSnapshot> {
        if !self.exists_at(at) {
            return None;
        }
        Some(match self {
            Self::Domain(d) => {
                let mut domain = d.clone();
                if let Some(transfer) = &d.pending_transfer {
                    if transfer.auto_approve_at <= at {
                        domain.sponsor.clone_from(&transfer.gaining_registrar);
                        domain.pending_transfer = None;
                        domain.statuses.remove("pendingTransfer");
                    }
                }
                ResourceSnapshot::Domain(domain)
            }
            Self::Host(h) => ResourceSnapshot::Host(h.clone()),
            Self::Contact(c) => ResourceSnapshot::Contact(c.clone()),
        })
    }
}

impl From<DomainState> for ResourceState {
    fn from(state: DomainState) -> Self {
        Self::Domain(state)
    }
}

impl From<HostState> for ResourceState {
    fn from(state: HostState) -> Self {
        Self::Host(state)
    }
}

impl From<ContactState> for ResourceState {
    fn from(state: ContactState) -> Self {
        Self::Contact(state)
    }
}

/// Immutable view of a resource as of a watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSnapshot {
    /// Domain as of the watermark.
    Domain(DomainState),
    /// Host as of the watermark.
    Host(HostState),
    /// Contact as of the watermark.
    Contact(ContactState),
    /// Registrar as currently stored.
    Registrar(RegistrarState),
}

impl ResourceSnapshot {
    /// Kind of the snapshotted resource.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Domain(_) => ResourceKind::Domain,
            Self::Host(_) => ResourceKind::Host,
            Self::Contact(_) => ResourceKind::Contact,
            Self::Registrar(_) => ResourceKind::Registrar,
        }
    }

    /// Identifier used in fragments and error reports.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Domain(d) => &d.repo_id,
            Self::Host(h) => &h.repo_id,
            Self::Contact(c) => &c.repo_id,
            Self::Registrar(r) => &r.registrar_id,
        }
    }
}

/// Sharded, versioned resource store.
///
/// Reads must be strongly consistent: a history read issued after a commit
/// returns must observe that commit.
#[async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    /// Enumerates every shard of the resource index, including empty ones.
    async fn shards(&self) -> Result<Vec<ShardId>>;

    /// Lists the identities of all versioned resources in `shard`.
    async fn shard_members(&self, shard: ShardId) -> Result<Vec<ResourceKey>>;

    /// Reads a resource's full revision history.
    async fn history(&self, key: &ResourceKey) -> Result<Option<RevisionLog>>;

    /// Reads all registrars, active and inactive, as currently stored.
    async fn registrars(&self) -> Result<Vec<RegistrarState>>;

    /// Lists all TLDs.
    async fn partitions(&self) -> Result<Vec<Partition>>;
}
