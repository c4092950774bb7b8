//! Conversion of resource snapshots into deposit fragments.
//!
//! The marshaller is also the validation gate: a snapshot that does not
//! satisfy the deposit format's required fields is reported as a
//! [`MarshalError`] and the whole deposit is abandoned.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::deposit::DepositKey;
use crate::mode::DepositMode;
use crate::resource::{
    ContactState, DomainState, HostState, RegistrarState, ResourceKind, ResourceSnapshot,
};

/// One marshalled resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositFragment {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource id (repo id, or registrar id).
    pub id: String,
    /// Marshalled body.
    pub body: Value,
}

/// A snapshot that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} {id}: {reason}")]
pub struct MarshalError {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource id.
    pub id: String,
    /// What was wrong.
    pub reason: String,
}

/// Turns snapshots into validated deposit fragments.
pub trait DepositMarshaller: Send + Sync + 'static {
    /// Marshals one snapshot for the deposit identified by `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`MarshalError`] if the snapshot is not valid for the deposit.
    fn marshal(
        &self,
        key: &DepositKey,
        snapshot: &ResourceSnapshot,
    ) -> Result<DepositFragment, MarshalError>;
}

/// JSON marshaller enforcing the required fields of each resource kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl DepositMarshaller for JsonMarshaller {
    fn marshal(
        &self,
        key: &DepositKey,
        snapshot: &ResourceSnapshot,
    ) -> Result<DepositFragment, MarshalError> {
        let invalid = |reason: &str| MarshalError {
            kind: snapshot.kind(),
            id: snapshot.id().to_string(),
            reason: reason.to_string(),
        };

        let body = match snapshot {
            ResourceSnapshot::Domain(domain) => {
                validate_domain(key, domain).map_err(invalid)?;
                domain_body(key.mode, domain)
            }
            ResourceSnapshot::Host(host) => {
                validate_host(host).map_err(invalid)?;
                host_body(host)
            }
            ResourceSnapshot::Contact(contact) => {
                validate_contact(contact).map_err(invalid)?;
                contact_body(contact)
            }
            ResourceSnapshot::Registrar(registrar) => {
                validate_registrar(registrar).map_err(invalid)?;
                registrar_body(registrar)
            }
        };

        Ok(DepositFragment {
            kind: snapshot.kind(),
            id: snapshot.id().to_string(),
            body,
        })
    }
}

fn validate_domain(key: &DepositKey, domain: &DomainState) -> Result<(), &'static str> {
    if domain.fqdn.is_empty() {
        return Err("missing domain name");
    }
    if domain.tld != key.tld || !domain.fqdn.ends_with(&format!(".{}", key.tld)) {
        return Err("domain name is not under the deposit tld");
    }
    if domain.sponsor.is_empty() {
        return Err("missing sponsoring registrar");
    }
    if domain.expiration_time < domain.creation_time {
        return Err("expires before it was created");
    }
    Ok(())
}

fn validate_host(host: &HostState) -> Result<(), &'static str> {
    if host.fqdn.is_empty() {
        return Err("missing host name");
    }
    if host.sponsor.is_empty() {
        return Err("missing sponsoring registrar");
    }
    Ok(())
}

fn validate_contact(contact: &ContactState) -> Result<(), &'static str> {
    if !(3..=16).contains(&contact.contact_id.len()) {
        return Err("contact id must be 3 to 16 characters");
    }
    if contact.sponsor.is_empty() {
        return Err("missing sponsoring registrar");
    }
    if contact.email.as_deref().is_some_and(|email| !email.contains('@')) {
        return Err("malformed email address");
    }
    Ok(())
}

fn validate_registrar(registrar: &RegistrarState) -> Result<(), &'static str> {
    if registrar.registrar_id.is_empty() {
        return Err("missing registrar id");
    }
    if registrar.name.is_empty() {
        return Err("missing registrar name");
    }
    Ok(())
}

fn domain_body(mode: DepositMode, domain: &DomainState) -> Value {
    let mut body = json!({
        "name": domain.fqdn,
        "roid": domain.repo_id,
        "status": domain.statuses,
        "ns": domain.nameservers,
        "clID": domain.sponsor,
        "crDate": domain.creation_time,
        "exDate": domain.expiration_time,
    });
    if mode == DepositMode::Full {
        body["registrant"] = json!(domain.registrant);
        body["contacts"] = json!(domain.contacts);
    }
    if let Some(transfer) = &domain.pending_transfer {
        body["trnData"] = json!({
            "reID": transfer.gaining_registrar,
            "reDate": transfer.requested_at,
            "acDate": transfer.auto_approve_at,
        });
    }
    body
}

fn host_body(host: &HostState) -> Value {
    json!({
        "name": host.fqdn,
        "roid": host.repo_id,
        "addr": host.addresses,
        "clID": host.sponsor,
        "crDate": host.creation_time,
    })
}

fn contact_body(contact: &ContactState) -> Value {
    json!({
        "id": contact.contact_id,
        "roid": contact.repo_id,
        "name": contact.name,
        "email": contact.email,
        "clID": contact.sponsor,
        "crDate": contact.creation_time,
    })
}

fn registrar_body(registrar: &RegistrarState) -> Value {
    json!({
        "id": registrar.registrar_id,
        "name": registrar.name,
        "gurid": registrar.iana_id,
        "status": registrar.status,
    })
}
