//! Deposit identity, naming and the documents written for a deposit.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::marshal::DepositFragment;
use crate::mode::DepositMode;
use crate::resource::ResourceKind;

/// Suffix of the encrypted deposit document.
pub const DOCUMENT_SUFFIX: &str = ".deposit.ghostryde";
/// Suffix of the encrypted summary report.
pub const REPORT_SUFFIX: &str = ".report.ghostryde";
/// Suffix of the object holding the encrypted document's size.
pub const LENGTH_SUFFIX: &str = ".length";

/// Identity of one deposit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepositKey {
    /// TLD being deposited.
    pub tld: String,
    /// Deposit mode.
    pub mode: DepositMode,
    /// Point in time the deposit captures.
    pub watermark: DateTime<Utc>,
}

impl DepositKey {
    /// Creates a key.
    #[must_use]
    pub fn new(tld: impl Into<String>, mode: DepositMode, watermark: DateTime<Utc>) -> Self {
        Self {
            tld: tld.into(),
            mode,
            watermark,
        }
    }

    /// Path-safe form, e.g. `example-full-20240101T000000Z`.
    ///
    /// Sub-second watermarks carry their nanoseconds, e.g.
    /// `example-full-20240101T000000.000000001Z`.
    #[must_use]
    pub fn slug(&self) -> String {
        format!(
            "{}-{}-{}{}Z",
            self.tld,
            self.mode,
            self.watermark.format("%Y%m%dT%H%M%S"),
            self.fraction()
        )
    }

    /// Deposit id: the watermark's epoch seconds in upper-case base 36.
    #[must_use]
    pub fn deposit_id(&self) -> String {
        deposit_id(self.watermark)
    }

    /// Artifact base name, e.g. `example_2024-01-01_full_S1_R0`.
    ///
    /// Midnight watermarks use the bare date; others carry the time.
    #[must_use]
    pub fn basename(&self) -> String {
        let at_midnight = self.watermark.num_seconds_from_midnight() == 0
            && self.watermark.nanosecond() == 0;
        let stamp = if at_midnight {
            self.watermark.format("%Y-%m-%d").to_string()
        } else {
            format!("{}{}Z", self.watermark.format("%Y-%m-%dT%H%M%S"), self.fraction())
        };
        format!("{}_{}_{}_S1_R0", self.tld, stamp, self.mode)
    }

    fn fraction(&self) -> String {
        match self.watermark.nanosecond() {
            0 => String::new(),
            nanos => format!(".{nanos:09}"),
        }
    }

    /// Storage paths of this deposit's artifacts under `prefix`.
    #[must_use]
    pub fn paths(&self, prefix: &str) -> DepositPaths {
        let base = format!("{}/{}", prefix.trim_end_matches('/'), self.basename());
        DepositPaths {
            document: format!("{base}{DOCUMENT_SUFFIX}"),
            report: format!("{base}{REPORT_SUFFIX}"),
            length: format!("{base}{LENGTH_SUFFIX}"),
        }
    }
}

impl fmt::Display for DepositKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.tld,
            self.mode,
            self.watermark.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Encodes a timestamp's epoch seconds in upper-case base 36.
#[must_use]
pub fn deposit_id(at: DateTime<Utc>) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let seconds = at.timestamp();
    let mut value = seconds.unsigned_abs();
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        // value % 36 < 36, so the index is in range.
        #[allow(clippy::cast_possible_truncation)]
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    if seconds < 0 {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Where a deposit's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositPaths {
    /// Encrypted document.
    pub document: String,
    /// Encrypted report.
    pub report: String,
    /// Plain-text size of the encrypted document, in bytes.
    pub length: String,
}

/// Header shared by the document and the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositHeader {
    /// Deposit id.
    pub id: String,
    /// TLD being deposited.
    pub tld: String,
    /// Deposit mode.
    pub mode: DepositMode,
    /// Point in time captured.
    pub watermark: DateTime<Utc>,
    /// Resource count per kind.
    pub counts: BTreeMap<ResourceKind, u64>,
}

impl DepositHeader {
    /// Builds a header for `key` counting `fragments` per kind.
    #[must_use]
    pub fn new(key: &DepositKey, fragments: &[DepositFragment]) -> Self {
        let mut counts = BTreeMap::new();
        for fragment in fragments {
            *counts.entry(fragment.kind).or_insert(0) += 1;
        }
        Self {
            id: key.deposit_id(),
            tld: key.tld.clone(),
            mode: key.mode,
            watermark: key.watermark,
            counts,
        }
    }
}

/// The primary deposit document before encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositDocument {
    /// Deposit header.
    pub header: DepositHeader,
    /// Marshalled resources, sorted by kind then id.
    pub fragments: Vec<DepositFragment>,
}

/// The summary report before encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReport {
    /// Deposit header.
    pub header: DepositHeader,
    /// Size of the encrypted document, in bytes.
    pub document_size: u64,
}

/// A deposit written to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositArtifact {
    /// Deposit identity.
    pub key: DepositKey,
    /// Artifact locations.
    pub paths: DepositPaths,
    /// Size of the encrypted document, in bytes.
    pub document_size: u64,
    /// Resource count per kind.
    pub counts: BTreeMap<ResourceKind, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn midnight_watermark_names_by_date() {
        let key = DepositKey::new(
            "example",
            DepositMode::Full,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        );
        assert_eq!(key.basename(), "example_2024-01-01_full_S1_R0");
        assert_eq!(key.slug(), "example-full-20240101T000000Z");
        assert_eq!(key.to_string(), "example/full/2024-01-01T00:00:00Z");

        let paths = key.paths("rde/");
        assert_eq!(paths.document, "rde/example_2024-01-01_full_S1_R0.deposit.ghostryde");
        assert_eq!(paths.report, "rde/example_2024-01-01_full_S1_R0.report.ghostryde");
        assert_eq!(paths.length, "rde/example_2024-01-01_full_S1_R0.length");
    }

    #[test]
    fn off_midnight_watermark_keeps_the_time() {
        let key = DepositKey::new(
            "example",
            DepositMode::Thin,
            Utc.with_ymd_and_hms(2024, 1, 2, 6, 30, 5).unwrap(),
        );
        assert_eq!(key.basename(), "example_2024-01-02T063005Z_thin_S1_R0");
    }

    #[test]
    fn sub_second_watermarks_get_distinct_names() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let whole = DepositKey::new("example", DepositMode::Full, at);
        let later = DepositKey::new(
            "example",
            DepositMode::Full,
            at + chrono::Duration::nanoseconds(1),
        );
        let latest = DepositKey::new(
            "example",
            DepositMode::Full,
            at + chrono::Duration::milliseconds(250),
        );

        assert_eq!(later.slug(), "example-full-20240101T000000.000000001Z");
        assert_eq!(latest.slug(), "example-full-20240101T000000.250000000Z");
        assert_eq!(later.basename(), "example_2024-01-01T000000.000000001Z_full_S1_R0");
        assert_ne!(whole.slug(), later.slug());
        assert_ne!(later.slug(), latest.slug());
        assert_ne!(whole.paths("rde").document, later.paths("rde").document);
        assert_ne!(later.paths("rde").document, latest.paths("rde").document);
    }

    #[test]
    fn deposit_id_is_base36_epoch_seconds() {
        assert_eq!(deposit_id(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()), "S6K2O0");
        assert_eq!(deposit_id(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()), "S6LXC0");
        assert_eq!(deposit_id(DateTime::<Utc>::UNIX_EPOCH), "0");
    }

    #[test]
    fn keys_differ_by_mode() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let full = DepositKey::new("example", DepositMode::Full, at);
        let thin = DepositKey::new("example", DepositMode::Thin, at);
        assert_ne!(full, thin);
        assert_ne!(full.paths("rde").document, thin.paths("rde").document);
    }
}
