//! Deposit modes and the cursors that track them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resource::ResourceKind;

/// Kind of escrow deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositMode {
    /// Full (thick) deposit: domains, hosts, contacts and registrars.
    Full,
    /// Thin (BRDA) deposit: domains and registrars only.
    Thin,
}

impl DepositMode {
    /// Both modes, in cursor-check order.
    pub const ALL: [Self; 2] = [Self::Full, Self::Thin];

    /// Lower-case name used in paths and file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Thin => "thin",
        }
    }

    /// The cursor that tracks deposits of this mode.
    #[must_use]
    pub const fn cursor_type(self) -> CursorType {
        match self {
            Self::Full => CursorType::RdeStaging,
            Self::Thin => CursorType::Brda,
        }
    }

    /// Whether resources of `kind` belong in deposits of this mode.
    #[must_use]
    pub const fn includes(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Domain | ResourceKind::Registrar => true,
            ResourceKind::Host | ResourceKind::Contact => matches!(self, Self::Full),
        }
    }
}

impl fmt::Display for DepositMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "thin" => Ok(Self::Thin),
            other => Err(Error::configuration(format!("unknown deposit mode '{other}'"))),
        }
    }
}

/// Per-TLD progress cursor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorType {
    /// Staging cursor for full deposits.
    RdeStaging,
    /// Cursor for thin (bulk registration data access) deposits.
    Brda,
}

impl CursorType {
    /// Both cursor types.
    pub const ALL: [Self; 2] = [Self::RdeStaging, Self::Brda];

    /// Name used in cursor paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RdeStaging => "rde_staging",
            Self::Brda => "brda",
        }
    }

    /// The deposit mode this cursor gates.
    #[must_use]
    pub const fn mode(self) -> DepositMode {
        match self {
            Self::RdeStaging => DepositMode::Full,
            Self::Brda => DepositMode::Thin,
        }
    }
}

impl fmt::Display for CursorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
