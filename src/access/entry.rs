//! Access list entries and pattern parsing.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;

use super::AccessListError;

/// Which list an entry belongs to. The two are independent namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    /// Addresses admitted by the reverse proxy.
    Allow,
    /// Addresses refused regardless of the allow list.
    Deny,
}

impl ListKind {
    /// Prefix used in audit action names.
    pub fn label(self) -> &'static str {
        match self {
            Self::Allow => "allowlist",
            Self::Deny => "denylist",
        }
    }
}

/// One allow or deny entry. Never edited in place.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEntry {
    /// IP or CIDR as given by the caller, trimmed.
    pub pattern: String,
    /// Free-form note.
    pub description: String,
    /// Who added the entry.
    pub added_by: String,
    /// When the entry was added.
    pub added_at: DateTime<Utc>,
    /// When the entry stops matching, if ever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    network: IpNet,
}

impl AccessEntry {
    pub(crate) fn new(
        pattern: &str,
        description: &str,
        added_by: &str,
        added_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Self, AccessListError> {
        let pattern = pattern.trim();
        Ok(Self {
            network: parse_pattern(pattern)?,
            pattern: pattern.to_owned(),
            description: description.to_owned(),
            added_by: added_by.to_owned(),
            added_at,
            expires_at,
        })
    }

    /// The parsed network. A single address is a host-length prefix.
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// CIDR containment, which for a host prefix is address equality.
    /// IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn matches(&self, ip: IpAddr) -> bool {
        self.network.contains(&ip.to_canonical())
    }

    /// Whether the entry has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Parse an IP or CIDR pattern.
///
/// # Errors
///
/// Returns [`AccessListError::Validation`] if `raw` is neither.
pub fn parse_pattern(raw: &str) -> Result<IpNet, AccessListError> {
    let raw = raw.trim();
    let parsed = if raw.contains('/') {
        raw.parse::<IpNet>().ok()
    } else {
        raw.parse::<IpAddr>().ok().map(IpNet::from)
    };
    parsed.ok_or_else(|| {
        AccessListError::Validation(format!("'{raw}' is not a valid IP address or CIDR range"))
    })
}
