//! IP allow/deny registry kept in lockstep with the reverse proxy.
//!
//! The manager is the only writer of the proxy's dynamic configuration file.
//! Every mutation builds the next state, rewrites the file from it, and only
//! then swaps it in under the write lock. A failed write leaves both the
//! in-memory lists and the file as they were.
//!
//! Deny entries always win: an address matching a live deny entry is refused
//! whatever the allow list says. Unknown addresses are refused too.

mod clock;
mod entry;
mod proxy;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditTrail};
use crate::config::AccessConfig;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{parse_pattern, AccessEntry, ListKind};

use proxy::ProxyConfigFile;

/// Errors from access list operations.
#[derive(Debug, thiserror::Error)]
pub enum AccessListError {
    /// Malformed pattern, duplicate entry or past expiry.
    #[error("invalid access entry: {0}")]
    Validation(String),
    /// No such entry in the named list.
    #[error("{pattern} is not in the {list}")]
    NotFound {
        /// Pattern that was looked up.
        pattern: String,
        /// `allowlist` or `denylist`.
        list: &'static str,
    },
    /// The proxy config could not be written; nothing changed.
    #[error("proxy config sync failed: {0}")]
    Sync(String),
}

#[derive(Debug, Clone, Default)]
struct AccessLists {
    allow: Vec<AccessEntry>,
    deny: Vec<AccessEntry>,
}

impl AccessLists {
    fn get(&self, kind: ListKind) -> &Vec<AccessEntry> {
        match kind {
            ListKind::Allow => &self.allow,
            ListKind::Deny => &self.deny,
        }
    }

    fn get_mut(&mut self, kind: ListKind) -> &mut Vec<AccessEntry> {
        match kind {
            ListKind::Allow => &mut self.allow,
            ListKind::Deny => &mut self.deny,
        }
    }

    fn live_allow_ranges(&self, now: DateTime<Utc>) -> Vec<String> {
        self.allow
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.pattern.clone())
            .collect()
    }
}

/// Allow/deny registry synchronised to the reverse-proxy config file.
pub struct AccessListManager {
    lists: RwLock<AccessLists>,
    proxy: ProxyConfigFile,
    audit: Arc<AuditTrail>,
    clock: Arc<dyn Clock>,
}

impl AccessListManager {
    /// Open the registry, seeding the allow list from the existing proxy
    /// config. Seeded entries are attributed to `system`.
    ///
    /// # Errors
    ///
    /// Returns [`AccessListError::Sync`] if the file exists but cannot be
    /// read or parsed.
    pub async fn open(
        config: &AccessConfig,
        audit: Arc<AuditTrail>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AccessListError> {
        let proxy = ProxyConfigFile::new(&config.proxy_config_path, &config.middleware);
        let now = clock.now();

        let mut lists = AccessLists::default();
        for raw in proxy.read_ranges().await.map_err(AccessListError::Sync)? {
            if lists.allow.iter().any(|e| e.pattern == raw.trim()) {
                continue;
            }
            match AccessEntry::new(&raw, "loaded from proxy config", "system", now, None) {
                Ok(entry) => lists.allow.push(entry),
                Err(e) => warn!(pattern = %raw, error = %e, "skipping unparseable proxy entry"),
            }
        }
        info!(
            path = %proxy.path().display(),
            loaded = lists.allow.len(),
            "access list opened"
        );

        Ok(Self {
            lists: RwLock::new(lists),
            proxy,
            audit,
            clock,
        })
    }

    /// Add an entry to `kind`.
    ///
    /// # Errors
    ///
    /// [`AccessListError::Validation`] for a malformed pattern, a pattern
    /// already in the same list, or an expiry in the past;
    /// [`AccessListError::Sync`] if the proxy config write fails.
    pub async fn add(
        &self,
        kind: ListKind,
        pattern: &str,
        description: &str,
        added_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AccessEntry, AccessListError> {
        let now = self.clock.now();
        let entry = AccessEntry::new(pattern, description, added_by, now, expires_at)?;
        if entry.is_expired(now) {
            return Err(AccessListError::Validation(format!(
                "expiry for {} is already in the past",
                entry.pattern
            )));
        }

        let mut lists = self.lists.write().await;
        if lists.get(kind).iter().any(|e| e.pattern == entry.pattern) {
            return Err(AccessListError::Validation(format!(
                "{} is already in the {}",
                entry.pattern,
                kind.label()
            )));
        }

        let mut next = lists.clone();
        next.get_mut(kind).push(entry.clone());
        let action = format!("{}_add", kind.label());
        self.commit(&mut lists, next, now, &action, added_by, &entry.pattern)
            .await?;

        let mut event = AuditEvent::new(action, added_by, &entry.pattern)
            .detail("description", entry.description.as_str());
        if let Some(at) = entry.expires_at {
            event = event.detail("expires_at", at.to_rfc3339());
        }
        self.audit.log_event(event);
        Ok(entry)
    }

    /// Add an address or range to the allow list.
    ///
    /// # Errors
    ///
    /// See [`AccessListManager::add`].
    pub async fn add_to_allow(
        &self,
        pattern: &str,
        description: &str,
        added_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AccessEntry, AccessListError> {
        self.add(ListKind::Allow, pattern, description, added_by, expires_at)
            .await
    }

    /// Add an address or range to the deny list.
    ///
    /// # Errors
    ///
    /// See [`AccessListManager::add`].
    pub async fn add_to_deny(
        &self,
        pattern: &str,
        description: &str,
        added_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AccessEntry, AccessListError> {
        self.add(ListKind::Deny, pattern, description, added_by, expires_at)
            .await
    }

    /// Remove `pattern` from `kind`.
    ///
    /// # Errors
    ///
    /// [`AccessListError::NotFound`] if absent; [`AccessListError::Sync`] if
    /// the proxy config write fails.
    pub async fn remove(
        &self,
        kind: ListKind,
        pattern: &str,
        actor: &str,
    ) -> Result<AccessEntry, AccessListError> {
        let pattern = pattern.trim();
        let now = self.clock.now();
        let mut lists = self.lists.write().await;

        let Some(index) = lists.get(kind).iter().position(|e| e.pattern == pattern) else {
            return Err(AccessListError::NotFound {
                pattern: pattern.to_owned(),
                list: kind.label(),
            });
        };

        let mut next = lists.clone();
        let removed = next.get_mut(kind).remove(index);
        let action = format!("{}_remove", kind.label());
        self.commit(&mut lists, next, now, &action, actor, pattern)
            .await?;

        self.audit
            .log_event(AuditEvent::new(action, actor, pattern));
        Ok(removed)
    }

    /// Remove an entry from the allow list.
    ///
    /// # Errors
    ///
    /// See [`AccessListManager::remove`].
    pub async fn remove_from_allow(
        &self,
        pattern: &str,
        actor: &str,
    ) -> Result<AccessEntry, AccessListError> {
        self.remove(ListKind::Allow, pattern, actor).await
    }

    /// Remove an entry from the deny list.
    ///
    /// # Errors
    ///
    /// See [`AccessListManager::remove`].
    pub async fn remove_from_deny(
        &self,
        pattern: &str,
        actor: &str,
    ) -> Result<AccessEntry, AccessListError> {
        self.remove(ListKind::Deny, pattern, actor).await
    }

    /// Whether `ip` is admitted. Unparseable input is refused.
    pub async fn is_allowed(&self, ip: &str) -> bool {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.is_allowed_addr(addr).await,
            Err(_) => false,
        }
    }

    /// Deny wins, then allow, then default-deny. Expired entries are ignored.
    pub async fn is_allowed_addr(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        let lists = self.lists.read().await;
        let live_match = |e: &AccessEntry| !e.is_expired(now) && e.matches(ip);
        if lists.deny.iter().any(live_match) {
            return false;
        }
        lists.allow.iter().any(live_match)
    }

    /// Snapshot of one list, including not-yet-swept expired entries.
    pub async fn list(&self, kind: ListKind) -> Vec<AccessEntry> {
        self.lists.read().await.get(kind).clone()
    }

    /// Snapshot of the allow list.
    pub async fn list_allow(&self) -> Vec<AccessEntry> {
        self.list(ListKind::Allow).await
    }

    /// Snapshot of the deny list.
    pub async fn list_deny(&self) -> Vec<AccessEntry> {
        self.list(ListKind::Deny).await
    }

    /// Drop expired entries from both lists, syncing once. Returns how many
    /// were removed; each is audited.
    ///
    /// # Errors
    ///
    /// [`AccessListError::Sync`] if the proxy config write fails, in which
    /// case nothing is removed.
    pub async fn cleanup_expired(&self) -> Result<usize, AccessListError> {
        let now = self.clock.now();
        let mut lists = self.lists.write().await;

        let mut next = lists.clone();
        let mut removed: Vec<(ListKind, AccessEntry)> = Vec::new();
        for kind in [ListKind::Allow, ListKind::Deny] {
            let (expired, live): (Vec<_>, Vec<_>) = next
                .get_mut(kind)
                .drain(..)
                .partition(|e| e.is_expired(now));
            *next.get_mut(kind) = live;
            removed.extend(expired.into_iter().map(|e| (kind, e)));
        }
        if removed.is_empty() {
            return Ok(0);
        }

        self.commit(&mut lists, next, now, "access_entry_expired", "system", "expired entries")
            .await?;

        for (kind, entry) in &removed {
            self.audit.log_event(
                AuditEvent::new("access_entry_expired", "system", &entry.pattern)
                    .detail("list", kind.label()),
            );
        }
        info!(removed = removed.len(), "expired access entries removed");
        Ok(removed.len())
    }

    /// Write `next` to the proxy config and swap it in. On failure the
    /// current lists stay untouched and the failure is audited.
    async fn commit(
        &self,
        current: &mut AccessLists,
        next: AccessLists,
        now: DateTime<Utc>,
        action: &str,
        actor: &str,
        resource: &str,
    ) -> Result<(), AccessListError> {
        if let Err(e) = self.proxy.write(&next.live_allow_ranges(now), now).await {
            warn!(action, error = %e, "proxy config sync failed, mutation discarded");
            self.audit
                .log_event(AuditEvent::new(action, actor, resource).failed(e.as_str()));
            return Err(AccessListError::Sync(e));
        }
        *current = next;
        Ok(())
    }
}
