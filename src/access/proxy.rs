//! Reverse-proxy dynamic configuration file.
//!
//! The file holds a single IP allow-list middleware:
//!
//! ```toml
//! # Last updated: 2026-10-19T12:00:00+00:00
//! [http.middlewares.dynamic-ipallowlist.ipAllowList]
//! sourceRange = ["203.0.113.5/32"]
//! ```
//!
//! It is replaced wholesale on every write via a temp file and rename, so the
//! proxy never observes a half-written file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProxyDocument {
    #[serde(default)]
    http: HttpSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HttpSection {
    #[serde(default)]
    middlewares: BTreeMap<String, MiddlewareSection>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MiddlewareSection {
    #[serde(
        rename = "ipAllowList",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    ip_allow_list: Option<IpAllowList>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IpAllowList {
    #[serde(rename = "sourceRange", default)]
    source_range: Vec<String>,
}

/// Location and rule name of the proxy's dynamic configuration.
#[derive(Debug, Clone)]
pub(crate) struct ProxyConfigFile {
    path: PathBuf,
    middleware: String,
}

impl ProxyConfigFile {
    pub(crate) fn new(path: impl Into<PathBuf>, middleware: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            middleware: middleware.into(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Render the full file contents.
    pub(crate) fn render(
        &self,
        ranges: &[String],
        updated: DateTime<Utc>,
    ) -> Result<String, toml::ser::Error> {
        let mut doc = ProxyDocument::default();
        doc.http.middlewares.insert(
            self.middleware.clone(),
            MiddlewareSection {
                ip_allow_list: Some(IpAllowList {
                    source_range: ranges.to_vec(),
                }),
            },
        );
        let body = toml::to_string(&doc)?;
        Ok(format!(
            "# Reverse proxy dynamic configuration: IP allow list.\n\
             # Managed by harbormaster. Manual edits are overwritten.\n\
             # Last updated: {}\n\n{body}",
            updated.to_rfc3339()
        ))
    }

    /// Replace the file with `ranges`.
    pub(crate) async fn write(
        &self,
        ranges: &[String],
        updated: DateTime<Utc>,
    ) -> Result<(), String> {
        let contents = self
            .render(ranges, updated)
            .map_err(|e| format!("failed to render proxy config: {e}"))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp_path, contents.as_bytes())
            .await
            .map_err(|e| format!("failed to write {}: {e}", tmp_path.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
                debug!(path = %tmp_path.display(), error = %cleanup, "stale temp file left");
            }
            return Err(format!("failed to replace {}: {e}", self.path.display()));
        }

        debug!(path = %self.path.display(), ranges = ranges.len(), "proxy config updated");
        Ok(())
    }

    /// Read the `sourceRange` of our middleware. A missing file is empty.
    pub(crate) async fn read_ranges(&self) -> Result<Vec<String>, String> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("failed to read {}: {e}", self.path.display())),
        };
        self.parse_ranges(&contents)
    }

    fn parse_ranges(&self, contents: &str) -> Result<Vec<String>, String> {
        let doc: ProxyDocument = toml::from_str(contents)
            .map_err(|e| format!("failed to parse {}: {e}", self.path.display()))?;
        Ok(doc
            .http
            .middlewares
            .get(&self.middleware)
            .and_then(|m| m.ip_allow_list.as_ref())
            .map(|list| list.source_range.clone())
            .unwrap_or_default())
    }
}
