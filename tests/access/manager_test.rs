//! Tests for `src/access/mod.rs`: matching, precedence, proxy sync and
//! expiry.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use harbormaster::access::{AccessListError, AccessListManager, Clock, ListKind, ManualClock};
use harbormaster::audit::AuditTrail;
use harbormaster::config::AccessConfig;

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedBuf {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
    }

    fn contents(&self) -> String {
        let cursor = self.0.lock().expect("test lock");
        String::from_utf8_lossy(cursor.get_ref()).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().expect("test lock").flush()
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    path: PathBuf,
    clock: Arc<ManualClock>,
    audit: SharedBuf,
    manager: AccessListManager,
}

async fn fixture_at(tmp: tempfile::TempDir, path: PathBuf) -> Fixture {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0)
            .single()
            .expect("valid time"),
    ));
    let audit = SharedBuf::new();
    let config = AccessConfig {
        proxy_config_path: path.clone(),
        middleware: "dynamic-ipallowlist".to_owned(),
    };
    let manager = AccessListManager::open(
        &config,
        Arc::new(AuditTrail::from_writer(Box::new(audit.clone()))),
        clock.clone(),
    )
    .await
    .expect("open manager");
    Fixture {
        _tmp: tmp,
        path,
        clock,
        audit,
        manager,
    }
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("dynamic").join("proxy.toml");
    fixture_at(tmp, path).await
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).expect("proxy config readable")
}

#[tokio::test]
async fn add_then_query_single_address() {
    let f = fixture().await;
    f.manager
        .add_to_allow("203.0.113.5/32", "eng laptop", "ops", None)
        .await
        .expect("add");

    let entries = f.manager.list_allow().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pattern, "203.0.113.5/32");
    assert_eq!(entries[0].description, "eng laptop");
    assert_eq!(entries[0].added_by, "ops");
    assert!(entries[0].expires_at.is_none());

    assert!(f.manager.is_allowed("203.0.113.5").await);
    assert!(!f.manager.is_allowed("203.0.113.6").await);

    let file = read(&f.path);
    assert!(file.contains("# Last updated: 2026-10-19T12:00:00+00:00"));
    assert!(file.contains("\"203.0.113.5/32\""));
    assert!(f.audit.contents().contains("\"action\":\"allowlist_add\""));
}

#[tokio::test]
async fn mapped_ipv6_caller_hits_ipv4_deny_entry() {
    let f = fixture().await;
    f.manager
        .add_to_allow("198.51.100.0/24", "", "ops", None)
        .await
        .expect("allow");
    assert!(f.manager.is_allowed("::ffff:198.51.100.7").await);

    f.manager
        .add_to_deny("198.51.100.7", "", "ops", None)
        .await
        .expect("deny");
    assert!(!f.manager.is_allowed("::ffff:198.51.100.7").await);
}

#[tokio::test]
async fn unknown_and_malformed_addresses_are_refused() {
    let f = fixture().await;
    assert!(!f.manager.is_allowed("198.51.100.1").await);
    assert!(!f.manager.is_allowed("not an ip").await);
}

#[tokio::test]
async fn deny_wins_over_allow() {
    let cases = [
        ("198.51.100.7", "198.51.100.7"),
        ("198.51.100.0/24", "198.51.100.7"),
        ("198.51.100.7", "198.51.100.0/24"),
        ("198.51.0.0/16", "198.51.100.0/24"),
    ];
    for (allow, deny) in cases {
        let f = fixture().await;
        f.manager
            .add_to_allow(allow, "", "ops", None)
            .await
            .expect("allow");
        f.manager.add_to_deny(deny, "", "ops", None).await.expect("deny");
        assert!(
            !f.manager.is_allowed("198.51.100.7").await,
            "allow {allow} / deny {deny}"
        );
    }
}

#[tokio::test]
async fn duplicate_add_fails_and_changes_nothing() {
    let f = fixture().await;
    f.manager
        .add_to_allow("10.0.0.0/8", "office", "ops", None)
        .await
        .expect("first add");
    let before = read(&f.path);
    f.clock.advance(Duration::minutes(5));

    let err = f
        .manager
        .add_to_allow("10.0.0.0/8", "again", "ops", None)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, AccessListError::Validation(_)));

    assert_eq!(read(&f.path), before, "file untouched");
    let entries = f.manager.list_allow().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].description, "office");
}

#[tokio::test]
async fn allow_and_deny_are_separate_namespaces() {
    let f = fixture().await;
    f.manager
        .add_to_allow("192.0.2.1", "", "ops", None)
        .await
        .expect("allow");
    f.manager
        .add_to_deny("192.0.2.1", "", "ops", None)
        .await
        .expect("same pattern in the other list");
    assert_eq!(f.manager.list(ListKind::Allow).await.len(), 1);
    assert_eq!(f.manager.list(ListKind::Deny).await.len(), 1);
}

#[tokio::test]
async fn malformed_pattern_is_a_validation_error() {
    let f = fixture().await;
    for raw in ["", "10.0.0.300", "example.com", "10.0.0.0/40"] {
        let err = f
            .manager
            .add_to_allow(raw, "", "ops", None)
            .await
            .expect_err("invalid");
        assert!(matches!(err, AccessListError::Validation(_)), "{raw}");
    }
    assert!(!f.path.exists(), "nothing synced");
}

#[tokio::test]
async fn past_expiry_is_rejected() {
    let f = fixture().await;
    let past = f.clock.now() - Duration::minutes(1);
    let err = f
        .manager
        .add_to_allow("10.1.1.1", "", "ops", Some(past))
        .await
        .expect_err("past expiry");
    assert!(matches!(err, AccessListError::Validation(_)));
}

#[tokio::test]
async fn expired_entries_stop_matching_and_are_swept() {
    let f = fixture().await;
    let expiry = f.clock.now() + Duration::hours(1);
    f.manager
        .add_to_allow("203.0.113.9", "contractor", "ops", Some(expiry))
        .await
        .expect("add");
    f.manager
        .add_to_allow("203.0.113.10", "permanent", "ops", None)
        .await
        .expect("add");
    assert!(f.manager.is_allowed("203.0.113.9").await);

    f.clock.advance(Duration::hours(2));
    assert!(!f.manager.is_allowed("203.0.113.9").await);
    assert!(f.manager.is_allowed("203.0.113.10").await);

    assert_eq!(f.manager.cleanup_expired().await.expect("cleanup"), 1);
    assert_eq!(f.manager.list_allow().await.len(), 1);
    let file = read(&f.path);
    assert!(!file.contains("203.0.113.9\""));
    assert!(file.contains("203.0.113.10"));

    let audit = f.audit.contents();
    assert_eq!(audit.matches("\"action\":\"access_entry_expired\"").count(), 1);

    assert_eq!(f.manager.cleanup_expired().await.expect("cleanup"), 0);
}

#[tokio::test]
async fn remove_missing_entry_is_not_found() {
    let f = fixture().await;
    let err = f
        .manager
        .remove_from_deny("192.0.2.44", "ops")
        .await
        .expect_err("absent");
    assert!(matches!(err, AccessListError::NotFound { list: "denylist", .. }));
}

#[tokio::test]
async fn remove_resyncs_file() {
    let f = fixture().await;
    f.manager
        .add_to_allow("192.0.2.8", "", "ops", None)
        .await
        .expect("add");
    let removed = f
        .manager
        .remove_from_allow("192.0.2.8", "ops")
        .await
        .expect("remove");
    assert_eq!(removed.pattern, "192.0.2.8");
    assert!(!read(&f.path).contains("192.0.2.8"));
    assert!(!f.manager.is_allowed("192.0.2.8").await);
}

#[tokio::test]
async fn failed_sync_rolls_back_add() {
    let f = fixture().await;
    // A non-empty directory where the file should go makes the rename fail.
    std::fs::create_dir_all(&f.path).expect("dir in place of file");
    std::fs::write(f.path.join("keep"), b"x").expect("occupy dir");

    let err = f
        .manager
        .add_to_allow("203.0.113.5", "", "ops", None)
        .await
        .expect_err("sync must fail");
    assert!(matches!(err, AccessListError::Sync(_)));
    assert!(f.manager.list_allow().await.is_empty());
    assert!(!f.manager.is_allowed("203.0.113.5").await);
    assert!(f.audit.contents().contains("\"success\":false"));
    assert!(
        !f.path.with_extension("toml.tmp").exists(),
        "temp file cleaned up"
    );
}

#[tokio::test]
async fn failed_sync_rolls_back_remove() {
    let f = fixture().await;
    f.manager
        .add_to_allow("203.0.113.5", "", "ops", None)
        .await
        .expect("add");

    // Replace the file with a non-empty directory so the rename fails.
    std::fs::remove_file(&f.path).expect("remove file");
    std::fs::create_dir(&f.path).expect("dir in place of file");
    std::fs::write(f.path.join("keep"), b"x").expect("occupy dir");

    let err = f
        .manager
        .remove_from_allow("203.0.113.5", "ops")
        .await
        .expect_err("sync must fail");
    assert!(matches!(err, AccessListError::Sync(_)));
    assert!(f.manager.is_allowed("203.0.113.5").await);
}

#[tokio::test]
async fn open_seeds_allow_list_from_existing_file() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("proxy.toml");
    std::fs::write(
        &path,
        "# hand written\n[http.middlewares.dynamic-ipallowlist.ipAllowList]\n\
         sourceRange = [\"10.0.0.0/8\", \"bogus\", \"10.0.0.0/8\", \"192.0.2.1\"]\n",
    )
    .expect("seed file");

    let f = fixture_at(tmp, path).await;
    let entries = f.manager.list_allow().await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.added_by == "system"));
    assert!(f.manager.is_allowed("10.20.30.40").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mutations_keep_file_and_memory_in_step() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("proxy.toml");
    let config = AccessConfig {
        proxy_config_path: path.clone(),
        middleware: "dynamic-ipallowlist".to_owned(),
    };
    let manager = Arc::new(
        AccessListManager::open(
            &config,
            Arc::new(AuditTrail::tracing_only()),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .await
        .expect("open manager"),
    );

    const N: u8 = 32;
    let mut tasks = Vec::new();
    for i in 0..N {
        let m = manager.clone();
        tasks.push(tokio::spawn(async move {
            m.add_to_deny(&format!("198.51.100.{i}"), "", "ops", None)
                .await
                .map(|_| ())
        }));
        let m = manager.clone();
        tasks.push(tokio::spawn(async move {
            m.add_to_allow(&format!("203.0.113.{i}"), "", "ops", None)
                .await
                .map(|_| ())
        }));
        let m = manager.clone();
        tasks.push(tokio::spawn(async move {
            let _ = m.is_allowed(&format!("203.0.113.{i}")).await;
            let _ = m.list_deny().await;
            Ok(())
        }));
    }
    for task in tasks {
        task.await.expect("task joined").expect("mutation succeeds");
    }

    assert_eq!(manager.list_deny().await.len(), usize::from(N));
    let mut live: Vec<String> = manager
        .list_allow()
        .await
        .into_iter()
        .map(|e| e.pattern)
        .collect();
    assert_eq!(live.len(), usize::from(N));

    let doc: toml::Value = toml::from_str(&read(&path)).expect("proxy file parses");
    let ranges = &doc["http"]["middlewares"]["dynamic-ipallowlist"]["ipAllowList"]["sourceRange"];
    let mut on_disk: Vec<String> = ranges
        .as_array()
        .expect("sourceRange array")
        .iter()
        .map(|v| v.as_str().expect("string range").to_owned())
        .collect();
    live.sort();
    on_disk.sort();
    assert_eq!(on_disk, live);
}
