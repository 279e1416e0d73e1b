// tests/monitor.rs

//! Drift monitor passes against canned package indices.

mod common;

use autodeb::Error;
use autodeb::config::{MonitoredRepo, MonitoringConfig};
use autodeb::monitor::{DriftMonitor, MonitorRun, MonitoringTarget, SnapshotStore};
use autodeb::notify::{Dispatcher, Message};
use common::{MapFetcher, RecordingNotifier};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

const BASE: &str = "https://archive.raspberrypi.com/debian";
const KEY: &str = "raspberry-os/bookworm/main/arm64/firmware-brcm80211";

fn repo(packages_index: &str) -> MonitoringConfig {
    MonitoringConfig {
        work_dir: "monitoring".into(),
        repos: vec![MonitoredRepo {
            name: "Raspberry OS".to_string(),
            url: BASE.to_string(),
            architectures: vec!["arm64".to_string()],
            components: vec!["main".to_string()],
            suites: vec!["bookworm".to_string()],
            packages_index: packages_index.to_string(),
            packages: vec!["firmware-brcm80211".to_string()],
        }],
    }
}

fn index_url(name: &str) -> String {
    format!("{}/dists/bookworm/main/binary-arm64/{}", BASE, name)
}

fn stanza(version: &str, depends: &str, description: &str) -> String {
    format!(
        "Package: firmware-brcm80211\n\
         Version: {version}\n\
         Architecture: all\n\
         Depends: {depends}\n\
         Filename: pool/main/f/firmware-nonfree/firmware-brcm80211_{version}_all.deb\n\
         Description: {description}\n\
         \n\
         Package: firmware-misc-nonfree\n\
         Version: 1:20230625-2+rpt3\n\
         Architecture: all\n\
         Filename: pool/main/f/firmware-nonfree/firmware-misc-nonfree_20230625-2+rpt3_all.deb\n"
    )
}

/// One monitor pass with a fresh store, as `autodeb monitor` does it
fn pass(dir: &Path, fetcher: &MapFetcher, targets: &[MonitoringTarget]) -> MonitorRun {
    let mut monitor = DriftMonitor::new(fetcher, SnapshotStore::open(dir).unwrap());
    monitor.run(targets).unwrap()
}

#[test]
fn test_new_version_is_reported_and_recorded() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages"));
    let deps = "firmware-misc-nonfree (>= 1:20230625)";

    fetcher.serve(&index_url("Packages"), &stanza("1:20230625-2+rpt2", deps, "Broadcom"));
    pass(dir.path(), &fetcher, &targets);

    fetcher.serve(&index_url("Packages"), &stanza("1:20230625-2+rpt3", deps, "Broadcom"));
    let run = pass(dir.path(), &fetcher, &targets);
    assert!(run.is_complete());
    assert_eq!(run.reports.len(), 1);

    let report = &run.reports[0];
    assert_eq!(report.old.as_ref().unwrap().version, "1:20230625-2+rpt2");
    assert_eq!(report.new.version, "1:20230625-2+rpt3");
    assert_eq!(
        report.download_url(),
        format!(
            "{}/pool/main/f/firmware-nonfree/firmware-brcm80211_1:20230625-2+rpt3_all.deb",
            BASE
        )
    );

    let notifier = RecordingNotifier::default();
    let dispatcher = Dispatcher::new(Box::new(notifier.clone()));
    dispatcher.dispatch(&Message::Drift(report.clone()));
    let messages = notifier.contents();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("**Package monitoring: updated firmware-brcm80211**"));
    assert!(messages[0].contains("- Repository: Raspberry OS"));
    assert!(messages[0].contains("- Version: `1:20230625-2+rpt2` → `1:20230625-2+rpt3`"));
    assert!(messages[0].contains("firmware-misc-nonfree_20230625-2+rpt3_all.deb"));

    let store = SnapshotStore::open(dir.path()).unwrap();
    assert_eq!(store.get(KEY).unwrap().version, "1:20230625-2+rpt3");
}

#[test]
fn test_unrelated_metadata_changes_are_suppressed() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages"));
    let deps = "firmware-misc-nonfree";

    fetcher.serve(&index_url("Packages"), &stanza("1:20230625-2+rpt2", deps, "Broadcom"));
    let first = pass(dir.path(), &fetcher, &targets);
    assert_eq!(first.reports.len(), 1);
    assert!(first.reports[0].old.is_none());

    fetcher.serve(
        &index_url("Packages"),
        &stanza("1:20230625-2+rpt2", deps, "Binary firmware for Broadcom chips"),
    );
    assert!(pass(dir.path(), &fetcher, &targets).reports.is_empty());
}

#[test]
fn test_dependency_change_is_reported() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages"));

    fetcher.serve(
        &index_url("Packages"),
        &stanza("1:20230625-2+rpt2", "firmware-misc-nonfree", "Broadcom"),
    );
    pass(dir.path(), &fetcher, &targets);

    fetcher.serve(
        &index_url("Packages"),
        &stanza(
            "1:20230625-2+rpt2",
            "firmware-misc-nonfree, wireless-regdb | crda",
            "Broadcom",
        ),
    );
    let run = pass(dir.path(), &fetcher, &targets);
    assert_eq!(run.reports.len(), 1);
    let report = &run.reports[0];
    assert_eq!(
        report.new.depends,
        vec!["firmware-misc-nonfree", "wireless-regdb | crda"]
    );
    assert!(report.dependency_urls["firmware-misc-nonfree"].is_some());
    assert!(report.dependency_urls["wireless-regdb | crda"].is_none());
}

#[test]
fn test_compressed_index() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages.gz"));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(stanza("1:20230625-2+rpt2", "firmware-misc-nonfree", "Broadcom").as_bytes())
        .unwrap();
    let compressed = encoder.finish().unwrap();
    fetcher
        .indices
        .lock()
        .unwrap()
        .insert(index_url("Packages.gz"), compressed);

    let run = pass(dir.path(), &fetcher, &targets);
    assert_eq!(run.reports.len(), 1);
    assert_eq!(run.reports[0].new.version, "1:20230625-2+rpt2");
}

#[test]
fn test_unreachable_index_keeps_snapshots() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages"));

    fetcher.serve(
        &index_url("Packages"),
        &stanza("1:20230625-2+rpt2", "firmware-misc-nonfree", "Broadcom"),
    );
    pass(dir.path(), &fetcher, &targets);

    fetcher.remove(&index_url("Packages"));
    let run = pass(dir.path(), &fetcher, &targets);
    assert!(!run.is_complete());
    assert_eq!(run.failed_indices, vec![index_url("Packages")]);
    assert!(run.reports.is_empty());

    let store = SnapshotStore::open(dir.path()).unwrap();
    assert_eq!(store.get(KEY).unwrap().version, "1:20230625-2+rpt2");
}

#[test]
fn test_unreachable_index_is_reported_once() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages"));
    let notifier = RecordingNotifier::default();
    let dispatcher = Dispatcher::new(Box::new(notifier.clone()));

    fetcher.serve(
        &index_url("Packages"),
        &stanza("1:20230625-2+rpt2", "firmware-misc-nonfree", "Broadcom"),
    );
    pass(dir.path(), &fetcher, &targets).dispatch(&dispatcher);
    assert_eq!(notifier.contents().len(), 1);
    assert!(notifier.contents()[0].starts_with("**Package monitoring: new firmware-brcm80211**"));

    fetcher.remove(&index_url("Packages"));
    notifier.messages.lock().unwrap().clear();
    pass(dir.path(), &fetcher, &targets).dispatch(&dispatcher);
    assert_eq!(
        notifier.contents(),
        vec![format!(
            "**❌ Package monitoring failed**\n- {} could not be fetched or parsed",
            index_url("Packages")
        )]
    );
}

#[test]
fn test_missing_package_is_not_a_report() {
    let dir = TempDir::new().unwrap();
    let fetcher = MapFetcher::default();
    let targets = MonitoringTarget::from_config(&repo("Packages"));

    fetcher.serve(
        &index_url("Packages"),
        "Package: raspi-config\nVersion: 20240313\nFilename: pool/main/r/raspi-config.deb\n",
    );
    let run = pass(dir.path(), &fetcher, &targets);
    assert!(run.is_complete());
    assert!(run.reports.is_empty());
}

#[test]
fn test_concurrent_pass_is_refused() {
    let dir = TempDir::new().unwrap();
    let _held = SnapshotStore::open(dir.path()).unwrap();
    assert!(matches!(
        SnapshotStore::open(dir.path()),
        Err(Error::LockHeld(_))
    ));
}
