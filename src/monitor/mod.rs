// src/monitor/mod.rs

//! Drift monitor for packages published by external repositories
//!
//! Each monitoring target names one package in one
//! `(repository, suite, component, architecture)` index. A run fetches every
//! distinct index once, looks up the tracked packages and compares their
//! `Version` and `Depends` fields with the last snapshot. Only those two
//! fields count: a rebuilt package with a new size or checksum but the same
//! version and dependencies is not reported.
//!
//! Snapshots are updated whether or not a report is emitted. An index that
//! cannot be fetched or parsed is skipped and left untouched for the next
//! run; the other indices are still processed.

mod snapshot;

pub use snapshot::{PackageSnapshot, SnapshotStore};

use crate::compression::decompress_index;
use crate::config::MonitoringConfig;
use crate::deb822::{Stanza, parse_stanzas};
use crate::error::{Error, Result};
use crate::http::HttpClient;
use crate::notify::{Dispatcher, FailureReport, Message};
use crate::version::DebianVersion;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Operation name used in failure messages
pub const MONITOR_OPERATION: &str = "Package monitoring";

/// One tracked package in one repository index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitoringTarget {
    pub repo: String,
    pub url: String,
    pub suite: String,
    pub component: String,
    pub arch: String,
    pub packages_index: String,
    pub package: String,
}

impl MonitoringTarget {
    /// Expand the configured repositories into individual targets
    pub fn from_config(config: &MonitoringConfig) -> Vec<Self> {
        let mut targets = Vec::new();
        for repo in &config.repos {
            for suite in &repo.suites {
                for component in &repo.components {
                    for arch in &repo.architectures {
                        for package in &repo.packages {
                            targets.push(Self {
                                repo: repo.name.clone(),
                                url: repo.url.trim_end_matches('/').to_string(),
                                suite: suite.clone(),
                                component: component.clone(),
                                arch: arch.clone(),
                                packages_index: repo.packages_index.clone(),
                                package: package.clone(),
                            });
                        }
                    }
                }
            }
        }
        targets
    }

    pub fn index_url(&self) -> String {
        format!(
            "{}/dists/{}/{}/binary-{}/{}",
            self.url, self.suite, self.component, self.arch, self.packages_index
        )
    }

    /// Snapshot key: `repo/suite/component/arch/package`, with the
    /// repository name lowercased and spaces replaced
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.repo.replace(' ', "-").to_lowercase(),
            self.suite,
            self.component,
            self.arch,
            self.package
        )
    }

    /// Download link for a pool path
    pub fn file_url(&self, filename: &str) -> String {
        format!("{}/{}", self.url, filename)
    }
}

/// Source of raw package indices
pub trait IndexFetcher: Send + Sync {
    fn fetch_index(&self, url: &str) -> Result<Vec<u8>>;
}

impl IndexFetcher for HttpClient {
    fn fetch_index(&self, url: &str) -> Result<Vec<u8>> {
        self.fetch(url)
    }
}

/// Observed change of a tracked package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    pub target: MonitoringTarget,

    /// Previous snapshot, absent the first time a package is seen
    pub old: Option<PackageSnapshot>,
    pub new: PackageSnapshot,

    /// Download link per dependency, when the dependency is in the same index
    pub dependency_urls: BTreeMap<String, Option<String>>,
}

impl DiffReport {
    pub fn download_url(&self) -> String {
        self.target.file_url(&self.new.filename)
    }
}

/// Outcome of one monitor pass
#[derive(Debug, Default)]
pub struct MonitorRun {
    pub reports: Vec<DiffReport>,

    /// Index URLs that could not be fetched or parsed
    pub failed_indices: Vec<String>,
}

impl MonitorRun {
    pub fn is_complete(&self) -> bool {
        self.failed_indices.is_empty()
    }

    /// Send each drift report, then one summary of the skipped indices
    pub fn dispatch(&self, dispatcher: &Dispatcher) {
        for report in &self.reports {
            dispatcher.dispatch(&Message::Drift(report.clone()));
        }
        if !self.is_complete() {
            let errors = self
                .failed_indices
                .iter()
                .map(|url| format!("{} could not be fetched or parsed", url))
                .collect();
            dispatcher.dispatch(&Message::Failure(FailureReport {
                operation: MONITOR_OPERATION.to_string(),
                errors,
            }));
        }
    }
}

/// Newest stanza per package of a single index
struct PackageIndex {
    latest: HashMap<String, Stanza>,
}

impl PackageIndex {
    fn parse(content: &str) -> Result<Self> {
        let mut latest: HashMap<String, Stanza> = HashMap::new();
        for stanza in parse_stanzas(content)? {
            let Some(name) = stanza.get("Package").map(str::to_string) else {
                continue;
            };
            let newer = match latest.get(&name) {
                Some(existing) => is_newer(&stanza, existing),
                None => true,
            };
            if newer {
                latest.insert(name, stanza);
            }
        }
        Ok(Self { latest })
    }

    fn get(&self, package: &str) -> Option<&Stanza> {
        self.latest.get(package)
    }

    fn filename(&self, package: &str) -> Option<&str> {
        self.latest.get(package).and_then(|s| s.get("Filename"))
    }
}

/// Later stanzas win when versions cannot be compared
fn is_newer(candidate: &Stanza, existing: &Stanza) -> bool {
    let parse = |s: &Stanza| s.get("Version").map(DebianVersion::parse);
    match (parse(candidate), parse(existing)) {
        (Some(Ok(a)), Some(Ok(b))) => a >= b,
        _ => true,
    }
}

/// Compares external indices against the snapshot store
pub struct DriftMonitor<'a> {
    fetcher: &'a dyn IndexFetcher,
    snapshots: SnapshotStore,
}

impl<'a> DriftMonitor<'a> {
    pub fn new(fetcher: &'a dyn IndexFetcher, snapshots: SnapshotStore) -> Self {
        Self { fetcher, snapshots }
    }

    /// Check every target once
    ///
    /// Only snapshot write failures are returned as errors; unreachable or
    /// malformed indices are listed in [`MonitorRun::failed_indices`].
    pub fn run(&mut self, targets: &[MonitoringTarget]) -> Result<MonitorRun> {
        let mut groups: BTreeMap<String, Vec<&MonitoringTarget>> = BTreeMap::new();
        for target in targets {
            groups.entry(target.index_url()).or_default().push(target);
        }

        let mut run = MonitorRun::default();
        for (url, group) in groups {
            let index = match self.load_index(&url, &group[0].packages_index) {
                Ok(index) => index,
                Err(e) => {
                    warn!("Skipping {}: {}", url, e);
                    run.failed_indices.push(url);
                    continue;
                }
            };

            for target in group {
                if let Some(report) = self.compare(target, &index) {
                    run.reports.push(report);
                }
            }
            self.snapshots.save()?;
        }

        info!(
            "Monitoring pass done: {} changes, {} unavailable indices",
            run.reports.len(),
            run.failed_indices.len()
        );
        Ok(run)
    }

    fn load_index(&self, url: &str, name: &str) -> Result<PackageIndex> {
        debug!("Fetching index {}", url);
        let raw = self.fetcher.fetch_index(url)?;
        let data = decompress_index(name, &raw)?;
        let content = String::from_utf8(data)
            .map_err(|e| Error::ParseError(format!("Index {} is not UTF-8: {}", url, e)))?;
        PackageIndex::parse(&content)
    }

    fn compare(&mut self, target: &MonitoringTarget, index: &PackageIndex) -> Option<DiffReport> {
        let Some(stanza) = index.get(&target.package) else {
            warn!("{} is not listed in {}", target.package, target.index_url());
            return None;
        };
        let new = match PackageSnapshot::from_stanza(stanza) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring {} in {}: {}", target.package, target.index_url(), e);
                return None;
            }
        };

        let key = target.key();
        let old = self.snapshots.get(&key).cloned();
        self.snapshots.update(key, new.clone());

        if old.as_ref().is_some_and(|old| !new.drifted_from(old)) {
            debug!("{}: unchanged at {}", target.key(), new.version);
            return None;
        }

        info!(
            "{}: {} → {}",
            target.key(),
            old.as_ref().map(|o| o.version.as_str()).unwrap_or("none"),
            new.version
        );
        let dependency_urls = new
            .depends
            .iter()
            .map(|dep| {
                let url = index.filename(dep).map(|f| target.file_url(f));
                (dep.clone(), url)
            })
            .collect();

        Some(DiffReport {
            target: target.clone(),
            old,
            new,
            dependency_urls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitoredRepo;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct MapFetcher(Mutex<HashMap<String, Vec<u8>>>);

    impl MapFetcher {
        fn new() -> Self {
            Self(Mutex::new(HashMap::new()))
        }

        fn serve(&self, url: &str, content: &str) {
            self.0
                .lock()
                .unwrap()
                .insert(url.to_string(), content.as_bytes().to_vec());
        }
    }

    impl IndexFetcher for MapFetcher {
        fn fetch_index(&self, url: &str) -> Result<Vec<u8>> {
            self.0
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| Error::DownloadError(format!("HTTP 404 from {}", url)))
        }
    }

    fn config() -> MonitoringConfig {
        MonitoringConfig {
            work_dir: "unused".into(),
            repos: vec![MonitoredRepo {
                name: "Raspberry OS".to_string(),
                url: "https://archive.example.org/debian/".to_string(),
                architectures: vec!["arm64".to_string(), "armhf".to_string()],
                components: vec!["main".to_string()],
                suites: vec!["bookworm".to_string()],
                packages_index: "Packages".to_string(),
                packages: vec!["firmware-brcm80211".to_string()],
            }],
        }
    }

    const ARM64: &str = "https://archive.example.org/debian/dists/bookworm/main/binary-arm64/Packages";

    fn index(version: &str, size: u32) -> String {
        format!(
            "Package: firmware-brcm80211\n\
             Version: {version}\n\
             Depends: firmware-misc-nonfree (>= 1:20230625)\n\
             Filename: pool/main/f/firmware-brcm80211_{version}_all.deb\n\
             Size: {size}\n\
             \n\
             Package: firmware-misc-nonfree\n\
             Version: 1:20230625-2+rpt3\n\
             Filename: pool/main/f/firmware-misc-nonfree_20230625-2+rpt3_all.deb\n"
        )
    }

    #[test]
    fn test_targets_from_config() {
        let targets = MonitoringTarget::from_config(&config());
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].index_url(), ARM64);
        assert_eq!(
            targets[0].key(),
            "raspberry-os/bookworm/main/arm64/firmware-brcm80211"
        );
    }

    #[test]
    fn test_first_sighting_then_suppression() {
        let dir = TempDir::new().unwrap();
        let fetcher = MapFetcher::new();
        fetcher.serve(ARM64, &index("1:20230625-2+rpt2", 100));
        let targets = &MonitoringTarget::from_config(&config())[..1];

        let mut monitor = DriftMonitor::new(&fetcher, SnapshotStore::open(dir.path()).unwrap());
        let run = monitor.run(targets).unwrap();
        assert_eq!(run.reports.len(), 1);
        assert!(run.reports[0].old.is_none());
        assert_eq!(
            run.reports[0].dependency_urls["firmware-misc-nonfree"].as_deref(),
            Some("https://archive.example.org/debian/pool/main/f/firmware-misc-nonfree_20230625-2+rpt3_all.deb")
        );

        // Same version and dependencies, different size
        fetcher.serve(ARM64, &index("1:20230625-2+rpt2", 200));
        assert!(monitor.run(targets).unwrap().reports.is_empty());
    }

    #[test]
    fn test_newest_stanza_wins() {
        let content = format!("{}\n{}", index("1:20230625-2+rpt3", 1), index("1:20230625-2+rpt2", 1));
        let index = PackageIndex::parse(&content).unwrap();
        assert_eq!(
            index.get("firmware-brcm80211").unwrap().get("Version"),
            Some("1:20230625-2+rpt3")
        );
    }

    #[test]
    fn test_unreachable_index_does_not_stop_the_pass() {
        let dir = TempDir::new().unwrap();
        let fetcher = MapFetcher::new();
        fetcher.serve(ARM64, &index("1:20230625-2+rpt2", 100));
        let targets = MonitoringTarget::from_config(&config());

        let mut monitor = DriftMonitor::new(&fetcher, SnapshotStore::open(dir.path()).unwrap());
        let run = monitor.run(&targets).unwrap();
        assert_eq!(run.reports.len(), 1);
        assert_eq!(run.failed_indices.len(), 1);
        assert!(!run.is_complete());
    }
}
