// tests/common/mod.rs

//! Shared test utilities: substitute capabilities and a pipeline harness.

#![allow(dead_code)]

use autodeb::build::{BuildRequest, Builder, ExecutionContext};
use autodeb::cancel::CancelFlag;
use autodeb::config::StateConfig;
use autodeb::monitor::IndexFetcher;
use autodeb::notify::{Dispatcher, Mark, Notifier, ReportLine};
use autodeb::pipeline::{BuildPlan, PipelineOrchestrator, PipelineOutcome, PipelineSettings};
use autodeb::prepare::Preparer;
use autodeb::publish::{Publisher, StagingReport};
use autodeb::state::{AutoRefs, BuildAttempt, DetectionRecord, StateStore};
use autodeb::{Error, Result, UpstreamVersion};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const FILES_URL: &str = "https://example.org/ppa/bookworm";

/// Preparer creating refs without touching git
#[derive(Default)]
pub struct FakePreparer {
    pub prepared: Mutex<Vec<String>>,
    pub pushed: Mutex<Vec<String>>,
    /// Versions whose merge conflicts
    pub conflicts: Mutex<HashSet<String>>,
    /// Commit the automated branch points to, as seen by `resolve`
    pub head: Mutex<Option<String>>,
    pub push_fails: AtomicBool,
    /// Error returned by the working tree check
    pub check_error: Mutex<Option<String>>,
}

impl FakePreparer {
    pub fn conflict_on(&self, version: &str) {
        self.conflicts.lock().unwrap().insert(version.to_string());
    }

    pub fn prepared(&self) -> Vec<String> {
        self.prepared.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

impl Preparer for FakePreparer {
    fn check(&self) -> Result<()> {
        match self.check_error.lock().unwrap().clone() {
            Some(detail) => Err(Error::ConfigError(detail)),
            None => Ok(()),
        }
    }

    fn prepare(&self, version: &UpstreamVersion) -> Result<AutoRefs> {
        if self.conflicts.lock().unwrap().contains(version.as_str()) {
            return Err(Error::MergeConflict {
                version: version.to_string(),
                detail: "CONFLICT (content): Merge conflict in debian/control".to_string(),
            });
        }
        self.prepared.lock().unwrap().push(version.to_string());
        let commit = format!("c0ffee{}", version.as_str().replace('.', ""));
        *self.head.lock().unwrap() = Some(commit.clone());
        Ok(AutoRefs {
            branch: "auto/debian/bookworm".to_string(),
            tag: format!("auto/debian/{}_pirogue1", version),
            commit,
        })
    }

    fn resolve(&self, refs: &AutoRefs) -> Result<String> {
        Ok(self
            .head
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| refs.commit.clone()))
    }

    fn push(&self, refs: &AutoRefs) -> Result<()> {
        if self.push_fails.load(Ordering::SeqCst) {
            return Err(Error::PublishError(format!("Failed to push {}", refs.tag)));
        }
        self.pushed.lock().unwrap().push(refs.tag.clone());
        Ok(())
    }
}

/// Builder succeeding unless told otherwise, recording every call
#[derive(Default)]
pub struct FakeBuilder {
    pub calls: Mutex<Vec<(String, String)>>,
    /// Architectures that fail, and with which detail
    pub failing: Mutex<HashMap<String, String>>,
    /// Cancel this flag once the given architecture was built
    pub cancel_after: Mutex<Option<(String, CancelFlag)>>,
}

impl FakeBuilder {
    pub fn fail(&self, arch: &str, detail: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(arch.to_string(), detail.to_string());
    }

    pub fn heal(&self, arch: &str) {
        self.failing.lock().unwrap().remove(arch);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn archs_built(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, arch)| arch).collect()
    }
}

impl Builder for FakeBuilder {
    fn build(&self, request: &BuildRequest) -> BuildAttempt {
        self.calls
            .lock()
            .unwrap()
            .push((request.version.to_string(), request.arch.clone()));

        if let Some((arch, flag)) = self.cancel_after.lock().unwrap().as_ref() {
            if *arch == request.arch {
                flag.cancel();
            }
        }

        if let Some(detail) = self.failing.lock().unwrap().get(&request.arch) {
            return BuildAttempt::failure(
                &request.arch,
                request.execution_context.clone(),
                &request.refs.commit,
                detail.clone(),
            );
        }
        let deb = PathBuf::from(format!(
            "/build/frida_{}_{}.deb",
            request.full_version, request.arch
        ));
        BuildAttempt::success(
            &request.arch,
            request.execution_context.clone(),
            &request.refs.commit,
            vec![deb],
        )
    }
}

/// Publisher recording what it was asked to stage
#[derive(Default)]
pub struct FakePublisher {
    pub staged: Mutex<Vec<PathBuf>>,
    pub fails: AtomicBool,
}

impl FakePublisher {
    pub fn staged(&self) -> Vec<PathBuf> {
        self.staged.lock().unwrap().clone()
    }
}

impl Publisher for FakePublisher {
    fn stage(&self, artifacts: &[PathBuf]) -> Result<StagingReport> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(Error::PublishError("No space left on device".to_string()));
        }
        let mut report = StagingReport::default();
        for artifact in artifacts {
            self.staged.lock().unwrap().push(artifact.clone());
            let name = artifact
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            report.files.push(ReportLine::staged(name, Mark::Success));
        }
        Ok(report)
    }
}

/// Notifier keeping every delivered message
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn contents(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, content)| content.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn send(&self, topic: &str, content: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), content.to_string()));
        Ok(())
    }
}

/// Index fetcher serving canned content, unknown URLs are unreachable
#[derive(Default)]
pub struct MapFetcher {
    pub indices: Mutex<HashMap<String, Vec<u8>>>,
}

impl MapFetcher {
    pub fn serve(&self, url: &str, content: &str) {
        self.indices
            .lock()
            .unwrap()
            .insert(url.to_string(), content.as_bytes().to_vec());
    }

    pub fn remove(&self, url: &str) {
        self.indices.lock().unwrap().remove(url);
    }
}

impl IndexFetcher for MapFetcher {
    fn fetch_index(&self, url: &str) -> Result<Vec<u8>> {
        self.indices
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::DownloadError(format!("{}: connection refused", url)))
    }
}

/// Build plans: the first architecture direct, the others isolated
pub fn build_plans(archs: &[&str]) -> Vec<BuildPlan> {
    archs
        .iter()
        .enumerate()
        .map(|(i, arch)| BuildPlan {
            arch: arch.to_string(),
            execution_context: if i == 0 {
                ExecutionContext::Direct
            } else {
                ExecutionContext::Isolated {
                    wrapper: "qemu-sbuild-wrapper".to_string(),
                }
            },
            timeout: Duration::from_secs(3600),
        })
        .collect()
}

pub fn detection(pending: &[&str]) -> DetectionRecord {
    DetectionRecord {
        latest_upstream: pending.last().copied().unwrap_or("16.4.6").to_string(),
        packaged_upstream: "16.4.6".to_string(),
        packaged_debian: Some("16.4.6~pirogue1".to_string()),
        packaged_tag: Some("debian/16.4.6_pirogue1".to_string()),
        pending: pending.iter().map(|v| v.to_string()).collect(),
    }
}

pub fn version(v: &str) -> UpstreamVersion {
    UpstreamVersion::parse(v).unwrap()
}

/// State store plus substitute capabilities for orchestrator tests
pub struct Harness {
    pub dir: TempDir,
    pub archs: Vec<String>,
    pub store: StateStore,
    pub preparer: FakePreparer,
    pub builder: FakeBuilder,
    pub publisher: FakePublisher,
    pub notifier: RecordingNotifier,
    pub dispatcher: Dispatcher,
    pub cancel: CancelFlag,
}

impl Harness {
    /// Fresh store whose last detection lists `pending`
    pub fn new(archs: &[&str], pending: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let archs: Vec<String> = archs.iter().map(|a| a.to_string()).collect();
        let mut store = StateStore::open(&Self::state_config_in(&dir), archs.clone()).unwrap();
        store.set_detection(detection(pending)).unwrap();

        let notifier = RecordingNotifier::default();
        let dispatcher = Dispatcher::new(Box::new(notifier.clone()));
        Self {
            dir,
            archs,
            store,
            preparer: FakePreparer::default(),
            builder: FakeBuilder::default(),
            publisher: FakePublisher::default(),
            notifier,
            dispatcher,
            cancel: CancelFlag::new(),
        }
    }

    fn state_config_in(dir: &TempDir) -> StateConfig {
        StateConfig {
            path: dir.path().join("state.json"),
        }
    }

    pub fn state_config(&self) -> StateConfig {
        Self::state_config_in(&self.dir)
    }

    pub fn settings(&self) -> PipelineSettings {
        let archs: Vec<&str> = self.archs.iter().map(String::as_str).collect();
        PipelineSettings {
            builds: build_plans(&archs),
            version_suffix: "~pirogue1".to_string(),
            files_url: FILES_URL.to_string(),
            reference_version: None,
        }
    }

    pub fn orchestrator(&mut self) -> PipelineOrchestrator<'_> {
        let settings = self.settings();
        PipelineOrchestrator::new(
            &mut self.store,
            &self.preparer,
            &self.builder,
            &self.publisher,
            &self.dispatcher,
            settings,
            self.cancel.clone(),
        )
    }

    pub fn run_next(&mut self) -> PipelineOutcome {
        self.orchestrator().run_next().unwrap()
    }

    /// Reopen the store from disk
    pub fn reopen(&self) -> StateStore {
        StateStore::open(&self.state_config(), self.archs.clone()).unwrap()
    }

    pub fn messages(&self) -> Vec<String> {
        self.notifier.contents()
    }
}
