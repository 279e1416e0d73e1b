// src/notify/message.rs

//! Markdown rendering of pipeline, refresh and drift messages

use crate::monitor::DiffReport;
use std::fmt;

/// Step used for staged files in pipeline reports
pub const PUBLISH_STEP: &str = "publish";

const SEPARATOR: &str = " · ";

/// Per-line status marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Success,
    Warning,
    Failure,
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let emoji = match self {
            Mark::Success => "✅",
            Mark::Warning => "❗",
            Mark::Failure => "❌",
        };
        write!(f, "{}", emoji)
    }
}

/// One line of a pipeline report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub step: String,
    pub mark: Mark,
    pub detail: Option<String>,

    /// Name of a file staged into the pool
    pub file: Option<String>,
}

impl ReportLine {
    pub fn new(step: impl Into<String>, mark: Mark) -> Self {
        Self {
            step: step.into(),
            mark,
            detail: None,
            file: None,
        }
    }

    pub fn with_detail(step: impl Into<String>, mark: Mark, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(step, mark)
        }
    }

    pub fn staged(file: impl Into<String>, mark: Mark) -> Self {
        Self {
            file: Some(file.into()),
            ..Self::new(PUBLISH_STEP, mark)
        }
    }
}

/// Summary of one pipeline run for one version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub version: String,
    pub success: bool,
    pub lines: Vec<ReportLine>,

    /// Reference version debdiffs were made against
    pub reference_version: Option<String>,

    /// Base URL of the published pool, without trailing slash
    pub files_url: String,
}

impl PipelineReport {
    pub fn new(version: impl Into<String>, files_url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            success: false,
            lines: Vec::new(),
            reference_version: None,
            files_url: files_url.into(),
        }
    }

    pub fn push(&mut self, line: ReportLine) {
        self.lines.push(line);
    }

    fn render(&self) -> String {
        let mut out = Vec::new();
        if self.success {
            out.push(format!("**Successful automatic packaging: {}**", self.version));
        } else {
            out.push(format!("**Failed automatic packaging: {}**", self.version));
        }

        let mut files_rendered = false;
        for line in &self.lines {
            match (&line.file, &line.detail) {
                (Some(_), _) => {
                    if !files_rendered {
                        out.extend(self.render_files());
                        files_rendered = true;
                    }
                }
                (None, Some(detail)) => out.push(format!("{} {}: {}", line.mark, line.step, detail)),
                (None, None) => out.push(format!("{} {}", line.mark, line.step)),
            }
        }
        out.join("\n")
    }

    fn link(&self, text: &str, file: &str) -> String {
        format!("[{}]({}/{})", text, self.files_url, file)
    }

    /// Staged files; on success each .deb is combined with its build log
    /// and debdiff when both are present
    fn render_files(&self) -> Vec<String> {
        let mut files: Vec<(&str, Mark)> = self
            .lines
            .iter()
            .filter_map(|l| l.file.as_deref().map(|f| (f, l.mark)))
            .collect();
        let mut out = Vec::new();

        if self.success {
            let mut debs: Vec<&str> = files
                .iter()
                .map(|(f, _)| *f)
                .filter(|f| f.ends_with(".deb"))
                .collect();
            debs.sort();

            for deb in debs {
                let stem = &deb[..deb.len() - ".deb".len()];
                let build = format!("{}.build", stem);
                let debdiff = format!("{}.debdiff.txt", stem);
                let group: Vec<Mark> = files
                    .iter()
                    .filter(|(f, _)| *f == deb || *f == build || *f == debdiff)
                    .map(|(_, m)| *m)
                    .collect();
                if group.len() != 3 {
                    continue;
                }

                let mark = if group.contains(&Mark::Warning) {
                    Mark::Warning
                } else {
                    Mark::Success
                };
                let reference = self.reference_version.as_deref().unwrap_or("reference");
                out.push(format!(
                    "{} {}: {}{}{}{}{}",
                    mark,
                    PUBLISH_STEP,
                    self.link(&format!("`{}`", deb), deb),
                    SEPARATOR,
                    self.link("build log", &build),
                    SEPARATOR,
                    self.link(&format!("debdiff against {}", reference), &debdiff),
                ));
                files.retain(|(f, _)| *f != deb && *f != build && *f != debdiff);
            }
        }

        for (file, mark) in files {
            if mark == Mark::Failure {
                out.push(format!("{} {}: {}", mark, PUBLISH_STEP, file));
            } else {
                out.push(format!(
                    "{} {}: {}",
                    mark,
                    PUBLISH_STEP,
                    self.link(&format!("`{}`", file), file)
                ));
            }
        }
        out
    }
}

/// One tracked value of a refresh report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshItem {
    pub title: String,
    pub old: Option<String>,
    pub new: String,
}

/// Metadata changes and newly pending versions found by `detect` and
/// `refresh-reference`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub metadata: Vec<RefreshItem>,
    pub todo: Vec<String>,
}

impl RefreshReport {
    pub fn push_metadata(&mut self, title: &str, old: Option<&str>, new: &str) {
        self.metadata.push(RefreshItem {
            title: title.to_string(),
            old: old.map(str::to_string),
            new: new.to_string(),
        });
    }

    pub fn has_changes(&self) -> bool {
        self.metadata.iter().any(|m| m.old.as_deref() != Some(m.new.as_str()))
    }

    /// Empty when nothing changed
    fn render(&self) -> String {
        let mut out = Vec::new();
        if self.has_changes() {
            out.push("**Metadata update:**".to_string());
            for item in &self.metadata {
                let old = item.old.as_deref().unwrap_or("none");
                if item.old.as_deref() == Some(item.new.as_str()) {
                    out.push(format!("- {}: `{}`", item.title, old));
                } else {
                    out.push(format!("- {}: `{}` → **`{}`**", item.title, old, item.new));
                }
            }
        }

        if !self.todo.is_empty() {
            out.push("\n**To do:**".to_string());
            out.extend(self.todo.iter().map(|v| format!("- `{}`", v)));
        }
        out.join("\n").trim().to_string()
    }
}

/// An operation that stopped before producing its own report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub operation: String,
    pub errors: Vec<String>,
}

impl FailureReport {
    pub fn new(operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            errors: vec![error.into()],
        }
    }

    fn render(&self) -> String {
        let mut out = vec![format!("**{} {} failed**", Mark::Failure, self.operation)];
        out.extend(self.errors.iter().map(|e| format!("- {}", e)));
        out.join("\n")
    }
}

/// Last path component of a URL, for link texts
fn file_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

fn render_drift(report: &DiffReport) -> String {
    let target = &report.target;
    let kind = if report.old.is_some() { "updated" } else { "new" };
    let url = report.download_url();

    let mut out = vec![
        format!("**Package monitoring: {} {}**", kind, target.package),
        format!("- Repository: {}", target.repo),
        format!("- Suite: {}", target.suite),
        format!("- Component: {}", target.component),
        format!("- Architecture: {}", target.arch),
        format!("- Package: `{}`", target.package),
    ];
    match &report.old {
        Some(old) => out.push(format!("- Version: `{}` → `{}`", old.version, report.new.version)),
        None => out.push(format!("- Version: `{}`", report.new.version)),
    }
    out.push(format!("- Download: [{}]({})", file_name(&url), url));

    if report.dependency_urls.is_empty() {
        out.push("- Dependencies: none".to_string());
    } else {
        out.push("- Dependencies:".to_string());
        for (dep, url) in &report.dependency_urls {
            match url {
                Some(url) => out.push(format!("   - {}: [{}]({})", dep, file_name(url), url)),
                None => out.push(format!("   - {}", dep)),
            }
        }
    }
    out.join("\n")
}

/// Structured message accepted by the dispatcher
#[derive(Debug, Clone)]
pub enum Message {
    Pipeline(PipelineReport),
    Refresh(RefreshReport),
    Drift(DiffReport),
    Failure(FailureReport),
}

impl Message {
    /// Short description for logs
    pub fn topic(&self) -> String {
        match self {
            Message::Pipeline(report) => format!("building version {}", report.version),
            Message::Refresh(_) => "refreshing data".to_string(),
            Message::Drift(report) => format!("monitoring package {}", report.target.key()),
            Message::Failure(report) => format!("failure of {}", report.operation.to_lowercase()),
        }
    }

    /// Markdown content, `None` when there is nothing to say
    pub fn render(&self) -> Option<String> {
        let content = match self {
            Message::Pipeline(report) => report.render(),
            Message::Refresh(report) => report.render(),
            Message::Drift(report) => render_drift(report),
            Message::Failure(report) => report.render(),
        };
        if content.is_empty() { None } else { Some(content) }
    }
}
