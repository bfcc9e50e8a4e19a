use std::collections::BTreeMap;
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{ArchiveId, ExtractionOutcome, FetchOutcome, SelectionEntry};
use crate::error::AtbError;
use crate::extract;
use crate::fetcher::{ArchiveFetcher, ArchiveSource};
use crate::plan::{ArchiveChecksums, FetchPlan, FetchPlanEntry};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub strip_components: usize,
    pub delete_archives: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Planning,
    Fetching,
    Extracting,
    Done,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Planning => "Plan",
            Phase::Fetching => "Fetch",
            Phase::Extracting => "Extract",
            Phase::Done => "Done",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum FetchResult {
    DryRun(PlanSummary),
    Completed(PipelineReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub archive_count: usize,
    pub member_count: usize,
    pub archives_dir: String,
    pub archives: Vec<FetchPlanEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub archive_id: ArchiveId,
    pub source_url: String,
    pub archive_path: String,
    pub fetch: FetchOutcome,
    pub extraction: ExtractionOutcome,
    pub found_count: usize,
    pub missing_count: usize,
    pub archive_deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: String,
    pub finished_at: String,
    pub output_dir: String,
    pub archives: Vec<ArchiveReport>,
}

impl PipelineReport {
    pub fn is_complete(&self) -> bool {
        self.archives
            .iter()
            .all(|archive| archive.fetch.is_available() && archive.missing_count == 0)
    }

    pub fn failed_archives(&self) -> impl Iterator<Item = &ArchiveReport> {
        self.archives
            .iter()
            .filter(|archive| !archive.fetch.is_available())
    }

    pub fn missing_members(&self) -> usize {
        self.archives.iter().map(|archive| archive.missing_count).sum()
    }

    pub fn found_members(&self) -> usize {
        self.archives.iter().map(|archive| archive.found_count).sum()
    }

    pub fn collisions(&self) -> usize {
        self.archives
            .iter()
            .map(|archive| archive.extraction.collisions.len())
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressSinkKind {
    Fetch,
    Plan,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Clone)]
pub struct App<S: ArchiveSource> {
    store: Store,
    fetcher: ArchiveFetcher<S>,
}

impl<S: ArchiveSource> App<S> {
    pub fn new(store: Store, fetcher: ArchiveFetcher<S>) -> Self {
        Self { store, fetcher }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn fetcher(&self) -> &ArchiveFetcher<S> {
        &self.fetcher
    }

    pub fn fetch(
        &self,
        selection: &[SelectionEntry],
        checksums: &ArchiveChecksums,
        options: FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, AtbError> {
        emit_phase(sink, Phase::Planning, format!("grouping {} rows", selection.len()));
        let plan = FetchPlan::build(selection, checksums)?;
        emit_phase(
            sink,
            Phase::Planning,
            format!(
                "{} archives, {} members",
                plan.len(),
                plan.member_count()
            ),
        );
        info!(
            archives = plan.len(),
            members = plan.member_count(),
            jobs = options.concurrency,
            "planned fetch"
        );

        if options.dry_run {
            return Ok(FetchResult::DryRun(self.summarize(&plan)));
        }

        self.run_plan(&plan, &options, sink).map(FetchResult::Completed)
    }

    pub fn summarize(&self, plan: &FetchPlan) -> PlanSummary {
        PlanSummary {
            archive_count: plan.len(),
            member_count: plan.member_count(),
            archives_dir: self.store.archives_dir().to_string(),
            archives: plan.entries().to_vec(),
        }
    }

    pub fn run_plan(
        &self,
        plan: &FetchPlan,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<PipelineReport, AtbError> {
        let started_at = iso_timestamp();
        let start = Instant::now();
        self.store.ensure_output_root()?;
        self.store.ensure_archives_dir()?;

        emit_phase(
            sink,
            Phase::Fetching,
            format!(
                "{} archives with {} jobs",
                plan.len(),
                options.concurrency.max(1)
            ),
        );
        let mut outcomes = self.fetch_all(plan, options, sink);

        emit_phase(sink, Phase::Extracting, "selecting members".to_string());
        let mut archives = Vec::with_capacity(plan.len());
        for entry in plan.entries() {
            let fetch = outcomes
                .remove(&entry.archive_id)
                .unwrap_or_else(|| FetchOutcome::Failed {
                    reason: "fetch task did not report".to_string(),
                    attempts: 0,
                });
            archives.push(self.extract_one(entry, fetch, options, sink));
        }

        let report = PipelineReport {
            started_at,
            finished_at: iso_timestamp(),
            output_dir: self.store.output_root().to_string(),
            archives,
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} found, {} missing, {} failed archives",
                report.found_members(),
                report.missing_members(),
                report.failed_archives().count()
            ),
            elapsed: Some(start.elapsed()),
        });
        info!(
            found = report.found_members(),
            missing = report.missing_members(),
            complete = report.is_complete(),
            "pipeline finished"
        );
        Ok(report)
    }

    fn fetch_all(
        &self,
        plan: &FetchPlan,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> BTreeMap<ArchiveId, FetchOutcome> {
        let mut outcomes = BTreeMap::new();
        if plan.is_empty() {
            return outcomes;
        }

        let workers = options.concurrency.clamp(1, plan.len());
        let queue = Mutex::new(plan.entries().iter());
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = match queue.lock() {
                            Ok(mut pending) => pending.next(),
                            Err(_) => None,
                        };
                        let Some(entry) = next else {
                            break;
                        };
                        let outcome = self.fetch_one(entry, options, sink);
                        if tx.send((entry.archive_id.clone(), outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (archive_id, outcome) in rx {
                sink.event(ProgressEvent {
                    message: format!("fetch.done archive={archive_id} status={}", outcome.label()),
                    elapsed: None,
                });
                outcomes.insert(archive_id, outcome);
            }
        });

        outcomes
    }

    fn fetch_one(
        &self,
        entry: &FetchPlanEntry,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> FetchOutcome {
        let dest = self.store.archive_path(&entry.archive_id);
        sink.event(ProgressEvent {
            message: format!("fetch.request archive={}", entry.archive_id),
            elapsed: None,
        });
        let start = Instant::now();
        let outcome = self.fetcher.fetch(
            &entry.source_url,
            dest.as_std_path(),
            entry.expected_checksum.as_ref(),
            options.max_attempts,
            sink,
        );
        sink.event(ProgressEvent {
            message: format!(
                "fetch.response archive={} latency_ms={}",
                entry.archive_id,
                start.elapsed().as_millis()
            ),
            elapsed: Some(start.elapsed()),
        });
        match &outcome {
            FetchOutcome::Failed { reason, attempts } => {
                warn!(archive = %entry.archive_id, attempts, reason = %reason, "archive fetch failed");
            }
            other => {
                info!(archive = %entry.archive_id, status = other.label(), "archive ready");
            }
        }
        outcome
    }

    fn extract_one(
        &self,
        entry: &FetchPlanEntry,
        fetch: FetchOutcome,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> ArchiveReport {
        let archive_path = self.store.archive_path(&entry.archive_id);

        let (fetch, extraction, attempted) = if fetch.is_available() {
            sink.event(ProgressEvent {
                message: format!("phase=Extract; {}", entry.archive_id),
                elapsed: None,
            });
            let (outcome, failure) = extract::extract_members(
                archive_path.as_std_path(),
                &entry.wanted_members,
                self.store.output_root().as_std_path(),
                options.strip_components,
            );
            let fetch = match failure {
                None => fetch,
                Some(err) => {
                    warn!(
                        archive = %entry.archive_id,
                        found = outcome.found.len(),
                        error = %err,
                        "extraction failed"
                    );
                    let attempts = match fetch {
                        FetchOutcome::Downloaded { attempts, .. } => attempts,
                        _ => 0,
                    };
                    FetchOutcome::Failed {
                        reason: err.to_string(),
                        attempts,
                    }
                }
            };
            if fetch.is_available() && !outcome.is_complete() {
                warn!(
                    archive = %entry.archive_id,
                    missing = outcome.missing.len(),
                    "archive is missing expected members"
                );
            }
            let status = if !fetch.is_available() {
                "failed"
            } else if outcome.is_complete() {
                "extracted"
            } else {
                "incomplete"
            };
            sink.event(ProgressEvent {
                message: format!(
                    "extract.done archive={} status={status} found={} missing={}",
                    entry.archive_id,
                    outcome.found.len(),
                    outcome.missing.len()
                ),
                elapsed: None,
            });
            (fetch, outcome, true)
        } else {
            (
                fetch,
                ExtractionOutcome::all_missing(&entry.wanted_members),
                false,
            )
        };

        let archive_deleted = attempted && options.delete_archives && {
            match self.store.remove_archive(&entry.archive_id) {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(archive = %entry.archive_id, error = %err, "could not delete archive");
                    sink.event(ProgressEvent {
                        message: format!("cleanup.failed archive={} {err}", entry.archive_id),
                        elapsed: None,
                    });
                    false
                }
            }
        };

        ArchiveReport {
            archive_id: entry.archive_id.clone(),
            source_url: entry.source_url.clone(),
            archive_path: archive_path.to_string(),
            found_count: extraction.found.len(),
            missing_count: extraction.missing.len(),
            fetch,
            extraction,
            archive_deleted,
        }
    }
}

fn emit_phase(sink: &dyn ProgressSink, phase: Phase, detail: String) {
    sink.event(ProgressEvent {
        message: format!("phase={}; {detail}", phase.label()),
        elapsed: None,
    });
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
