//! Results, statistics and archive manifests for batch runs

use super::job::{Job, JobFailure, JobState};
use crate::engine::EngineOutput;
use crate::intake::{format_file_size, FileRef};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Size totals over the completed jobs of a batch run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStatistics {
    pub total_original_bytes: u64,
    pub total_result_bytes: u64,
    /// Negative when outputs grew
    pub space_saved: i64,
    /// Mean of per-job `1 - result / original`; absent until a job completes
    pub average_reduction: Option<f64>,
    pub completed_count: usize,
    pub failed_count: usize,
}

impl BatchStatistics {
    pub fn reduction_percentage(&self) -> Option<f64> {
        self.average_reduction.map(|reduction| reduction * 100.0)
    }
}

/// Per-job reduction; a zero-byte original counts as no reduction
pub fn reduction_ratio(original_bytes: u64, result_bytes: u64) -> f64 {
    if original_bytes == 0 {
        return 0.0;
    }
    1.0 - result_bytes as f64 / original_bytes as f64
}

#[derive(Debug, Default)]
struct Totals {
    original_bytes: u64,
    result_bytes: u64,
    reductions: Vec<f64>,
    failed: usize,
}

/// Running size statistics for one batch run
///
/// Fed once per job when it reaches a terminal state. Failed jobs only bump
/// the failure count.
#[derive(Debug, Default)]
pub struct ResultsAggregator {
    totals: Mutex<Totals>,
}

impl ResultsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a job that just reached a terminal state into the totals
    pub fn on_job_completed(&self, job: &Job) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        match job.state() {
            JobState::Completed => {
                let original = job.original_size_bytes();
                let result = job.result_size_bytes().unwrap_or_default();
                totals.original_bytes += original;
                totals.result_bytes += result;
                totals.reductions.push(reduction_ratio(original, result));
            }
            JobState::Failed => totals.failed += 1,
            _ => {}
        }
    }

    pub fn statistics(&self) -> BatchStatistics {
        let totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        let average_reduction = if totals.reductions.is_empty() {
            None
        } else {
            Some(totals.reductions.iter().sum::<f64>() / totals.reductions.len() as f64)
        };

        BatchStatistics {
            total_original_bytes: totals.original_bytes,
            total_result_bytes: totals.result_bytes,
            space_saved: totals.original_bytes as i64 - totals.result_bytes as i64,
            average_reduction,
            completed_count: totals.reductions.len(),
            failed_count: totals.failed,
        }
    }
}

/// One completed output inside a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub job_id: Uuid,
    pub source_name: String,
    /// Unique name inside the archive
    pub archive_name: String,
    pub output_ref: FileRef,
    pub size_bytes: u64,
}

/// Contents of the downloadable bundle for a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveManifest {
    pub batch_id: Uuid,
    pub entries: Vec<ManifestEntry>,
    pub failed_count: usize,
    /// Set when at least one job failed
    pub has_warnings: bool,
}

impl ArchiveManifest {
    /// Manifest over the completed jobs, in submission order
    pub fn from_jobs(batch_id: Uuid, jobs: &[Job]) -> Self {
        let mut used = HashSet::new();
        let mut entries = Vec::new();
        let mut failed_count = 0;

        for job in jobs {
            if job.state() == JobState::Failed {
                failed_count += 1;
            }
            let Some(output) = job.output() else {
                continue;
            };
            let archive_name = unique_name(&mut used, &archive_name(&job.file.name, output));
            entries.push(ManifestEntry {
                job_id: job.id,
                source_name: job.file.name.clone(),
                archive_name,
                output_ref: output.output_ref.clone(),
                size_bytes: output.output_size_bytes,
            });
        }

        Self {
            batch_id,
            entries,
            failed_count,
            has_warnings: failed_count > 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size_bytes).sum()
    }
}

/// Source stem with the output's extension
fn archive_name(source_name: &str, output: &EngineOutput) -> String {
    let source = Path::new(source_name);
    let stem = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("output");
    let extension = output
        .output_ref
        .as_path()
        .extension()
        .or_else(|| source.extension())
        .and_then(|ext| ext.to_str());

    match extension {
        Some(extension) => format!("{stem}.{extension}"),
        None => stem.to_string(),
    }
}

/// `name`, or `stem (n).ext` for the first free `n >= 2`
fn unique_name(used: &mut HashSet<String>, name: &str) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let mut n = 2;
    loop {
        let candidate = format!("{stem} ({n}){extension}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Outcome of one finished job, as listed in a [`BatchSummary`]
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: Uuid,
    /// e.g. "Compress report.pdf"
    pub name: String,
    pub duration: Duration,
    pub original_size: u64,
    pub outcome: std::result::Result<EngineOutput, JobFailure>,
}

impl JobResult {
    /// `None` while the job is still live
    pub fn from_job(job: &Job) -> Option<Self> {
        let outcome = match (job.output(), job.failure()) {
            (Some(output), _) => Ok(output.clone()),
            (None, Some(failure)) => Err(failure.clone()),
            (None, None) => return None,
        };

        Some(Self {
            job_id: job.id,
            name: job.display_name(),
            duration: job.duration().unwrap_or_default(),
            original_size: job.original_size_bytes(),
            outcome,
        })
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Err(JobFailure::Cancelled))
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.outcome.as_ref().err()
    }

    pub fn output(&self) -> Option<&EngineOutput> {
        self.outcome.as_ref().ok()
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.duration.as_secs_f64();
        match &self.outcome {
            Ok(output) => write!(
                f,
                "✓ {}: {} -> {} in {secs:.2}s",
                self.name,
                format_file_size(self.original_size),
                format_file_size(output.output_size_bytes)
            ),
            Err(JobFailure::Cancelled) => write!(f, "⚠ {}: cancelled", self.name),
            Err(failure) => write!(f, "✗ {}: {failure} after {secs:.2}s", self.name),
        }
    }
}

/// Final account of a batch run
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total_jobs: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// From submission to the last finished job
    pub duration: Duration,
    pub statistics: BatchStatistics,
    /// One entry per finished job, in submission order
    pub results: Vec<JobResult>,
}

impl BatchSummary {
    /// Completed jobs as a percentage of all jobs; 100 for an empty run
    pub fn success_rate(&self) -> f64 {
        match self.total_jobs {
            0 => 100.0,
            total => self.successful as f64 * 100.0 / total as f64,
        }
    }

    pub fn average_duration(&self) -> Option<Duration> {
        let count = u32::try_from(self.results.len()).ok().filter(|&n| n > 0)?;
        Some(self.results.iter().map(|r| r.duration).sum::<Duration>() / count)
    }

    pub fn all_successful(&self) -> bool {
        self.failed == 0
    }

    /// Results that did not complete
    pub fn failures(&self) -> impl Iterator<Item = &JobResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Signed size for reports: "1 KB" or "-1 KB"
fn signed_size(bytes: i64) -> String {
    let size = format_file_size(bytes.unsigned_abs());
    if bytes < 0 {
        format!("-{size}")
    } else {
        size
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch {}", self.batch_id)?;
        writeln!(
            f,
            "  jobs:     {} ({} completed, {} failed, {:.1}% success)",
            self.total_jobs,
            self.successful,
            self.failed,
            self.success_rate()
        )?;
        write!(f, "  elapsed:  {:.2}s", self.duration.as_secs_f64())?;
        if let Some(average) = self.average_duration() {
            write!(f, " ({:.2}s per job)", average.as_secs_f64())?;
        }
        writeln!(f)?;

        let stats = &self.statistics;
        if let Some(percentage) = stats.reduction_percentage() {
            writeln!(
                f,
                "  size:     {} -> {}, saved {} ({percentage:.1}% average)",
                format_file_size(stats.total_original_bytes),
                format_file_size(stats.total_result_bytes),
                signed_size(stats.space_saved)
            )?;
        }

        if self.cancelled {
            writeln!(f, "  cancelled before every job finished")?;
        }

        let mut failures = self.failures().peekable();
        if failures.peek().is_some() {
            writeln!(f, "Failures:")?;
            for result in failures {
                writeln!(f, "  {result}")?;
            }
        }

        Ok(())
    }
}
