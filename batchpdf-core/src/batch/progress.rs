//! Progress tracking for batch runs

use super::job::JobState;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Point-in-time view of a batch run
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub queued: usize,
    pub uploading: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub started: Instant,
    /// When the most recent job reached a terminal state
    pub last_finished: Option<Instant>,
}

impl ProgressInfo {
    fn new(total: usize) -> Self {
        Self {
            total,
            queued: total,
            uploading: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            started: Instant::now(),
            last_finished: None,
        }
    }

    fn slot(&mut self, state: JobState) -> &mut usize {
        match state {
            JobState::Queued => &mut self.queued,
            JobState::Uploading => &mut self.uploading,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        }
    }

    /// Jobs in `Completed` or `Failed`
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    /// Jobs currently holding a worker
    pub fn in_flight(&self) -> usize {
        self.uploading + self.processing
    }

    /// `finished / total`; an empty run counts as done
    pub fn overall_progress(&self) -> f64 {
        match self.total {
            0 => 1.0,
            total => self.finished() as f64 / total as f64,
        }
    }

    pub fn percentage(&self) -> f64 {
        self.overall_progress() * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.finished() >= self.total
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Finished jobs per second, measured up to the latest finish
    pub fn jobs_per_second(&self) -> Option<f64> {
        let window = self.last_finished?.duration_since(self.started);
        if window.is_zero() {
            return None;
        }
        Some(self.finished() as f64 / window.as_secs_f64())
    }

    /// Time left at the observed rate, `None` until a job has finished
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.jobs_per_second()?;
        let remaining = self.total.saturating_sub(self.finished());
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} done ({:.0}%), {} in flight",
            self.finished(),
            self.total,
            self.percentage(),
            self.in_flight()
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        Ok(())
    }
}

/// `45s`, `2m 05s`, `1h 02m`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// Per-state job counts for one batch run, published on every transition
#[derive(Debug)]
pub struct BatchProgress {
    sender: watch::Sender<ProgressInfo>,
}

impl BatchProgress {
    /// Tracker for `total` jobs, all queued
    pub fn new(total: usize) -> Self {
        let (sender, _) = watch::channel(ProgressInfo::new(total));
        Self { sender }
    }

    /// Move one job from `from` to `to` and notify subscribers
    pub fn record(&self, from: JobState, to: JobState) -> ProgressInfo {
        self.sender.send_modify(|info| {
            let source = info.slot(from);
            *source = source.saturating_sub(1);
            *info.slot(to) += 1;
            if to.is_terminal() {
                info.last_finished = Some(Instant::now());
            }
        });
        self.get_info()
    }

    pub fn get_info(&self) -> ProgressInfo {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressInfo> {
        self.sender.subscribe()
    }
}

/// Receives every progress update of a run
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, info: &ProgressInfo);
}

impl<F> ProgressCallback for F
where
    F: Fn(&ProgressInfo) + Send + Sync,
{
    fn on_progress(&self, info: &ProgressInfo) {
        self(info)
    }
}

/// Single-line terminal rendering of a [`ProgressInfo`]
#[derive(Debug, Clone)]
pub struct ProgressBar {
    width: usize,
    show_eta: bool,
}

impl ProgressBar {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            show_eta: true,
        }
    }

    pub fn without_eta(mut self) -> Self {
        self.show_eta = false;
        self
    }

    /// `[####------] 40% 4/10 · 1 failed · ETA 12s`
    pub fn render(&self, info: &ProgressInfo) -> String {
        let filled = ((info.overall_progress() * self.width as f64).round() as usize).min(self.width);
        let mut line = format!(
            "[{}{}] {:>3.0}% {}/{}",
            "#".repeat(filled),
            "-".repeat(self.width - filled),
            info.percentage(),
            info.finished(),
            info.total
        );

        if info.failed > 0 {
            line.push_str(&format!(" · {} failed", info.failed));
        }
        if self.show_eta && !info.is_complete() {
            let eta = info.eta().map_or_else(|| "--".to_string(), format_duration);
            line.push_str(&format!(" · ETA {eta}"));
        }

        line
    }
}

impl Default for ProgressBar {
    fn default() -> Self {
        Self::new(40)
    }
}
