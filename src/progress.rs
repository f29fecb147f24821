//! Progress reporting infrastructure

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::borrow::Cow;

/// CLI progress report of ongoing operations
///
/// To avoid corrupted terminal output, you should not write anything to stdout
/// or stderr yourself as long as a report is being displayed. Please use logs
/// for debug messages.
#[derive(Clone, Debug, Default)]
pub struct ProgressReport(MultiProgress);
//
impl ProgressReport {
    /// Prepare to report progress on the cli
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare to track progress without displaying it
    #[cfg(test)]
    pub fn hidden() -> Self {
        Self(MultiProgress::with_draw_target(
            indicatif::ProgressDrawTarget::hidden(),
        ))
    }

    /// Prepare to report on a new operation
    ///
    /// Operations with no work to be done are not displayed.
    pub fn add(&self, what: impl Into<Cow<'static, str>>, work: Work) -> ProgressTracker {
        let trailer = match work {
            Work::Steps(_) => "{pos}/{len} ({per_sec})",
            Work::PercentSteps(_) => "{percent:>2}% (~{eta} left)",
        };
        let bar = ProgressBar::new(work.into())
            .with_prefix(what)
            .with_style(
                ProgressStyle::with_template(&format!("{{prefix}} {{wide_bar}} {trailer}"))
                    .expect("all styles above should be valid indicatif styles"),
            );
        if u64::from(work) > 0 {
            self.0.add(bar.clone());
        }
        ProgressTracker {
            bar,
            report: self.0.clone(),
        }
    }
}

/// Work whose progression can be tracked
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Work {
    /// Steps to be taken, with a precise count display
    Steps(usize),

    /// Steps to be taken, with a percentage-based display
    PercentSteps(usize),
}
//
impl From<Work> for u64 {
    fn from(value: Work) -> Self {
        let inner = match value {
            Work::Steps(s) => s,
            Work::PercentSteps(p) => p,
        };
        inner as u64
    }
}

/// Mechanism to track progress
///
/// Can be cloned and shared between the tasks or threads that perform the
/// work.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    /// Progress bar for this specific operation
    bar: ProgressBar,

    /// Underlying process report
    report: MultiProgress,
}
//
impl ProgressTracker {
    /// Show that a certain amount of progress has been made
    ///
    /// Returns truth that the progress bar has reached its maximum value, in
    /// which case it is removed from the report.
    pub fn make_progress(&self, progress: u64) -> bool {
        self.bar.inc(progress);
        let current = self.bar.position();
        let max = self.bar.length().unwrap_or(0);
        debug_assert!(current <= max, "recorded more progress than expected");
        let finished = current >= max;
        if finished {
            self.bar.finish_and_clear();
            self.report.remove(&self.bar);
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trackers_finish_at_full_length() {
        let report = ProgressReport::hidden();
        let tracker = report.add("Testing", Work::Steps(2));
        let clone = tracker.clone();
        assert!(!tracker.make_progress(1));
        assert!(clone.make_progress(1));
    }
}
