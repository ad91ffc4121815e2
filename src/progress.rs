//! Spinner-based progress for plan execution.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use installkit::{ProgressCallback, StepStatus};
use std::collections::BTreeSet;
use std::time::Duration;

/// Shows running steps on a spinner and prints one line per finished step.
pub struct StepProgress {
    bar: Option<ProgressBar>,
    running: BTreeSet<String>,
}

impl StepProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = (!quiet).then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg} {elapsed:.dim}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        Self {
            bar,
            running: BTreeSet::new(),
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }

    fn refresh(&self) {
        if let Some(bar) = &self.bar {
            let names: Vec<&str> = self.running.iter().map(String::as_str).collect();
            bar.set_message(format!("Running {}", names.join(", ")));
        }
    }
}

impl ProgressCallback for StepProgress {
    fn on_step(&mut self, step_id: &str, status: StepStatus) {
        if status == StepStatus::Started {
            self.running.insert(step_id.to_string());
            self.refresh();
            return;
        }
        self.running.remove(step_id);

        let line = match status {
            StepStatus::Succeeded => format!("  {} {}", "✓".green(), step_id),
            StepStatus::Skipped => format!("  {} {} {}", "○".dimmed(), step_id, "(skipped)".dimmed()),
            StepStatus::Failed => format!("  {} {}", "✗".red(), step_id),
            StepStatus::NeedsSudo => {
                format!("  {} {} {}", "⚠".yellow(), step_id, "(needs sudo)".dimmed())
            }
            StepStatus::Blocked => {
                format!("  {} {} {}", "⊘".dimmed(), step_id, "(blocked)".dimmed())
            }
            StepStatus::Started => return,
        };
        if let Some(bar) = &self.bar {
            bar.println(line);
        }
        self.refresh();
    }
}
