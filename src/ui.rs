//! Terminal output of the demo binary: spinner and coloured event lines.
//!
//! Uses `indicatif` for the progress spinner and `console` for styling.
//! [`EpochProgress`] follows one epoch from its first restart until it
//! resolves.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use settle::{EpochOutcome, EpochRecord, TimerEvent};

/// Visual progress of an epoch in the terminal.
///
/// Shows a spinner while the epoch is pending and coloured lines for
/// settlement (green), faults (red) and cancellation (yellow).
#[derive(Clone)]
pub struct EpochProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl EpochProgress {
    /// Starts the spinner.
    pub fn start(interval: Duration) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("waiting for {}ms of quiet", interval.as_millis()));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Prints one line per restart request.
    pub fn restart(&self, index: u32, total: u32) {
        self.pb
            .println(format!("  {} restart {index}/{total}", self.dim.apply_to("↻")));
    }

    /// Prints a timer event above the spinner.
    pub fn event(&self, event: &TimerEvent) {
        match event {
            TimerEvent::RanToCompletion { .. } => {
                self.pb.set_message("finalizing");
                self.pb
                    .println(format!("  {} {event}", self.green.apply_to("●")));
            }
            TimerEvent::Cancelled { .. } => {
                self.pb
                    .println(format!("  {} {event}", self.yellow.apply_to("●")));
            }
            // Resolution is reported by `complete`.
            TimerEvent::Resolved(_) => {}
            _ => self.pb.println(format!("  {} {event}", self.dim.apply_to("·"))),
        }
    }

    /// Prints a finalization item finishing.
    pub fn finalized(&self, index: u32) {
        self.pb
            .println(format!("  {} finalization item {index} done", self.dim.apply_to("✓")));
    }

    /// Stops the spinner without reporting an outcome.
    pub fn clear(&self) {
        self.pb.finish_and_clear();
    }

    /// Stops the spinner and prints the outcome.
    pub fn complete(&self, outcome: &EpochOutcome) {
        self.pb.finish_and_clear();
        match outcome {
            EpochOutcome::Settled => {
                println!("  {} Epoch settled", self.green.apply_to("✓"));
            }
            EpochOutcome::Cancelled => {
                println!("  {} Epoch cancelled", self.yellow.apply_to("↯"));
            }
            EpochOutcome::Faulted(reason) => {
                println!("  {} Epoch faulted: {reason}", self.red.apply_to("✗"));
            }
        }
    }

    /// Prints the epoch record as coloured, pretty JSON.
    pub fn print_record(&self, record: &EpochRecord) {
        let style = match record.outcome {
            EpochOutcome::Settled => &self.green,
            EpochOutcome::Faulted(_) => &self.red,
            EpochOutcome::Cancelled => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Epoch Record ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(record).unwrap_or_default()
        );
    }
}
