//! Progress reporting for scans and spews
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::report::{ExtractionStatus, Report};
use crate::scanner::ScanSummary;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Point-in-time view of a running pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineProgress {
    /// Files enqueued by the scanner (if one runs in this process)
    pub enqueued: u64,

    /// Bytes enqueued by the scanner
    pub bytes: u64,

    /// Documents currently waiting in the queue
    pub queued: usize,

    /// Documents finished by the consumer
    pub processed: u64,

    /// Documents recorded with a failure status
    pub failed: u64,

    /// Status writes waiting for a retry
    pub journaled: usize,

    pub elapsed: Duration,
}

impl PipelineProgress {
    pub fn docs_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Progress reporter that displays pipeline status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// A reporter that draws nothing (`--quiet`)
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Update the progress display
    pub fn update(&self, progress: &PipelineProgress) {
        let mut msg = format!(
            "Scanned: {} ({}) | Queue: {} | Done: {} | Failed: {} | Rate: {:.0}/s",
            format_number(progress.enqueued),
            format_size(progress.bytes, BINARY),
            format_number(progress.queued as u64),
            format_number(progress.processed),
            format_number(progress.failed),
            progress.docs_per_second(),
        );
        if progress.journaled > 0 {
            msg.push_str(&format!(" | Journaled: {}", progress.journaled));
        }

        self.bar.set_message(msg);
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header at the start of a run
pub fn print_header(command: &str, queue: &str, workers: Option<usize>) {
    println!();
    println!(
        "{} {} {}",
        style("docsweep").cyan().bold(),
        env!("CARGO_PKG_VERSION"),
        style(command).dim()
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Queue:").bold(), queue);
    if let Some(workers) = workers {
        println!("  {} {}", style("Workers:").bold(), workers);
    }
    println!();
}

/// Print a summary of a finished scan
pub fn print_scan_summary(summary: &ScanSummary) {
    let secs = summary.duration.as_secs_f64();
    let rate = if secs > 0.0 {
        summary.files_enqueued as f64 / secs
    } else {
        0.0
    };

    println!();
    println!("{} ({})", style("Scan Complete").green().bold(), summary.state);
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Root:").bold(), summary.root.display());
    println!(
        "  {} {} ({})",
        style("Enqueued:").bold(),
        format_number(summary.files_enqueued),
        format_size(summary.bytes_enqueued, BINARY)
    );
    println!(
        "  {} {} files, {} directories",
        style("Skipped:").bold(),
        format_number(summary.files_skipped),
        format_number(summary.dirs_pruned)
    );
    println!("  {} {:.1}s ({:.0} files/sec)", style("Duration:").bold(), secs, rate);
    if summary.errors > 0 {
        println!("  {} {}", style("Errors:").yellow().bold(), format_number(summary.errors));
    }
    println!();
}

/// Print a summary of a finished spew
pub fn print_spew_summary(progress: &PipelineProgress, drained: u64) {
    println!();
    println!("{}", style("Spew Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Drained:").bold(), format_number(drained));
    println!(
        "  {} {}",
        style("Succeeded:").bold(),
        format_number(progress.processed.saturating_sub(progress.failed))
    );
    if progress.failed > 0 {
        println!("  {} {}", style("Failed:").yellow().bold(), format_number(progress.failed));
    }
    if progress.journaled > 0 {
        println!(
            "  {} {} status writes were not stored",
            style("Journal:").red().bold(),
            format_number(progress.journaled as u64)
        );
    }
    println!(
        "  {} {:.1}s ({:.0} docs/sec)",
        style("Duration:").bold(),
        progress.elapsed.as_secs_f64(),
        progress.docs_per_second()
    );
    println!();
}

/// Print stored reports, optionally only those with `filter` status
///
/// Returns the number of rows printed.
pub fn print_reports(entries: &[(String, Report)], filter: Option<ExtractionStatus>) -> usize {
    let mut shown = 0;
    for (id, report) in entries {
        if filter.is_some_and(|status| status != report.status) {
            continue;
        }
        let status = if report.status.is_success() {
            style(report.status.name()).green()
        } else {
            style(report.status.name()).yellow()
        };
        match &report.cause {
            Some(cause) => println!("{}\t{}\t{}: {}", id, status, cause.kind, cause.message),
            None => println!("{}\t{}", id, status),
        }
        shown += 1;
    }
    shown
}
