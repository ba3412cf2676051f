use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::state::{ScanState, ScanStats, ScanStatus};

/// Plain-text report of a finished run: errors first, then duplicates.
pub fn render_report(stats: &ScanStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Errors: {}", stats.errors.len());
    for error in &stats.errors {
        match &error.system_error {
            Some(detail) => {
                let _ = writeln!(out, "{} - {}: {}", error.path, error.kind, detail);
            }
            None => {
                let _ = writeln!(out, "{} - {}", error.path, error.kind);
            }
        }
    }
    out.push('\n');
    let _ = writeln!(out, "Duplicates: {}", stats.duplicates.len());
    for duplicate in &stats.duplicates {
        let _ = writeln!(out, "{} - {}", duplicate.path, duplicate.reason);
    }
    out
}

pub fn summary_line(stats: &ScanStats) -> String {
    let finished = stats
        .stop_time
        .map(format_time)
        .unwrap_or_else(|| "not finished".to_string());
    format!(
        "{} files in {}, finished {}, {} errors, {} duplicates",
        stats.nb_files(),
        format_elapsed(stats.elapsed()),
        finished,
        stats.errors.len(),
        stats.duplicates.len()
    )
}

/// One-line description of the current scanner state.
pub fn status_line(status: &ScanStatus) -> String {
    match status.state {
        ScanState::NotScheduled => "Not scheduled".to_string(),
        ScanState::Scheduled => match status.next_scheduled {
            Some(at) => format!("Scheduled at {}", format_time(at)),
            None => "Scheduled".to_string(),
        },
        ScanState::InProgress => match &status.in_progress {
            Some(stats) => format!(
                "In progress: {}/{} files ({:.1}%)",
                stats.processed_files,
                stats.files_to_scan,
                stats.progress() * 100.0
            ),
            None => "In progress".to_string(),
        },
    }
}

/// `1h02m03s`, `04m05s`, `09s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let mut out = String::new();
    if secs >= 3600 {
        let _ = write!(out, "{}h", secs / 3600);
    }
    if secs >= 60 {
        let _ = write!(out, "{:02}m", (secs % 3600) / 60);
    }
    let _ = write!(out, "{:02}s", secs % 60);
    out
}

fn format_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| format!("{:?}", time))
}
