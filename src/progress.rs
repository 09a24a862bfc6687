//! Ingest and enrich progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! Human output is the default when stderr is a TTY; `--progress json`
//! switches to one JSON object per line.

use std::io::Write;
use std::sync::Arc;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// `done` of `total` origins have finished (fetched, skipped or failed).
    Ingesting { done: u64, total: u64 },
    /// `done` of `total` pending items have been attempted.
    Enriching { done: u64, total: u64 },
}

impl ProgressEvent {
    fn phase(&self) -> (&'static str, &'static str, u64, u64) {
        match *self {
            ProgressEvent::Ingesting { done, total } => ("ingesting", "origins", done, total),
            ProgressEvent::Enriching { done, total } => ("enriching", "items", done, total),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest  ingesting  12 / 40 origins".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let (phase, unit, done, total) = event.phase();
        let line = format!(
            "{}  {} / {} {}\n",
            phase,
            format_number(done),
            format_number(total),
            unit
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let (phase, unit, done, total) = event.phase();
        let obj = serde_json::json!({
            "event": "progress",
            "phase": phase,
            "unit": unit,
            "n": done,
            "total": total
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn events_name_their_unit() {
        assert_eq!(
            ProgressEvent::Ingesting { done: 1, total: 2 }.phase(),
            ("ingesting", "origins", 1, 2)
        );
        assert_eq!(
            ProgressEvent::Enriching { done: 3, total: 4 }.phase(),
            ("enriching", "items", 3, 4)
        );
    }
}
