//! Host-side phase timing for build paths.
//!
//! Purely observational: a build records named timestamps into an optional
//! [`HostBenchmark`] and nothing in the build depends on the result.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write as _};
use std::path::Path;
use std::time::Instant;

pub const BENCH_BEGIN: &str = "Begin";
pub const BENCH_END: &str = "End";

/// One named timestamp, in milliseconds since the log began.
#[derive(Debug, Clone, PartialEq)]
pub struct Timestamp {
    pub id: Cow<'static, str>,
    pub at_ms: f64,
}

/// Completed recording of one benchmarked operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkLog {
    pub timestamps: Vec<Timestamp>,
}

impl BenchmarkLog {
    /// Time between consecutive timestamps, labelled by the later one.
    pub fn deltas(&self) -> Vec<(&str, f64)> {
        self.timestamps
            .windows(2)
            .map(|w| (w[1].id.as_ref(), w[1].at_ms - w[0].at_ms))
            .collect()
    }

    /// Delta recorded for `id`, if present.
    pub fn delta(&self, id: &str) -> Option<f64> {
        self.deltas().into_iter().find(|(name, _)| *name == id).map(|(_, d)| d)
    }

    pub fn total_ms(&self) -> f64 {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) => last.at_ms - first.at_ms,
            _ => 0.0,
        }
    }

    /// Aligned table of phase deltas with a total line.
    pub fn print_pretty(&self) -> String {
        let width = self
            .timestamps
            .iter()
            .map(|t| t.id.len())
            .max()
            .unwrap_or(0)
            .max("Total".len());
        let mut out = String::new();
        let _ = writeln!(out, "{:<width$} | {:>12}", "Id", "Delta");
        for (id, delta) in self.deltas() {
            let _ = writeln!(out, "{:<width$} | {:>9.5} ms", id, delta);
        }
        let _ = write!(out, "{:<width$} | {:>9.5} ms", "Total", self.total_ms());
        out
    }
}

/// Appends [`BenchmarkLog`]s as CSV rows of phase deltas.
///
/// The header row (phase ids) is taken from the first log appended.
#[derive(Debug)]
pub struct CsvLogSink<W: io::Write> {
    out: W,
    separator: char,
    wrote_header: bool,
}

impl CsvLogSink<BufWriter<File>> {
    /// Create (truncate) `path`.
    pub fn create(path: impl AsRef<Path>, separator: char) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?), separator))
    }
}

impl<W: io::Write> CsvLogSink<W> {
    pub fn new(out: W, separator: char) -> Self {
        Self {
            out,
            separator,
            wrote_header: false,
        }
    }

    pub fn append_log(&mut self, log: &BenchmarkLog) -> io::Result<()> {
        let deltas = log.deltas();
        if !self.wrote_header {
            let ids: Vec<&str> = deltas.iter().map(|(id, _)| *id).collect();
            self.write_row(&ids)?;
            self.wrote_header = true;
        }
        let values: Vec<String> = deltas.iter().map(|(_, delta)| format!("{delta:.6}")).collect();
        self.write_row(&values)
    }

    fn write_row<S: AsRef<str>>(&mut self, cells: &[S]) -> io::Result<()> {
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                write!(self.out, "{}", self.separator)?;
            }
            self.out.write_all(cell.as_ref().as_bytes())?;
        }
        self.out.write_all(b"\n")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Records timestamps between `begin` and `end`.
#[derive(Debug, Default)]
pub struct HostBenchmark {
    origin: Option<Instant>,
    current: Option<BenchmarkLog>,
    last: Option<BenchmarkLog>,
}

impl HostBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new recording, discarding any unfinished one.
    pub fn begin(&mut self) {
        self.origin = Some(Instant::now());
        self.current = Some(BenchmarkLog {
            timestamps: vec![Timestamp { id: Cow::Borrowed(BENCH_BEGIN), at_ms: 0.0 }],
        });
    }

    /// Record a phase boundary. Panics if `begin` was not called.
    pub fn log_timestamp(&mut self, id: impl Into<Cow<'static, str>>) {
        let origin = self.origin.expect("HostBenchmark::log_timestamp called before begin");
        let at_ms = origin.elapsed().as_secs_f64() * 1000.0;
        if let Some(log) = self.current.as_mut() {
            log.timestamps.push(Timestamp { id: id.into(), at_ms });
        }
    }

    /// Finish the recording and keep it as [`last_log`](Self::last_log).
    pub fn end(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.log_timestamp(BENCH_END);
        if let Some(log) = self.current.take() {
            tracing::debug!(total_ms = log.total_ms(), "benchmark finished");
            self.last = Some(log);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    pub fn last_log(&self) -> Option<&BenchmarkLog> {
        self.last.as_ref()
    }
}
