//! Reporting of run progress.
//!
//! The harness reports through an [`EventSink`]. [`TpsWriter`] renders the
//! events in the `application/X-atf-tps` format consumed by report tools:
//!
//! ```text
//! Content-Type: application/X-atf-tps; version="3"
//!
//! tps-count: 1
//! tp-start: 1700000000.123456, /path/to/program, 1
//! tc-start: 1700000000.124000, first
//! tc-so:some output
//! tc-end: 1700000000.130000, first, passed
//! tp-end: 1700000000.130100, /path/to/program
//! ```

use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;

use crate::reconcile::Outcome;

const TPS_HEADER: &str = "Content-Type: application/X-atf-tps; version=\"3\"";

/// Receives progress events from the harness, in order.
pub trait EventSink {
    fn start_tp(&mut self, program: &Path, ntcs: usize) -> io::Result<()>;

    /// Ends the current test program. `reason` is set when it was broken.
    fn end_tp(&mut self, reason: Option<&str>) -> io::Result<()>;

    fn start_tc(&mut self, name: &str) -> io::Result<()>;

    fn stdout_line(&mut self, line: &str) -> io::Result<()>;

    fn stderr_line(&mut self, line: &str) -> io::Result<()>;

    /// Ends the current test case with its final outcome.
    fn end_tc(&mut self, outcome: &Outcome) -> io::Result<()>;
}

fn timestamp() -> String {
    let now = Utc::now();
    format!("{}.{:06}", now.timestamp(), now.timestamp_subsec_micros())
}

/// Writes events as an `application/X-atf-tps` stream.
#[derive(Debug)]
pub struct TpsWriter<W: Write> {
    out: W,
    program: Option<String>,
    case: Option<String>,
}

impl<W: Write> TpsWriter<W> {
    /// Writes the stream header announcing `ntps` test programs.
    pub fn new(mut out: W, ntps: usize) -> io::Result<Self> {
        writeln!(out, "{TPS_HEADER}")?;
        writeln!(out)?;
        writeln!(out, "tps-count: {ntps}")?;
        out.flush()?;
        Ok(Self {
            out,
            program: None,
            case: None,
        })
    }

    /// Flushes and hands back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

impl<W: Write> EventSink for TpsWriter<W> {
    fn start_tp(&mut self, program: &Path, ntcs: usize) -> io::Result<()> {
        let program = program.display().to_string();
        writeln!(self.out, "tp-start: {}, {program}, {ntcs}", timestamp())?;
        self.program = Some(program);
        self.out.flush()
    }

    fn end_tp(&mut self, reason: Option<&str>) -> io::Result<()> {
        let program = self.program.take().unwrap_or_default();
        match reason {
            Some(reason) => writeln!(self.out, "tp-end: {}, {program}, {reason}", timestamp())?,
            None => writeln!(self.out, "tp-end: {}, {program}", timestamp())?,
        }
        self.out.flush()
    }

    fn start_tc(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.out, "tc-start: {}, {name}", timestamp())?;
        self.case = Some(name.to_string());
        self.out.flush()
    }

    fn stdout_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "tc-so:{line}")
    }

    fn stderr_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "tc-se:{line}")
    }

    fn end_tc(&mut self, outcome: &Outcome) -> io::Result<()> {
        let name = self.case.take().unwrap_or_default();
        let state = outcome.reported_state();
        if outcome.reason.is_empty() {
            writeln!(self.out, "tc-end: {}, {name}, {state}", timestamp())?;
        } else {
            writeln!(
                self.out,
                "tc-end: {}, {name}, {state}, {}",
                timestamp(),
                outcome.reason
            )?;
        }
        self.out.flush()
    }
}
