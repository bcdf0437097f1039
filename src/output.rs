use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::batch::BatchReport;
use crate::upload::{ProgressEvent, ProgressSink, UploadReceipt};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Quiet,
    Verbose,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_receipt(receipt: &UploadReceipt) -> io::Result<()> {
        Self::print_json(receipt)
    }

    pub fn print_batch(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

pub fn sink_for(mode: OutputMode) -> &'static dyn ProgressSink {
    match mode {
        OutputMode::Quiet => &JsonOutput,
        OutputMode::Verbose => &LogSink,
    }
}
