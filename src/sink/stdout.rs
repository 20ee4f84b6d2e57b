use std::io::Write;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::SINK_STDOUT;
use crate::error::{AppError, Result};
use crate::sink::Sink;
use crate::types::DomainEvent;

/// One JSON document per line.
pub struct StdoutSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &str {
        SINK_STDOUT
    }

    async fn publish(&self, event: &DomainEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut out = self
            .out
            .lock()
            .map_err(|_| AppError::sink(SINK_STDOUT, "writer lock poisoned"))?;
        out.write_all(&line)?;
        out.flush()?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Ok(mut out) = self.out.lock() {
            out.flush()?;
        }
        Ok(())
    }
}
