//! Injectable sinks for the human-readable timeline dump.

use std::sync::{Arc, Mutex};

use crate::TimelineInfo;

/// Receives a fresh timeline snapshot every tick.
pub trait DiagnosticsSink: Send {
    fn present(&mut self, info: &TimelineInfo);
}

/// Writes the timeline dump to the `debug` log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn present(&mut self, info: &TimelineInfo) {
        tracing::debug!(
            length = info.length,
            position = info.position,
            bar = info.bar,
            beat = info.beat,
            tempo = info.tempo,
            last_marker = %info.last_marker,
            "timeline"
        );
    }
}

/// Keeps the most recently rendered dump so a host overlay can draw it.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    last: Arc<Mutex<Option<String>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last rendered dump, `None` until the first tick.
    pub fn last(&self) -> Option<String> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

impl DiagnosticsSink for RecordingSink {
    fn present(&mut self, info: &TimelineInfo) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(format!("**Timeline Debug**\n\n{info}"));
        }
    }
}
