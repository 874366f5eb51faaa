//! Phase loggers: the structured side channel of a builder invocation.

use patchsmith_core::{PhaseEvent, PhaseLogger};
use std::sync::Mutex;

/// Emits every event as a `tracing` record under the `patchsmith::phase` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPhaseLogger;

impl PhaseLogger for TracingPhaseLogger {
    fn log(&self, event: &PhaseEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        match event {
            PhaseEvent::PatchRollback { outcome, .. } if !outcome.ok => tracing::error!(
                target: "patchsmith::phase",
                event = event.name(),
                lane = event.lane(),
                payload = %payload,
                "phase event"
            ),
            PhaseEvent::PatchParseFailed { .. } | PhaseEvent::PatchRetry { .. } => tracing::warn!(
                target: "patchsmith::phase",
                event = event.name(),
                lane = event.lane(),
                payload = %payload,
                "phase event"
            ),
            _ => tracing::info!(
                target: "patchsmith::phase",
                event = event.name(),
                lane = event.lane(),
                payload = %payload,
                "phase event"
            ),
        }
    }
}

/// Keeps events in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingPhaseLogger {
    events: Mutex<Vec<PhaseEvent>>,
}

impl RecordingPhaseLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(PhaseEvent::name).collect()
    }
}

impl PhaseLogger for RecordingPhaseLogger {
    fn log(&self, event: &PhaseEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
