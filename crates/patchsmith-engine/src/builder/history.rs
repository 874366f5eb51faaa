use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One resolved builder turn, replayed into later prompts of the same lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneTurn {
    pub intent: String,
    pub summary: String,
}

/// Append-only per-lane conversation memory, shared between runners.
#[derive(Debug, Clone, Default)]
pub struct LaneHistory {
    inner: Arc<Mutex<HashMap<String, Vec<LaneTurn>>>>,
}

impl LaneHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self, lane: &str) -> Vec<LaneTurn> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(lane)
            .cloned()
            .unwrap_or_default()
    }

    pub fn append(&self, lane: &str, turn: LaneTurn) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(lane.to_string())
            .or_default()
            .push(turn);
    }
}
