use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;

use super::wire::ClientLogEntry;

const BUFFER_CAP: usize = 64;

/// Bounded buffer of notable engine events awaiting best-effort shipping
/// to `POST /api/client/log`. Oldest entries are evicted under pressure.
#[derive(Default)]
pub(crate) struct DiagBuffer {
    entries: Mutex<VecDeque<ClientLogEntry>>,
}

impl DiagBuffer {
    pub fn push(&self, level: &str, message: &str, context: Option<Value>, at_ms: u64) {
        let mut entries = self.entries.lock();
        if entries.len() >= BUFFER_CAP {
            entries.pop_front();
        }
        entries.push_back(ClientLogEntry {
            level: level.to_string(),
            message: message.to_string(),
            context,
            at_ms,
        });
    }

    pub fn drain(&self) -> Vec<ClientLogEntry> {
        self.entries.lock().drain(..).collect()
    }
}
