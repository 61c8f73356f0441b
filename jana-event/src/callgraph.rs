use std::sync::Mutex;

use smallvec::SmallVec;

/// One factory dispatch observed on an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallGraphEntry {
    /// Object type name of the requested collection.
    pub object_type: &'static str,
    /// Requested tag.
    pub tag: String,
}

/// Per-event record of factory dispatches, in request order.
///
/// Filled by `Event::get` so that a failing event can report the chain of
/// factories that led up to the failure. Cleared when the event is
/// recycled.
#[derive(Debug, Default)]
pub struct CallGraph {
    entries: Mutex<SmallVec<[CallGraphEntry; 8]>>,
}

impl CallGraph {
    /// Records one dispatch.
    pub fn record(&self, object_type: &'static str, tag: &str) {
        self.entries.lock().unwrap().push(CallGraphEntry {
            object_type,
            tag: tag.to_owned(),
        });
    }

    /// Returns a copy of the recorded dispatches.
    pub fn entries(&self) -> Vec<CallGraphEntry> {
        self.entries.lock().unwrap().to_vec()
    }

    /// Clears the record.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
