//! Global sequence counters
//!
//! One counter per kind holding the last serial number handed out. The
//! value survives restarts through checkpoints and replayed inserts; the
//! init scan cross-checks it against the records actually present.

use fsledger_common::ObjectKindTag;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct GlobalSequenceTable {
    values: Mutex<[u64; 4]>,
}

impl GlobalSequenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ObjectKindTag) -> u64 {
        self.values.lock()[kind.index()]
    }

    /// Overwrite a counter
    pub fn set(&self, kind: ObjectKindTag, value: u64) {
        self.values.lock()[kind.index()] = value;
    }

    /// Raise a counter to at least `value`
    pub fn advance_to(&self, kind: ObjectKindTag, value: u64) {
        let mut values = self.values.lock();
        let slot = &mut values[kind.index()];
        *slot = (*slot).max(value);
    }

    /// All counters, indexed by [`ObjectKindTag::index`]
    pub fn snapshot(&self) -> [u64; 4] {
        *self.values.lock()
    }
}
