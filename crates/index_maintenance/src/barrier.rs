use std::{
    collections::BTreeMap,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::types::SchemaSeq;

/// Counts in-flight operations by the schema sequence number they started
/// under. Dropping a table's data waits until nothing pinned before the drop
/// is still running.
#[derive(Clone, Default)]
pub struct OperationBarrier {
    pinned: Arc<Mutex<BTreeMap<SchemaSeq, usize>>>,
}

impl OperationBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `seq` for as long as the returned guard lives.
    pub fn pin(&self, seq: SchemaSeq) -> OperationPin {
        *self.pinned.lock().entry(seq).or_default() += 1;
        OperationPin {
            pinned: self.pinned.clone(),
            seq,
        }
    }

    /// Number of operations pinned at a sequence strictly older than `seq`.
    pub fn pinned_before(&self, seq: SchemaSeq) -> usize {
        self.pinned.lock().range(..seq).map(|(_, n)| n).sum()
    }
}

pub struct OperationPin {
    pinned: Arc<Mutex<BTreeMap<SchemaSeq, usize>>>,
    seq: SchemaSeq,
}

impl Drop for OperationPin {
    fn drop(&mut self) {
        let mut pinned = self.pinned.lock();
        if let Some(count) = pinned.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                pinned.remove(&self.seq);
            }
        }
    }
}
