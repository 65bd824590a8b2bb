#[cfg(test)]
use std::sync::Mutex;

/// Opaque handle to a sequence object owned by the sequence subsystem.
pub type SeqHandle = u64;

/// Interface to the sequence subsystem.
///
/// Transactions track the sequences they created, dropped, and altered; when
/// the transaction completes, the removal pass fires the matching hook for
/// each tracked handle. What happens depends on the outcome:
///
/// - abort: created sequences are removed, dropped and altered sequences are
///   restored to their pre-transaction state;
/// - commit: dropped sequences and the pre-images of altered sequences are
///   removed permanently.
pub trait SequenceHooks: Send + Sync {
    /// Abort: drop a sequence created inside the transaction.
    fn remove_created(&self, seq: SeqHandle);
    /// Abort: reinstate a sequence the transaction dropped.
    fn restore_dropped(&self, seq: SeqHandle);
    /// Abort: reinstate the pre-image of an altered sequence.
    fn restore_altered(&self, seq: SeqHandle);
    /// Commit: permanently remove a dropped sequence.
    fn remove_dropped(&self, seq: SeqHandle);
    /// Commit: permanently remove the pre-image of an altered sequence.
    fn remove_altered(&self, seq: SeqHandle);
}

/// Default hooks for deployments without the sequence subsystem.
#[derive(Debug, Default)]
pub struct NoopSequenceHooks;

impl SequenceHooks for NoopSequenceHooks {
    fn remove_created(&self, _seq: SeqHandle) {}
    fn restore_dropped(&self, _seq: SeqHandle) {}
    fn restore_altered(&self, _seq: SeqHandle) {}
    fn remove_dropped(&self, _seq: SeqHandle) {}
    fn remove_altered(&self, _seq: SeqHandle) {}
}

/// Test double recording every hook invocation in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSequenceHooks {
    pub calls: Mutex<Vec<(&'static str, SeqHandle)>>,
}

#[cfg(test)]
impl RecordingSequenceHooks {
    fn record(&self, what: &'static str, seq: SeqHandle) {
        self.calls.lock().expect("Mutex poisoned").push((what, seq));
    }

    #[must_use]
    pub fn taken(&self) -> Vec<(&'static str, SeqHandle)> {
        self.calls.lock().expect("Mutex poisoned").clone()
    }
}

#[cfg(test)]
impl SequenceHooks for RecordingSequenceHooks {
    fn remove_created(&self, seq: SeqHandle) {
        self.record("remove_created", seq);
    }
    fn restore_dropped(&self, seq: SeqHandle) {
        self.record("restore_dropped", seq);
    }
    fn restore_altered(&self, seq: SeqHandle) {
        self.record("restore_altered", seq);
    }
    fn remove_dropped(&self, seq: SeqHandle) {
        self.record("remove_dropped", seq);
    }
    fn remove_altered(&self, seq: SeqHandle) {
        self.record("remove_altered", seq);
    }
}
