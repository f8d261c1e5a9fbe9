use crate::event::InstructionEvent;
use crate::handler::{BranchHandler, NeverBreak, StepHandler};
use bincode::config::{Configuration, Fixint, LittleEndian, Limit, NoLimit};
use bincode::{Decode, Encode};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to encode trace: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode trace: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Trailing bytes after encoded trace: {0} unread")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Step,
    Branch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct TraceEntry {
    pub kind: EntryKind,
    pub event: InstructionEvent,
}

/// Upper bound on the memory a decoded trace may claim. Length prefixes
/// beyond it are rejected before anything is allocated.
pub const MAX_DECODED_TRACE_BYTES: usize = 64 * 1024 * 1024;

/// The ordered sequence of events one concrete run reported to the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ConcolicTrace {
    entries: Vec<TraceEntry>,
}

impl ConcolicTrace {
    fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::legacy()
    }

    fn bounded_config() -> Configuration<LittleEndian, Fixint, Limit<MAX_DECODED_TRACE_BYTES>> {
        Self::bincode_config().with_limit::<MAX_DECODED_TRACE_BYTES>()
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, kind: EntryKind, event: InstructionEvent) {
        self.entries.push(TraceEntry { kind, event });
    }

    pub fn instruction_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.event.id()).collect()
    }

    /// True if `prefix` visits the same instructions, in the same order and
    /// with the same entry kinds, as the start of this trace. Concrete
    /// operand values are not compared.
    ///
    /// A run whose trace is a prefix of an already explored one adds no new
    /// path and can be skipped by the engine.
    pub fn starts_with(&self, prefix: &ConcolicTrace) -> bool {
        prefix.len() <= self.len()
            && prefix
                .entries
                .iter()
                .zip(&self.entries)
                .all(|(p, e)| p.kind == e.kind && p.event.id() == e.event.id())
    }

    /// MD5 hex digest over the (kind, id) sequence.
    pub fn fingerprint(&self) -> String {
        let mut context = md5::Context::new();
        for entry in &self.entries {
            let tag: u8 = match entry.kind {
                EntryKind::Step => 0,
                EntryKind::Branch => 1,
            };
            context.consume([tag]);
            context.consume(entry.event.id().to_le_bytes());
        }
        format!("{:x}", context.compute())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TraceError> {
        Ok(bincode::encode_to_vec(self, Self::bincode_config())?)
    }

    /// Decodes a trace produced by [`Self::to_bytes`]. Input is untrusted:
    /// malformed or oversized data yields an error, never a panic.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TraceError> {
        let (trace, read): (Self, usize) =
            bincode::decode_from_slice(bytes, Self::bounded_config())?;
        if read != bytes.len() {
            return Err(TraceError::TrailingBytes(bytes.len() - read));
        }
        Ok(trace)
    }
}

/// A handler that records every event it receives into a [`ConcolicTrace`].
///
/// The recorder implements both [`StepHandler`] and [`BranchHandler`], so a
/// single instance can fill both registry slots. Its branch verdict comes
/// from an inner policy ([`NeverBreak`] unless configured), consulted after
/// the event is recorded and outside the trace lock.
pub struct TraceRecorder {
    trace: Mutex<ConcolicTrace>,
    verdict: Arc<dyn BranchHandler>,
    max_entries: Option<usize>,
    record_branches: bool,
    dropped: AtomicU64,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            trace: Mutex::new(ConcolicTrace::default()),
            verdict: Arc::new(NeverBreak),
            max_entries: None,
            record_branches: true,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_verdict(mut self, verdict: Arc<dyn BranchHandler>) -> Self {
        self.verdict = verdict;
        self
    }

    /// Caps the trace length; later events are counted in [`Self::dropped`].
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn record_branches(mut self, record: bool) -> Self {
        self.record_branches = record;
        self
    }

    fn record(&self, kind: EntryKind, event: &InstructionEvent) {
        let mut trace = self.trace.lock().unwrap_or_else(PoisonError::into_inner);
        if self.max_entries.is_some_and(|max| trace.len() >= max) {
            drop(trace);
            if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                warn!(
                    "trace full at {} entries, dropping further events",
                    self.max_entries.unwrap_or_default()
                );
            }
            return;
        }
        trace.push(kind, event.clone());
    }

    pub fn snapshot(&self) -> ConcolicTrace {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the recorded trace and starts a fresh one.
    pub fn take(&self) -> ConcolicTrace {
        let mut guard = self.trace.lock().unwrap_or_else(PoisonError::into_inner);
        let trace = std::mem::take(&mut *guard);
        drop(guard);
        self.dropped.store(0, Ordering::Relaxed);
        trace
    }

    pub fn len(&self) -> usize {
        self.trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StepHandler for TraceRecorder {
    fn on_step(&self, event: &InstructionEvent) {
        self.record(EntryKind::Step, event);
    }
}

impl BranchHandler for TraceRecorder {
    fn choose_branch(&self, event: &InstructionEvent) -> bool {
        if self.record_branches {
            self.record(EntryKind::Branch, event);
        }
        self.verdict.choose_branch(event)
    }
}
