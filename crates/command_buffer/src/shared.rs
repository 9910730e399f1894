use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use slotmap::{Key, KeyData, SlotMap};
use thiserror::Error;

pub const MAX_TRANSFER_BUFFER_ENTRIES: u32 = 1 << 24;

slotmap::new_key_type! {
    pub struct TransferBufferId;
}

impl TransferBufferId {
    /// Stable encoding used to pass the id through the command stream.
    pub fn to_raw(self) -> u64 {
        self.data().as_ffi()
    }

    pub fn from_raw(raw: u64) -> Self {
        KeyData::from_ffi(raw).into()
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContextLostReason {
    /// This context caused the loss.
    Guilty = 0,
    /// Another context caused the loss.
    Innocent = 1,
    #[default]
    Unknown = 2,
}

impl ContextLostReason {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Guilty,
            1 => Self::Innocent,
            _ => Self::Unknown,
        }
    }
}

/// Terminal parse or execution error of a command stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandBufferError {
    #[error("command at entry {offset} has an invalid size")]
    InvalidSize { offset: u32 },
    #[error("command at entry {offset} with {size} entries runs past the end of the ring")]
    OutOfBounds { offset: u32, size: u32 },
    #[error("put offset {put} is outside of a ring of {entry_count} entries")]
    InvalidPutOffset { put: u32, entry_count: u32 },
    #[error("unknown command id {command}")]
    UnknownCommand { command: u32 },
    #[error("invalid arguments for command id {command}")]
    InvalidArguments { command: u32 },
    #[error("graphics context lost")]
    LostContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferBufferError {
    #[error("transfer buffer needs at least one entry")]
    ZeroSize,
    #[error(
        "transfer buffer of {entries} entries exceeds the limit of {max}",
        max = MAX_TRANSFER_BUFFER_ENTRIES
    )]
    TooLarge { entries: u32 },
    #[error("unknown transfer buffer {}", id.to_raw())]
    UnknownBuffer { id: TransferBufferId },
}

/// Shared memory region made of 32-bit entries. Writers and readers agree on
/// visibility through the put/get offsets, so entry accesses are relaxed.
#[derive(Clone)]
pub struct TransferBuffer {
    entries: Arc<[AtomicU32]>,
}

impl TransferBuffer {
    fn new(entry_count: u32) -> Self {
        Self {
            entries: (0..entry_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn read(&self, index: u32) -> u32 {
        self.entries[index as usize].load(Ordering::Relaxed)
    }

    pub fn write(&self, index: u32, value: u32) {
        self.entries[index as usize].store(value, Ordering::Relaxed);
    }

    /// Copies `values` starting at `offset`. Returns false when out of range.
    pub fn write_slice(&self, offset: u32, values: &[u32]) -> bool {
        let Some(range) = self.range(offset, values.len()) else {
            return false;
        };
        for (entry, value) in self.entries[range].iter().zip(values) {
            entry.store(*value, Ordering::Relaxed);
        }
        true
    }

    /// Replaces `out` with `len` entries starting at `offset`. Returns false
    /// when out of range.
    pub fn read_into(&self, offset: u32, len: usize, out: &mut Vec<u32>) -> bool {
        let Some(range) = self.range(offset, len) else {
            return false;
        };
        out.clear();
        out.extend(
            self.entries[range]
                .iter()
                .map(|entry| entry.load(Ordering::Relaxed)),
        );
        true
    }

    fn range(&self, offset: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len)?;
        (end <= self.entries.len()).then_some(start..end)
    }
}

impl std::fmt::Debug for TransferBuffer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TransferBuffer")
            .field("len", &self.entries.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBufferState {
    pub get_offset: u32,
    pub put_offset: u32,
    pub token: u32,
    pub error: Option<CommandBufferError>,
    pub context_lost_reason: ContextLostReason,
}

struct SharedState {
    get_offset: AtomicU32,
    put_offset: AtomicU32,
    token: AtomicU32,
    error: Mutex<Option<CommandBufferError>>,
    context_lost_reason: AtomicU32,
    transfer_buffers: Mutex<SlotMap<TransferBufferId, TransferBuffer>>,
}

/// State shared by the producer and the scheduler of one command stream.
///
/// `put` is written only by the producer; `get`, `token`, the error and the
/// context lost reason only by the scheduler. Offsets are published with
/// release stores so that ring entries written before them are visible to the
/// other side.
#[derive(Clone)]
pub struct SharedCommandBuffer {
    inner: Arc<SharedState>,
}

impl SharedCommandBuffer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SharedState {
                get_offset: AtomicU32::new(0),
                put_offset: AtomicU32::new(0),
                token: AtomicU32::new(0),
                error: Mutex::new(None),
                context_lost_reason: AtomicU32::new(ContextLostReason::Unknown as u32),
                transfer_buffers: Mutex::new(SlotMap::with_key()),
            }),
        }
    }

    pub fn create_transfer_buffer(
        &self,
        entry_count: u32,
    ) -> Result<(TransferBufferId, TransferBuffer), TransferBufferError> {
        if entry_count == 0 {
            return Err(TransferBufferError::ZeroSize);
        }
        if entry_count > MAX_TRANSFER_BUFFER_ENTRIES {
            return Err(TransferBufferError::TooLarge {
                entries: entry_count,
            });
        }
        let buffer = TransferBuffer::new(entry_count);
        let id = self.inner.transfer_buffers.lock().insert(buffer.clone());
        tracing::trace!(id = id.to_raw(), entry_count, "transfer buffer created");
        Ok((id, buffer))
    }

    pub fn transfer_buffer(&self, id: TransferBufferId) -> Option<TransferBuffer> {
        self.inner.transfer_buffers.lock().get(id).cloned()
    }

    /// Unregisters the buffer. Holders of a clone keep the memory alive.
    pub fn destroy_transfer_buffer(&self, id: TransferBufferId) -> bool {
        self.inner.transfer_buffers.lock().remove(id).is_some()
    }

    pub fn transfer_buffer_count(&self) -> usize {
        self.inner.transfer_buffers.lock().len()
    }

    pub fn state(&self) -> CommandBufferState {
        CommandBufferState {
            get_offset: self.get_offset(),
            put_offset: self.put_offset(),
            token: self.token(),
            error: self.error(),
            context_lost_reason: self.context_lost_reason(),
        }
    }

    pub fn get_offset(&self) -> u32 {
        self.inner.get_offset.load(Ordering::Acquire)
    }

    pub fn put_offset(&self) -> u32 {
        self.inner.put_offset.load(Ordering::Acquire)
    }

    pub fn token(&self) -> u32 {
        self.inner.token.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<CommandBufferError> {
        self.inner.error.lock().clone()
    }

    pub fn context_lost_reason(&self) -> ContextLostReason {
        ContextLostReason::from_raw(self.inner.context_lost_reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_put_offset(&self, put: u32) {
        self.inner.put_offset.store(put, Ordering::Release);
    }

    pub(crate) fn set_get_offset(&self, get: u32) {
        self.inner.get_offset.store(get, Ordering::Release);
    }

    pub(crate) fn set_token(&self, token: u32) {
        self.inner.token.store(token, Ordering::Release);
    }

    /// The first error sticks; later ones are dropped.
    pub(crate) fn set_parse_error(&self, error: CommandBufferError) {
        let mut current = self.inner.error.lock();
        if current.is_none() {
            *current = Some(error);
        }
    }

    pub(crate) fn set_context_lost_reason(&self, reason: ContextLostReason) {
        self.inner
            .context_lost_reason
            .store(reason as u32, Ordering::Release);
    }
}

impl Default for SharedCommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedCommandBuffer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SharedCommandBuffer")
            .field("state", &self.state())
            .finish()
    }
}
