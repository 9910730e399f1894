use bytemuck::Pod;
use thiserror::Error;

use crate::cmds::{CommandHeader, Noop, SetToken};
use crate::notify::{FlushNotice, FlushNotifier};
use crate::shared::{
    CommandBufferError, SharedCommandBuffer, TransferBuffer, TransferBufferError,
    TransferBufferId,
};

const MAX_TOKEN: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandBufferHelperError {
    #[error("command of {entries} entries cannot fit a ring of {capacity} entries")]
    CommandTooLarge { entries: usize, capacity: u32 },
    #[error("ring has {available} free entries but {requested} were requested")]
    RingFull { requested: u32, available: u32 },
    #[error("command stream stopped")]
    Stream(#[from] CommandBufferError),
    #[error("could not allocate the command ring")]
    Ring(#[from] TransferBufferError),
}

/// Producer side of a command stream.
///
/// Writes commands into the ring, publishes them with [`Self::flush`] and
/// tracks tokens. Never blocks: when the scheduler has not consumed enough of
/// the ring the write fails with [`CommandBufferHelperError::RingFull`] and
/// can be retried after the next flush was processed.
pub struct CommandBufferHelper {
    command_buffer: SharedCommandBuffer,
    ring_id: TransferBufferId,
    ring: TransferBuffer,
    put: u32,
    token: u32,
    notifier: Option<FlushNotifier>,
}

impl CommandBufferHelper {
    pub fn new(
        command_buffer: SharedCommandBuffer,
        ring_entries: u32,
    ) -> Result<Self, CommandBufferHelperError> {
        let (ring_id, ring) = command_buffer.create_transfer_buffer(ring_entries)?;
        command_buffer.set_put_offset(0);
        Ok(Self {
            command_buffer,
            ring_id,
            ring,
            put: 0,
            token: 0,
            notifier: None,
        })
    }

    pub fn with_notifier(mut self, notifier: FlushNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn command_buffer(&self) -> &SharedCommandBuffer {
        &self.command_buffer
    }

    pub fn ring_buffer_id(&self) -> TransferBufferId {
        self.ring_id
    }

    pub fn entry_count(&self) -> u32 {
        self.ring.len()
    }

    /// Local put; the scheduler sees it after [`Self::flush`].
    pub fn put_offset(&self) -> u32 {
        self.put
    }

    pub fn get_offset(&self) -> u32 {
        self.command_buffer.get_offset()
    }

    /// One entry always stays free so that `get == put` means empty.
    pub fn available_entries(&self) -> u32 {
        let total = u64::from(self.entry_count());
        let get = u64::from(self.get_offset());
        ((get + total - u64::from(self.put) - 1) % total) as u32
    }

    pub fn error(&self) -> Option<CommandBufferError> {
        self.command_buffer.error()
    }

    pub fn encode<C: Pod>(&mut self, command: &C) -> Result<(), CommandBufferHelperError> {
        let entries: &[u32] = bytemuck::cast_slice(std::slice::from_ref(command));
        debug_assert_eq!(
            CommandHeader::from_raw(entries[0]).size() as usize,
            entries.len(),
            "command header size disagrees with its layout"
        );
        self.encode_entries(entries)
    }

    /// Writes pre-encoded entries; the first must be a header.
    pub fn encode_entries(&mut self, entries: &[u32]) -> Result<(), CommandBufferHelperError> {
        let capacity = self.entry_count();
        let count = u32::try_from(entries.len())
            .ok()
            .filter(|count| *count > 0 && *count < capacity)
            .ok_or(CommandBufferHelperError::CommandTooLarge {
                entries: entries.len(),
                capacity,
            })?;
        self.reserve(count)?;
        let written = self.ring.write_slice(self.put, entries);
        debug_assert!(written, "reserve keeps writes inside the ring");
        self.put = (self.put + count) % capacity;
        Ok(())
    }

    /// Appends a token the scheduler will store once it reaches it.
    pub fn insert_token(&mut self) -> Result<u32, CommandBufferHelperError> {
        let mut token = (self.token + 1) & MAX_TOKEN;
        if token == 0 {
            token = 1;
        }
        self.encode(&SetToken::new(token))?;
        self.token = token;
        Ok(token)
    }

    pub fn last_token_read(&self) -> u32 {
        self.command_buffer.token()
    }

    pub fn has_token_passed(&self, token: u32) -> bool {
        // Tokens above the last inserted one predate a wrap of the counter.
        if token > self.token {
            return true;
        }
        self.last_token_read() >= token
    }

    /// Publishes every command written so far.
    pub fn flush(&mut self) {
        self.command_buffer.set_put_offset(self.put);
        let Some(notifier) = self.notifier.as_mut() else {
            return;
        };
        if !notifier.notify(FlushNotice {
            put_offset: self.put,
        }) {
            tracing::trace!(put = self.put, "flush notice dropped; one is still pending");
        }
    }

    /// True once the scheduler consumed everything that was flushed.
    pub fn is_idle(&self) -> bool {
        self.get_offset() == self.command_buffer.put_offset()
    }

    fn reserve(&mut self, count: u32) -> Result<(), CommandBufferHelperError> {
        if let Some(error) = self.command_buffer.error() {
            return Err(error.into());
        }
        let total = self.entry_count();
        if self.put + count > total {
            // Padding the tail needs get in 1..=put, otherwise the wrapped put
            // would pass get.
            let get = self.get_offset();
            if get > self.put || get == 0 {
                return Err(CommandBufferHelperError::RingFull {
                    requested: count,
                    available: self.available_entries(),
                });
            }
            let mut remaining = total - self.put;
            while remaining > 0 {
                let size = remaining.min(CommandHeader::MAX_SIZE);
                self.ring.write(self.put, Noop::header(size).raw());
                self.put += size;
                remaining -= size;
            }
            self.put = 0;
        }
        let available = self.available_entries();
        if available < count {
            return Err(CommandBufferHelperError::RingFull {
                requested: count,
                available,
            });
        }
        Ok(())
    }
}
