use crate::cmds::CommandHeader;
use crate::scheduler::{AsyncApiHandler, CommandContext};
use crate::shared::{CommandBufferError, TransferBuffer};

/// Walks the ring between `get` and `put`, one command at a time.
///
/// Commands never straddle the end of the ring; the producer pads the tail
/// with a noop and restarts at entry 0.
pub struct CommandParser {
    ring: TransferBuffer,
    get: u32,
    put: u32,
    scratch: Vec<u32>,
}

impl CommandParser {
    pub fn new(ring: TransferBuffer) -> Self {
        Self {
            ring,
            get: 0,
            put: 0,
            scratch: Vec::new(),
        }
    }

    pub fn set_buffer(&mut self, ring: TransferBuffer) {
        self.ring = ring;
        self.get = 0;
        self.put = 0;
    }

    pub fn entry_count(&self) -> u32 {
        self.ring.len()
    }

    pub fn get(&self) -> u32 {
        self.get
    }

    pub fn put(&self) -> u32 {
        self.put
    }

    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    pub fn set_get(&mut self, get: u32) -> bool {
        if get >= self.entry_count() {
            return false;
        }
        self.get = get;
        true
    }

    pub fn set_put(&mut self, put: u32) -> Result<(), CommandBufferError> {
        if put >= self.entry_count() {
            return Err(CommandBufferError::InvalidPutOffset {
                put,
                entry_count: self.entry_count(),
            });
        }
        self.put = put;
        Ok(())
    }

    /// Executes the command at `get` and advances past it, also when the
    /// handler fails. A malformed header leaves `get` in place.
    pub fn process_command<H: AsyncApiHandler + ?Sized>(
        &mut self,
        handler: &mut H,
        context: &mut CommandContext<'_>,
    ) -> Result<(), CommandBufferError> {
        debug_assert!(!self.is_empty(), "no command between get and put");
        let get = self.get;
        let entry_count = self.entry_count();
        let header = CommandHeader::from_raw(self.ring.read(get));
        let size = header.size();
        if size == 0 {
            return Err(CommandBufferError::InvalidSize { offset: get });
        }
        if u64::from(get) + u64::from(size) > u64::from(entry_count) {
            return Err(CommandBufferError::OutOfBounds { offset: get, size });
        }
        let in_range = self.ring.read_into(get, size as usize, &mut self.scratch);
        debug_assert!(in_range, "bounds checked above");

        let result = handler.do_command(context, header.command(), &self.scratch);
        self.get = (get + size) % entry_count;
        if let Err(error) = &result {
            tracing::debug!(%error, offset = get, command = header.command(), "command failed");
        }
        result
    }
}

impl std::fmt::Debug for CommandParser {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CommandParser")
            .field("get", &self.get)
            .field("put", &self.put)
            .field("entry_count", &self.entry_count())
            .finish()
    }
}
