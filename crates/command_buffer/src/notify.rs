use thiserror::Error;

use crate::scheduler::{AsyncApiHandler, GpuCommandSink, GpuScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushNotice {
    pub put_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlushChannelError {
    #[error("flush channel needs a non-zero capacity")]
    ZeroCapacity,
}

/// Producer half, owned by the [`crate::CommandBufferHelper`].
#[derive(Debug)]
pub struct FlushNotifier {
    producer: rtrb::Producer<FlushNotice>,
}

impl FlushNotifier {
    /// Returns false when the channel is full. The scheduler reads the latest
    /// put offset from shared state, so a dropped notice loses nothing as
    /// long as one is still queued.
    pub fn notify(&mut self, notice: FlushNotice) -> bool {
        self.producer.push(notice).is_ok()
    }
}

/// Consumer half, owned by whoever hosts the [`GpuScheduler`].
#[derive(Debug)]
pub struct FlushReceiver {
    consumer: rtrb::Consumer<FlushNotice>,
}

impl FlushReceiver {
    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }

    pub fn is_abandoned(&self) -> bool {
        self.consumer.is_abandoned()
    }

    /// Drains queued notices and lets the scheduler run once if there was
    /// any, or if it still waits on fences. Returns the number of notices.
    pub fn pump<H: AsyncApiHandler, S: GpuCommandSink>(
        &mut self,
        scheduler: &mut GpuScheduler<H, S>,
    ) -> usize {
        let mut notices = 0usize;
        while self.consumer.pop().is_ok() {
            notices += 1;
        }
        if notices > 0 || scheduler.has_more_work() {
            scheduler.put_changed();
        }
        notices
    }
}

pub fn flush_channel(capacity: usize) -> Result<(FlushNotifier, FlushReceiver), FlushChannelError> {
    if capacity == 0 {
        return Err(FlushChannelError::ZeroCapacity);
    }
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    Ok((FlushNotifier { producer }, FlushReceiver { consumer }))
}
