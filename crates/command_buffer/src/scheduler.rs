use std::collections::VecDeque;

use crate::parser::CommandParser;
use crate::shared::{
    CommandBufferError, ContextLostReason, SharedCommandBuffer, TransferBuffer,
    TransferBufferError, TransferBufferId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub u64);

/// The GPU side the scheduler drives. Implementations wrap a real graphics
/// context; tests use recording doubles.
pub trait GpuCommandSink {
    fn flush(&mut self);
    /// Blocks until every issued command retired.
    fn finish(&mut self);
    fn supports_fences(&self) -> bool;
    fn create_fence(&mut self) -> FenceId;
    /// Unknown fences count as passed.
    fn test_fence(&mut self, fence: FenceId) -> bool;
    fn delete_fence(&mut self, fence: FenceId);
    /// Returns false when the context is gone.
    fn copy_to_texture(&mut self, texture: u64, width: u32, height: u32, texels: &[u32]) -> bool;
    fn context_lost_reason(&self) -> ContextLostReason;
}

/// Executes the commands of one stream. `entries` starts with the header.
pub trait AsyncApiHandler {
    fn do_command(
        &mut self,
        context: &mut CommandContext<'_>,
        command: u32,
        entries: &[u32],
    ) -> Result<(), CommandBufferError>;

    fn context_lost_reason(&self) -> ContextLostReason;
}

pub type FenceTask = Box<dyn FnOnce(&mut Scheduling) + Send>;
type Callback = Box<dyn FnMut() + Send>;

struct UnscheduleFence {
    fence: Option<FenceId>,
    task: FenceTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    /// No ring bound yet.
    Idle,
    Running,
    AwaitingFences,
    /// Sticky; nothing runs anymore.
    Error,
    Unscheduled,
}

/// Unschedule counter and fence queue, reachable from command handlers and
/// from fence tasks.
pub struct Scheduling {
    unscheduled_count: u32,
    scheduled_callback: Option<Callback>,
    unschedule_fences: VecDeque<UnscheduleFence>,
}

impl Scheduling {
    fn new() -> Self {
        Self {
            unscheduled_count: 0,
            scheduled_callback: None,
            unschedule_fences: VecDeque::new(),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.unscheduled_count == 0
    }

    pub fn has_pending_fences(&self) -> bool {
        !self.unschedule_fences.is_empty()
    }

    /// Calls nest: every `false` needs a matching `true`.
    pub fn set_scheduled(&mut self, scheduled: bool) {
        if scheduled {
            assert!(
                self.unscheduled_count > 0,
                "set_scheduled(true) without a matching set_scheduled(false)"
            );
            self.unscheduled_count -= 1;
            tracing::trace!(unscheduled_count = self.unscheduled_count, "scheduler rescheduled");
            if self.unscheduled_count == 0 {
                if let Some(callback) = self.scheduled_callback.as_mut() {
                    callback();
                }
            }
        } else {
            self.unscheduled_count += 1;
            tracing::trace!(unscheduled_count = self.unscheduled_count, "scheduler unscheduled");
        }
    }

    fn defer_to_fence(&mut self, sink: &mut dyn GpuCommandSink, task: FenceTask) {
        let fence = sink.supports_fences().then(|| sink.create_fence());
        sink.flush();
        self.unschedule_fences.push_back(UnscheduleFence { fence, task });
    }

    /// Runs the tasks of every retired fence in order. Returns false while
    /// the head fence is still pending.
    fn poll_unschedule_fences(&mut self, sink: &mut dyn GpuCommandSink) -> bool {
        if self.unschedule_fences.is_empty() {
            return true;
        }
        if !sink.supports_fences() {
            sink.finish();
        }
        while let Some(entry) = self.unschedule_fences.pop_front() {
            if let Some(fence) = entry.fence {
                if !sink.test_fence(fence) {
                    self.unschedule_fences.push_front(entry);
                    return false;
                }
                sink.delete_fence(fence);
            }
            (entry.task)(self);
        }
        true
    }
}

/// What a handler may touch while executing one command.
pub struct CommandContext<'a> {
    scheduling: &'a mut Scheduling,
    sink: &'a mut dyn GpuCommandSink,
    command_buffer: &'a SharedCommandBuffer,
}

impl CommandContext<'_> {
    pub fn sink(&mut self) -> &mut dyn GpuCommandSink {
        &mut *self.sink
    }

    /// Stops the drain loop until `task` ran after every command issued so
    /// far retired on the GPU.
    pub fn defer_to_fence(&mut self, task: FenceTask) {
        self.scheduling.defer_to_fence(&mut *self.sink, task);
    }

    pub fn set_scheduled(&mut self, scheduled: bool) {
        self.scheduling.set_scheduled(scheduled);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduling.is_scheduled()
    }

    pub fn set_token(&mut self, token: u32) {
        self.command_buffer.set_token(token);
    }

    pub fn transfer_buffer(&self, id: TransferBufferId) -> Option<TransferBuffer> {
        self.command_buffer.transfer_buffer(id)
    }
}

/// Cooperative consumer of a command stream.
///
/// Never blocks on fences and never spawns threads: the host calls
/// [`Self::put_changed`] whenever the producer flushed, and again while
/// [`Self::has_more_work`] reports outstanding fences.
pub struct GpuScheduler<H, S> {
    command_buffer: SharedCommandBuffer,
    handler: H,
    sink: S,
    parser: Option<CommandParser>,
    scheduling: Scheduling,
    command_processed_callback: Option<Callback>,
}

impl<H: AsyncApiHandler, S: GpuCommandSink> GpuScheduler<H, S> {
    pub fn new(command_buffer: SharedCommandBuffer, handler: H, sink: S) -> Self {
        Self {
            command_buffer,
            handler,
            sink,
            parser: None,
            scheduling: Scheduling::new(),
            command_processed_callback: None,
        }
    }

    pub fn command_buffer(&self) -> &SharedCommandBuffer {
        &self.command_buffer
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn state(&self) -> SchedulerState {
        if self.command_buffer.error().is_some() {
            SchedulerState::Error
        } else if self.parser.is_none() {
            SchedulerState::Idle
        } else if !self.scheduling.is_scheduled() {
            SchedulerState::Unscheduled
        } else if self.scheduling.has_pending_fences() {
            SchedulerState::AwaitingFences
        } else {
            SchedulerState::Running
        }
    }

    /// Binds a registered transfer buffer as the ring and rewinds to entry 0.
    pub fn set_get_buffer(&mut self, id: TransferBufferId) -> Result<(), TransferBufferError> {
        let ring = self
            .command_buffer
            .transfer_buffer(id)
            .ok_or(TransferBufferError::UnknownBuffer { id })?;
        let entry_count = ring.len();
        match self.parser.as_mut() {
            Some(parser) => parser.set_buffer(ring),
            None => self.parser = Some(CommandParser::new(ring)),
        }
        self.set_get_offset(0);
        tracing::debug!(ring = id.to_raw(), entry_count, "command ring bound");
        Ok(())
    }

    pub fn set_get_offset(&mut self, offset: u32) -> bool {
        let Some(parser) = self.parser.as_mut() else {
            return false;
        };
        if !parser.set_get(offset) {
            return false;
        }
        self.command_buffer.set_get_offset(parser.get());
        true
    }

    pub fn get_offset(&self) -> Option<u32> {
        self.parser.as_ref().map(CommandParser::get)
    }

    pub fn set_token(&mut self, token: u32) {
        self.command_buffer.set_token(token);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduling.is_scheduled()
    }

    /// Once the unschedule count drops back to zero, the drain resumes from
    /// the current get offset.
    pub fn set_scheduled(&mut self, scheduled: bool) {
        self.scheduling.set_scheduled(scheduled);
        if scheduled && self.scheduling.is_scheduled() {
            self.put_changed();
        }
    }

    pub fn has_more_work(&self) -> bool {
        self.scheduling.has_pending_fences()
    }

    /// Called each time the unschedule count drops back to zero.
    pub fn set_scheduled_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.scheduling.scheduled_callback = Some(Box::new(callback));
    }

    pub fn set_command_processed_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.command_processed_callback = Some(Box::new(callback));
    }

    pub fn defer_to_fence(&mut self, task: impl FnOnce(&mut Scheduling) + Send + 'static) {
        self.scheduling.defer_to_fence(&mut self.sink, Box::new(task));
    }

    /// Drains the ring up to the shared put offset, stopping early when
    /// unscheduled, behind a fence or on the first error.
    pub fn put_changed(&mut self) {
        let _span = tracing::trace_span!("gpu_scheduler.put_changed").entered();
        let state = self.command_buffer.state();
        let Some(parser) = self.parser.as_mut() else {
            debug_assert_eq!(
                state.get_offset, state.put_offset,
                "commands were put before a ring was bound"
            );
            return;
        };
        if state.error.is_some() {
            return;
        }
        if let Err(error) = parser.set_put(state.put_offset) {
            record_error(&self.command_buffer, &self.handler, error);
            return;
        }

        if !self.scheduling.poll_unschedule_fences(&mut self.sink) {
            return;
        }
        // A fence task may have unscheduled us.
        if !self.scheduling.is_scheduled() {
            return;
        }

        while !parser.is_empty() {
            debug_assert!(self.scheduling.is_scheduled());
            debug_assert!(!self.scheduling.has_pending_fences());
            let mut context = CommandContext {
                scheduling: &mut self.scheduling,
                sink: &mut self.sink,
                command_buffer: &self.command_buffer,
            };
            let result = parser.process_command(&mut self.handler, &mut context);
            self.command_buffer.set_get_offset(parser.get());

            if let Err(error) = result {
                record_error(&self.command_buffer, &self.handler, error);
                return;
            }
            if let Some(callback) = self.command_processed_callback.as_mut() {
                callback();
            }
            if !self.scheduling.is_scheduled() || self.scheduling.has_pending_fences() {
                return;
            }
        }
    }
}

fn record_error(
    command_buffer: &SharedCommandBuffer,
    handler: &impl AsyncApiHandler,
    error: CommandBufferError,
) {
    let reason = handler.context_lost_reason();
    tracing::error!(%error, ?reason, "command stream stopped");
    command_buffer.set_context_lost_reason(reason);
    command_buffer.set_parse_error(error);
}
