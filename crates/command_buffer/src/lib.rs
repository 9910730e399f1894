//! GPU command stream plumbing: a ring of 32-bit entries shared between a
//! producer ([`CommandBufferHelper`]) and a cooperative consumer
//! ([`GpuScheduler`]) that executes commands in order and can park the
//! stream behind GPU fences.

mod cmds;
mod helper;
mod notify;
mod parser;
mod scheduler;
mod shared;
mod upload;

pub use cmds::{
    CommandHeader, CopyToTexture, LoseContext, Noop, SetToken, UploadCommandId, WaitForUploads,
};
pub use helper::{CommandBufferHelper, CommandBufferHelperError};
pub use notify::{FlushChannelError, FlushNotice, FlushNotifier, FlushReceiver, flush_channel};
pub use parser::CommandParser;
pub use scheduler::{
    AsyncApiHandler, CommandContext, FenceId, FenceTask, GpuCommandSink, GpuScheduler,
    SchedulerState, Scheduling,
};
pub use shared::{
    CommandBufferError, CommandBufferState, ContextLostReason, MAX_TRANSFER_BUFFER_ENTRIES,
    SharedCommandBuffer, TransferBuffer, TransferBufferError, TransferBufferId,
};
pub use upload::UploadDecoder;
