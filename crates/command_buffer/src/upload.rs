use bytemuck::Pod;

use crate::cmds::{CopyToTexture, LoseContext, SetToken, UploadCommandId, WaitForUploads};
use crate::scheduler::{AsyncApiHandler, CommandContext};
use crate::shared::{CommandBufferError, ContextLostReason};

/// Handler for the texture upload command set.
#[derive(Debug, Default)]
pub struct UploadDecoder {
    context_lost_reason: Option<ContextLostReason>,
    texels: Vec<u32>,
    uploads: u64,
}

impl UploadDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    fn copy_to_texture(
        &mut self,
        context: &mut CommandContext<'_>,
        command: &CopyToTexture,
    ) -> Result<(), CommandBufferError> {
        let invalid = CommandBufferError::InvalidArguments {
            command: UploadCommandId::CopyToTexture as u32,
        };
        let texel_count = (command.width as usize)
            .checked_mul(command.height as usize)
            .ok_or_else(|| invalid.clone())?;
        let buffer = context
            .transfer_buffer(command.buffer())
            .ok_or_else(|| invalid.clone())?;
        if !buffer.read_into(command.buffer_offset, texel_count, &mut self.texels) {
            return Err(invalid);
        }
        if !context.sink().copy_to_texture(
            command.texture(),
            command.width,
            command.height,
            &self.texels,
        ) {
            self.context_lost_reason = Some(context.sink().context_lost_reason());
            return Err(CommandBufferError::LostContext);
        }
        self.uploads += 1;
        Ok(())
    }
}

fn read_command<C: Pod>(command: u32, entries: &[u32]) -> Result<C, CommandBufferError> {
    bytemuck::try_pod_read_unaligned(bytemuck::cast_slice(entries))
        .map_err(|_| CommandBufferError::InvalidArguments { command })
}

impl AsyncApiHandler for UploadDecoder {
    fn do_command(
        &mut self,
        context: &mut CommandContext<'_>,
        command: u32,
        entries: &[u32],
    ) -> Result<(), CommandBufferError> {
        let Some(id) = UploadCommandId::from_raw(command) else {
            return Err(CommandBufferError::UnknownCommand { command });
        };
        match id {
            UploadCommandId::Noop => Ok(()),
            UploadCommandId::SetToken => {
                let set_token: SetToken = read_command(command, entries)?;
                context.set_token(set_token.token);
                Ok(())
            }
            UploadCommandId::CopyToTexture => {
                let copy: CopyToTexture = read_command(command, entries)?;
                self.copy_to_texture(context, &copy)
            }
            UploadCommandId::WaitForUploads => {
                let _: WaitForUploads = read_command(command, entries)?;
                context.set_scheduled(false);
                context.defer_to_fence(Box::new(|scheduling| scheduling.set_scheduled(true)));
                Ok(())
            }
            UploadCommandId::LoseContext => {
                let lose: LoseContext = read_command(command, entries)?;
                self.context_lost_reason = Some(ContextLostReason::from_raw(lose.reason));
                Err(CommandBufferError::LostContext)
            }
        }
    }

    fn context_lost_reason(&self) -> ContextLostReason {
        self.context_lost_reason.unwrap_or_default()
    }
}
