use bytemuck::{Pod, Zeroable};
use static_assertions::{assert_eq_size, const_assert_eq};

use crate::shared::{ContextLostReason, TransferBufferId};

/// First entry of every command: size in entries (header included) in the
/// low 21 bits, command id in the high 11 bits.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CommandHeader(u32);

assert_eq_size!(CommandHeader, u32);

impl CommandHeader {
    pub const SIZE_BITS: u32 = 21;
    pub const MAX_SIZE: u32 = (1 << Self::SIZE_BITS) - 1;
    pub const MAX_COMMAND: u32 = (1 << (32 - Self::SIZE_BITS)) - 1;

    pub fn new(command: u32, size: u32) -> Self {
        assert!(size <= Self::MAX_SIZE, "command size {size} exceeds header range");
        assert!(
            command <= Self::MAX_COMMAND,
            "command id {command} exceeds header range"
        );
        Self((command << Self::SIZE_BITS) | size)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn size(self) -> u32 {
        self.0 & Self::MAX_SIZE
    }

    pub fn command(self) -> u32 {
        self.0 >> Self::SIZE_BITS
    }

    fn for_fixed<C: Pod>(id: UploadCommandId) -> Self {
        Self::new(id as u32, entry_count::<C>())
    }
}

fn entry_count<C>() -> u32 {
    (size_of::<C>() / size_of::<u32>()) as u32
}

/// Command ids understood by [`crate::UploadDecoder`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadCommandId {
    Noop = 0,
    SetToken = 1,
    CopyToTexture = 2,
    WaitForUploads = 3,
    LoseContext = 4,
}

impl UploadCommandId {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Noop,
            1 => Self::SetToken,
            2 => Self::CopyToTexture,
            3 => Self::WaitForUploads,
            4 => Self::LoseContext,
            _ => return None,
        })
    }
}

/// Skips `size` entries. Also used to pad the tail of the ring before a wrap.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Noop {
    pub header: CommandHeader,
}

impl Noop {
    pub fn header(size: u32) -> CommandHeader {
        assert!(size >= 1, "noop covers at least its own header");
        CommandHeader::new(UploadCommandId::Noop as u32, size)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SetToken {
    pub header: CommandHeader,
    pub token: u32,
}

impl SetToken {
    pub fn new(token: u32) -> Self {
        Self {
            header: CommandHeader::for_fixed::<Self>(UploadCommandId::SetToken),
            token,
        }
    }
}

/// Copies `width * height` RGBA8 texels, one per entry, from a transfer
/// buffer into a texture.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct CopyToTexture {
    pub header: CommandHeader,
    pub texture_lo: u32,
    pub texture_hi: u32,
    pub width: u32,
    pub height: u32,
    pub buffer_lo: u32,
    pub buffer_hi: u32,
    pub buffer_offset: u32,
}

const_assert_eq!(size_of::<CopyToTexture>(), 8 * size_of::<u32>());

impl CopyToTexture {
    pub fn new(
        texture: u64,
        width: u32,
        height: u32,
        buffer: TransferBufferId,
        buffer_offset: u32,
    ) -> Self {
        let buffer = buffer.to_raw();
        Self {
            header: CommandHeader::for_fixed::<Self>(UploadCommandId::CopyToTexture),
            texture_lo: texture as u32,
            texture_hi: (texture >> 32) as u32,
            width,
            height,
            buffer_lo: buffer as u32,
            buffer_hi: (buffer >> 32) as u32,
            buffer_offset,
        }
    }

    pub fn texture(&self) -> u64 {
        (u64::from(self.texture_hi) << 32) | u64::from(self.texture_lo)
    }

    pub fn buffer(&self) -> TransferBufferId {
        TransferBufferId::from_raw((u64::from(self.buffer_hi) << 32) | u64::from(self.buffer_lo))
    }
}

/// Parks the stream until every command issued before it retired on the GPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct WaitForUploads {
    pub header: CommandHeader,
}

impl WaitForUploads {
    pub fn new() -> Self {
        Self {
            header: CommandHeader::for_fixed::<Self>(UploadCommandId::WaitForUploads),
        }
    }
}

impl Default for WaitForUploads {
    fn default() -> Self {
        Self::new()
    }
}

/// Test hook: makes the decoder report a lost context.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LoseContext {
    pub header: CommandHeader,
    pub reason: u32,
}

impl LoseContext {
    pub fn new(reason: ContextLostReason) -> Self {
        Self {
            header: CommandHeader::for_fixed::<Self>(UploadCommandId::LoseContext),
            reason: reason as u32,
        }
    }
}
