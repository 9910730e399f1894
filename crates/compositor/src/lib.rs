//! Wires raster scheduling to GPU texture uploads: tiles rasterized by a
//! [`raster_worker_pool::RasterWorkerPool`] are copied into staging transfer
//! buffers and uploaded through a [`command_buffer::GpuScheduler`].

mod compositor;
mod config;
mod staging;
mod uploader;

pub use compositor::{Compositor, CompositorError};
pub use config::{CompositorConfig, CompositorConfigError, MIN_RING_ENTRIES, UploadConfig};
pub use staging::StagingSurfaceProvider;
pub use uploader::{TileUploader, UploadStats};
