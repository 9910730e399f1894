use task_graph::TaskGraphRunnerConfig;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadConfig {
    /// Uploads encoded between two flushes of the command stream.
    pub flush_period: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { flush_period: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositorConfig {
    pub runner: TaskGraphRunnerConfig,
    pub upload: UploadConfig,
    /// Entries of the command ring shared with the GPU scheduler.
    pub ring_entries: u32,
    /// Capacity of the flush notice channel.
    pub notify_capacity: usize,
    /// Staging surfaces that may be held or await upload at once.
    pub staging_surfaces: usize,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            runner: TaskGraphRunnerConfig::default(),
            upload: UploadConfig::default(),
            ring_entries: 1024,
            notify_capacity: 16,
            staging_surfaces: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompositorConfigError {
    #[error("raster needs at least one worker thread")]
    NoWorkerThreads,
    #[error("upload flush period must be greater than zero")]
    FlushPeriodZero,
    #[error("command ring of {ring_entries} entries cannot hold an upload")]
    RingTooSmall { ring_entries: u32 },
    #[error("flush notice channel capacity must be greater than zero")]
    NotifyCapacityZero,
    #[error("staging surface budget must be greater than zero")]
    StagingSurfacesZero,
}

/// Smallest ring that fits one upload, its token and the activation wait.
pub const MIN_RING_ENTRIES: u32 = 16;

impl CompositorConfig {
    pub fn validate(&self) -> Result<(), CompositorConfigError> {
        if self.runner.num_threads == 0 {
            return Err(CompositorConfigError::NoWorkerThreads);
        }
        if self.upload.flush_period == 0 {
            return Err(CompositorConfigError::FlushPeriodZero);
        }
        if self.ring_entries < MIN_RING_ENTRIES {
            return Err(CompositorConfigError::RingTooSmall {
                ring_entries: self.ring_entries,
            });
        }
        if self.notify_capacity == 0 {
            return Err(CompositorConfigError::NotifyCapacityZero);
        }
        if self.staging_surfaces == 0 {
            return Err(CompositorConfigError::StagingSurfacesZero);
        }
        Ok(())
    }
}
