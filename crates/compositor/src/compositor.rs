use std::sync::Arc;

use command_buffer::{
    CommandBufferHelper, CommandBufferHelperError, FlushChannelError, FlushReceiver,
    GpuCommandSink, GpuScheduler, SchedulerState, SharedCommandBuffer, TransferBufferError,
    UploadDecoder, flush_channel,
};
use crossbeam_channel::Receiver;
use raster_worker_pool::{
    RasterCompletionSignal, RasterTaskQueue, RasterWorkerPool, RasterWorkerPoolError,
};
use task_graph::{TaskGraphRunner, TaskGraphRunnerCreateError};
use thiserror::Error;

use crate::config::{CompositorConfig, CompositorConfigError};
use crate::staging::StagingSurfaceProvider;
use crate::uploader::TileUploader;

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("invalid compositor configuration")]
    Config(#[from] CompositorConfigError),
    #[error("failed to start raster workers")]
    Runner(#[from] TaskGraphRunnerCreateError),
    #[error("failed to create the command stream")]
    CommandStream(#[from] CommandBufferHelperError),
    #[error("failed to create the flush notice channel")]
    FlushChannel(#[from] FlushChannelError),
    #[error("failed to bind the command ring")]
    RingBinding(#[from] TransferBufferError),
    #[error("raster submission failed")]
    Raster(#[from] RasterWorkerPoolError),
}

/// Raster scheduling and texture upload for one layer tree.
///
/// Everything here runs on the thread that owns the compositor; only raster
/// task bodies run on the worker threads of the shared runner.
pub struct Compositor<S> {
    raster_worker_pool: RasterWorkerPool,
    uploader: TileUploader,
    staging: Arc<StagingSurfaceProvider>,
    scheduler: GpuScheduler<UploadDecoder, S>,
    flush_receiver: FlushReceiver,
}

impl<S: GpuCommandSink> Compositor<S> {
    pub fn new(config: CompositorConfig, sink: S) -> Result<Self, CompositorError> {
        config.validate()?;
        let runner = Arc::new(TaskGraphRunner::new(config.runner.clone())?);
        Self::with_runner(config, runner, sink)
    }

    /// Shares `runner` with other clients; `config.runner` is ignored.
    pub fn with_runner(
        config: CompositorConfig,
        runner: Arc<TaskGraphRunner>,
        sink: S,
    ) -> Result<Self, CompositorError> {
        config.validate()?;
        let staging = Arc::new(StagingSurfaceProvider::new(config.staging_surfaces));
        let command_buffer = SharedCommandBuffer::new();
        let (notifier, flush_receiver) = flush_channel(config.notify_capacity)?;
        let helper = CommandBufferHelper::new(command_buffer.clone(), config.ring_entries)?
            .with_notifier(notifier);
        let mut scheduler = GpuScheduler::new(command_buffer, UploadDecoder::new(), sink);
        scheduler.set_get_buffer(helper.ring_buffer_id())?;

        let raster_worker_pool = RasterWorkerPool::new(runner, staging.clone());
        let uploader = TileUploader::new(helper, Arc::clone(&staging), config.upload);
        tracing::debug!(
            ring_entries = config.ring_entries,
            flush_period = config.upload.flush_period,
            "compositor created"
        );
        Ok(Self {
            raster_worker_pool,
            uploader,
            staging,
            scheduler,
            flush_receiver,
        })
    }

    pub fn schedule_tiles(&mut self, queue: &mut RasterTaskQueue) -> Result<(), CompositorError> {
        self.uploader.begin_submission();
        self.raster_worker_pool.schedule_tasks(queue)?;
        Ok(())
    }

    /// Uploads freshly rasterized tiles and reacts to barrier completion.
    pub fn check_for_completed_tiles(&mut self) {
        self.raster_worker_pool
            .check_for_completed_tasks(&mut self.uploader);
        self.uploader.retry();
    }

    /// Lets the GPU scheduler consume flushed commands. Returns the number of
    /// flush notices seen.
    pub fn pump_gpu(&mut self) -> usize {
        let notices = self.flush_receiver.pump(&mut self.scheduler);
        self.uploader.reclaim();
        self.uploader.retry();
        notices
    }

    pub fn completion_signals(&self) -> Receiver<RasterCompletionSignal> {
        self.raster_worker_pool.completion_signals()
    }

    pub fn all_tiles_finished(&self) -> bool {
        self.uploader.all_tiles_finished()
    }

    pub fn is_ready_to_activate(&self) -> bool {
        self.uploader.is_ready_to_activate()
    }

    pub fn gpu_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &GpuScheduler<UploadDecoder, S> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut GpuScheduler<UploadDecoder, S> {
        &mut self.scheduler
    }

    pub fn uploader(&self) -> &TileUploader {
        &self.uploader
    }

    pub fn staging(&self) -> &StagingSurfaceProvider {
        &self.staging
    }

    pub fn raster_worker_pool(&self) -> &RasterWorkerPool {
        &self.raster_worker_pool
    }

    /// Stops raster work, uploads what already finished and hands the
    /// remaining commands to the GPU scheduler.
    pub fn shutdown(&mut self) {
        let _span = tracing::debug_span!("compositor.shutdown").entered();
        self.raster_worker_pool.shutdown();
        self.raster_worker_pool
            .check_for_completed_tasks(&mut self.uploader);
        self.uploader.retry();
        self.uploader.flush();
        self.pump_gpu();
    }
}
