use std::collections::VecDeque;
use std::sync::Arc;

use command_buffer::{
    CommandBufferHelper, CommandBufferHelperError, CopyToTexture, TransferBufferId,
    WaitForUploads,
};
use raster_worker_pool::{RasterTask, RasterTaskOutcome, RasterWorkerPoolClient};

use crate::config::UploadConfig;
use crate::staging::StagingSurfaceProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadStats {
    pub tiles_uploaded: u64,
    pub tiles_failed: u64,
    pub tiles_canceled: u64,
    pub flushes: u64,
    pub ring_full_retries: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingUpload {
    texture: u64,
    width: u32,
    height: u32,
    buffer: TransferBufferId,
}

#[derive(Debug, Clone, Copy)]
struct InFlightUpload {
    token: u32,
    buffer: TransferBufferId,
}

/// Turns rasterized tiles into texture upload commands.
///
/// Each upload gets its own staging transfer buffer, destroyed once a token
/// inserted after the copy has been passed by the GPU scheduler. Once the
/// tiles required for activation are uploaded, a wait for their fence is
/// appended; [`Self::is_ready_to_activate`] turns true after it retired.
pub struct TileUploader {
    helper: CommandBufferHelper,
    staging: Arc<StagingSurfaceProvider>,
    config: UploadConfig,
    uploads_since_flush: u32,
    waiting_for_ring: VecDeque<PendingUpload>,
    awaiting_token: Vec<TransferBufferId>,
    in_flight: VecDeque<InFlightUpload>,
    activation_pending: bool,
    activation_wait_encoded: bool,
    activation_token: Option<u32>,
    all_tiles_finished: bool,
    stats: UploadStats,
}

impl TileUploader {
    pub fn new(
        helper: CommandBufferHelper,
        staging: Arc<StagingSurfaceProvider>,
        config: UploadConfig,
    ) -> Self {
        assert!(config.flush_period > 0, "flush period must be greater than zero");
        Self {
            helper,
            staging,
            config,
            uploads_since_flush: 0,
            waiting_for_ring: VecDeque::new(),
            awaiting_token: Vec::new(),
            in_flight: VecDeque::new(),
            activation_pending: false,
            activation_wait_encoded: false,
            activation_token: None,
            all_tiles_finished: false,
            stats: UploadStats::default(),
        }
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    pub fn helper(&self) -> &CommandBufferHelper {
        &self.helper
    }

    /// Uploads not yet handed to the GPU scheduler or not yet retired.
    pub fn pending_uploads(&self) -> usize {
        self.waiting_for_ring.len() + self.awaiting_token.len() + self.in_flight.len()
    }

    pub fn all_tiles_finished(&self) -> bool {
        self.all_tiles_finished
    }

    pub fn is_ready_to_activate(&self) -> bool {
        self.activation_token
            .is_some_and(|token| self.helper.has_token_passed(token))
    }

    pub fn begin_submission(&mut self) {
        self.activation_pending = false;
        self.activation_token = None;
        self.all_tiles_finished = false;
    }

    pub fn flush(&mut self) {
        self.tokenize_encoded_uploads();
        self.helper.flush();
        self.uploads_since_flush = 0;
        self.stats.flushes += 1;
    }

    /// Re-attempts work that did not fit the ring earlier.
    pub fn retry(&mut self) {
        self.issue_pending_uploads();
        if !self.awaiting_token.is_empty() {
            self.flush();
        }
    }

    /// Destroys staging buffers of retired uploads; returns how many.
    pub fn reclaim(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Some(upload) = self.in_flight.front() {
            if !self.helper.has_token_passed(upload.token) {
                break;
            }
            self.helper
                .command_buffer()
                .destroy_transfer_buffer(upload.buffer);
            self.in_flight.pop_front();
            reclaimed += 1;
        }
        reclaimed
    }

    fn stage_tile(&mut self, task: &RasterTask) {
        let resource = task.resource();
        let Some(surface) = self.staging.take_painted(resource.id) else {
            tracing::warn!(resource = resource.id.0, "rasterized tile has no painted surface");
            self.stats.tiles_failed += 1;
            return;
        };
        let texels: Vec<u32> = surface
            .pixels
            .chunks_exact(4)
            .map(|texel| u32::from_le_bytes([texel[0], texel[1], texel[2], texel[3]]))
            .collect();
        let (width, height) = (surface.width, surface.height);
        self.staging.recycle(surface);

        let staged = u32::try_from(texels.len())
            .ok()
            .filter(|len| *len > 0)
            .map(|len| self.helper.command_buffer().create_transfer_buffer(len));
        let buffer = match staged {
            Some(Ok((id, buffer))) => {
                buffer.write_slice(0, &texels);
                id
            }
            Some(Err(error)) => {
                tracing::warn!(%error, resource = resource.id.0, "could not stage tile upload");
                self.stats.tiles_failed += 1;
                return;
            }
            None => {
                tracing::warn!(resource = resource.id.0, "tile has no texels to upload");
                self.stats.tiles_failed += 1;
                return;
            }
        };
        self.waiting_for_ring.push_back(PendingUpload {
            texture: resource.id.0,
            width,
            height,
            buffer,
        });
        self.issue_pending_uploads();
    }

    fn issue_pending_uploads(&mut self) {
        while let Some(&upload) = self.waiting_for_ring.front() {
            let copy = CopyToTexture::new(
                upload.texture,
                upload.width,
                upload.height,
                upload.buffer,
                0,
            );
            match self.helper.encode(&copy) {
                Ok(()) => {
                    self.waiting_for_ring.pop_front();
                    self.awaiting_token.push(upload.buffer);
                    self.stats.tiles_uploaded += 1;
                    self.uploads_since_flush += 1;
                    if self.uploads_since_flush >= self.config.flush_period {
                        self.flush();
                    }
                }
                Err(CommandBufferHelperError::RingFull { .. }) => {
                    self.stats.ring_full_retries += 1;
                    self.flush();
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, texture = upload.texture, "tile upload dropped");
                    self.waiting_for_ring.pop_front();
                    self.helper
                        .command_buffer()
                        .destroy_transfer_buffer(upload.buffer);
                    self.stats.tiles_failed += 1;
                }
            }
        }
        if self.activation_pending {
            self.issue_activation_wait();
        }
    }

    fn issue_activation_wait(&mut self) {
        debug_assert!(self.waiting_for_ring.is_empty());
        if !self.activation_wait_encoded {
            match self.helper.encode(&WaitForUploads::new()) {
                Ok(()) => self.activation_wait_encoded = true,
                Err(error) => return self.defer_activation(error),
            }
        }
        match self.helper.insert_token() {
            Ok(token) => {
                self.in_flight.extend(
                    self.awaiting_token
                        .drain(..)
                        .map(|buffer| InFlightUpload { token, buffer }),
                );
                self.activation_pending = false;
                self.activation_wait_encoded = false;
                self.activation_token = Some(token);
                self.flush();
                tracing::debug!(token, "activation uploads issued");
            }
            Err(error) => self.defer_activation(error),
        }
    }

    fn defer_activation(&mut self, error: CommandBufferHelperError) {
        if let CommandBufferHelperError::RingFull { .. } = error {
            self.stats.ring_full_retries += 1;
            self.flush();
            return;
        }
        self.activation_pending = false;
        tracing::error!(%error, "could not issue the activation wait");
    }

    /// Covers every encoded copy without a token by a new one.
    fn tokenize_encoded_uploads(&mut self) {
        if self.awaiting_token.is_empty() {
            return;
        }
        match self.helper.insert_token() {
            Ok(token) => {
                self.in_flight.extend(
                    self.awaiting_token
                        .drain(..)
                        .map(|buffer| InFlightUpload { token, buffer }),
                );
            }
            Err(error) => {
                tracing::trace!(%error, "upload token deferred");
            }
        }
    }
}

impl RasterWorkerPoolClient for TileUploader {
    fn did_finish_running_tasks(&mut self) {
        self.all_tiles_finished = true;
        self.flush();
    }

    fn did_finish_running_tasks_required_for_activation(&mut self) {
        self.activation_pending = true;
        self.issue_pending_uploads();
    }

    fn did_complete_raster_task(&mut self, task: &RasterTask, outcome: &RasterTaskOutcome) {
        match outcome {
            RasterTaskOutcome::Rasterized => self.stage_tile(task),
            RasterTaskOutcome::RasterFailed(error) => {
                tracing::debug!(%error, resource = task.resource().id.0, "tile not uploaded");
                self.staging.discard_painted(task.resource().id);
                self.stats.tiles_failed += 1;
            }
            RasterTaskOutcome::CanvasUnavailable(error) => {
                tracing::debug!(%error, resource = task.resource().id.0, "tile not uploaded");
                self.stats.tiles_failed += 1;
            }
            RasterTaskOutcome::Canceled => self.stats.tiles_canceled += 1,
        }
    }
}
