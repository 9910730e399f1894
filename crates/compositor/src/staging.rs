use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use raster_worker_pool::{RasterResource, RasterSurface, ResourceId, SurfaceProvider};

/// CPU staging memory for rasterization. Surfaces released by raster tasks are
/// parked until the uploader copied them into the command stream.
pub struct StagingSurfaceProvider {
    recycled: ArrayQueue<Vec<u8>>,
    budget: usize,
    outstanding: AtomicUsize,
    painted: Mutex<HashMap<ResourceId, RasterSurface>>,
}

impl StagingSurfaceProvider {
    pub fn new(budget: usize) -> Self {
        assert!(budget > 0, "staging budget must be greater than zero");
        Self {
            recycled: ArrayQueue::new(budget),
            budget,
            outstanding: AtomicUsize::new(0),
            painted: Mutex::new(HashMap::new()),
        }
    }

    /// Surfaces held by raster tasks or waiting for upload.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn painted_count(&self) -> usize {
        self.painted.lock().len()
    }

    pub fn take_painted(&self, resource: ResourceId) -> Option<RasterSurface> {
        self.painted.lock().remove(&resource)
    }

    /// Gives the memory of a consumed surface back to the pool.
    pub fn recycle(&self, surface: RasterSurface) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "recycled more surfaces than were acquired");
        // A full free list just drops the allocation.
        let _ = self.recycled.push(surface.pixels);
    }

    pub fn discard_painted(&self, resource: ResourceId) {
        if let Some(surface) = self.take_painted(resource) {
            self.recycle(surface);
        }
    }
}

impl SurfaceProvider for StagingSurfaceProvider {
    fn acquire_surface(&self, resource: &RasterResource) -> Result<RasterSurface, String> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| {
                (outstanding < self.budget).then_some(outstanding + 1)
            })
            .map_err(|_| format!("staging budget of {} surfaces exhausted", self.budget))?;

        let stride = resource.width.saturating_mul(4);
        let len = stride as usize * resource.height as usize;
        let mut pixels = self.recycled.pop().unwrap_or_default();
        pixels.clear();
        pixels.resize(len, 0);
        Ok(RasterSurface {
            resource: resource.id,
            width: resource.width,
            height: resource.height,
            stride,
            pixels,
        })
    }

    fn release_surface(&self, surface: RasterSurface) {
        let replaced = self.painted.lock().insert(surface.resource, surface);
        if let Some(stale) = replaced {
            tracing::debug!(resource = stale.resource.0, "painted surface replaced before upload");
            self.recycle(stale);
        }
    }
}
