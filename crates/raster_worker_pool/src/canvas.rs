use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::task::{RasterResource, ResourceId};

/// CPU-side pixel memory a raster task paints into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterSurface {
    pub resource: ResourceId,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixels: Vec<u8>,
}

impl RasterSurface {
    pub fn new(resource: ResourceId, width: u32, height: u32) -> Self {
        let stride = width.checked_mul(4).expect("surface stride overflow");
        let len = (stride as usize)
            .checked_mul(height as usize)
            .expect("surface byte length overflow");
        Self {
            resource,
            width,
            height,
            stride,
            pixels: vec![0; len],
        }
    }
}

/// Owner of the memory backing raster destinations. Texture accounting and
/// eviction live behind this trait.
pub trait SurfaceProvider: Send + Sync {
    fn acquire_surface(&self, resource: &RasterResource) -> Result<RasterSurface, String>;
    fn release_surface(&self, surface: RasterSurface);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RasterCanvasError {
    #[error("raster surface for resource {} is already held by another task", resource.0)]
    AlreadyHeld { resource: ResourceId },
    #[error("no raster surface available for resource {}: {reason}", resource.0)]
    Unavailable { resource: ResourceId, reason: String },
}

/// Hands out surfaces so that no two tasks hold the same resource at once.
pub(crate) struct CanvasBroker {
    provider: Arc<dyn SurfaceProvider>,
    held: Mutex<HashSet<ResourceId>>,
}

impl CanvasBroker {
    pub(crate) fn new(provider: Arc<dyn SurfaceProvider>) -> Self {
        Self {
            provider,
            held: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn acquire(
        self: &Arc<Self>,
        resource: &RasterResource,
    ) -> Result<ScopedRasterCanvas, RasterCanvasError> {
        if !self.held.lock().insert(resource.id) {
            return Err(RasterCanvasError::AlreadyHeld {
                resource: resource.id,
            });
        }
        match self.provider.acquire_surface(resource) {
            Ok(surface) => Ok(ScopedRasterCanvas {
                broker: Arc::clone(self),
                surface: Some(surface),
            }),
            Err(reason) => {
                self.held.lock().remove(&resource.id);
                Err(RasterCanvasError::Unavailable {
                    resource: resource.id,
                    reason,
                })
            }
        }
    }

    pub(crate) fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, surface: RasterSurface) {
        let resource = surface.resource;
        self.provider.release_surface(surface);
        let was_held = self.held.lock().remove(&resource);
        debug_assert!(was_held, "released surface {} that was not held", resource.0);
    }
}

/// A surface held for rasterization; released back to the provider on drop,
/// whichever way the raster body exits.
pub struct ScopedRasterCanvas {
    broker: Arc<CanvasBroker>,
    surface: Option<RasterSurface>,
}

impl ScopedRasterCanvas {
    pub fn surface(&self) -> &RasterSurface {
        self.surface.as_ref().expect("surface present until drop")
    }

    pub fn surface_mut(&mut self) -> &mut RasterSurface {
        self.surface.as_mut().expect("surface present until drop")
    }
}

impl Drop for ScopedRasterCanvas {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.take() {
            self.broker.release(surface);
        }
    }
}

impl fmt::Debug for ScopedRasterCanvas {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ScopedRasterCanvas")
            .field("resource", &self.surface.as_ref().map(|surface| surface.resource))
            .finish()
    }
}
