use crate::task::RasterTask;

/// One raster task in a submission, with its priority relative to the other
/// raster tasks of the same queue (lower runs first).
#[derive(Debug, Clone)]
pub struct QueuedRasterTask {
    pub task: RasterTask,
    pub priority: u32,
    pub required_for_activation: bool,
}

/// Ordered set of raster tasks the client wants run next.
#[derive(Debug, Clone, Default)]
pub struct RasterTaskQueue {
    items: Vec<QueuedRasterTask>,
    required_for_activation_count: usize,
}

impl RasterTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, task: RasterTask, priority: u32, required_for_activation: bool) {
        if required_for_activation {
            self.required_for_activation_count += 1;
        }
        self.items.push(QueuedRasterTask {
            task,
            priority,
            required_for_activation,
        });
    }

    pub fn reset(&mut self) {
        self.items.clear();
        self.required_for_activation_count = 0;
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn required_for_activation_count(&self) -> usize {
        self.required_for_activation_count
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueuedRasterTask> {
        self.items.iter()
    }
}

impl<'a> IntoIterator for &'a RasterTaskQueue {
    type Item = &'a QueuedRasterTask;
    type IntoIter = std::slice::Iter<'a, QueuedRasterTask>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
