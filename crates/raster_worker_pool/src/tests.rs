use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use task_graph::{TaskGraphRunner, TaskGraphRunnerConfig};

use crate::{
    ContentDescriptor, ContentRect, ImageDecodeTask, ImageDecoder, RasterCanvasError,
    RasterCompletionSignal, RasterError, RasterResource, RasterSurface, RasterTask,
    RasterTaskOutcome, RasterTaskQueue, RasterWorkerPool, RasterWorkerPoolClient,
    RasterWorkerPoolError, Rasterizer, ResourceId, SurfaceProvider,
};

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct CountingSurfaceProvider {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl SurfaceProvider for CountingSurfaceProvider {
    fn acquire_surface(&self, resource: &RasterResource) -> Result<RasterSurface, String> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(RasterSurface::new(resource.id, resource.width, resource.height))
    }

    fn release_surface(&self, _surface: RasterSurface) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct ExhaustedSurfaceProvider;

impl SurfaceProvider for ExhaustedSurfaceProvider {
    fn acquire_surface(&self, _resource: &RasterResource) -> Result<RasterSurface, String> {
        Err("texture budget exhausted".to_owned())
    }

    fn release_surface(&self, _surface: RasterSurface) {
        panic!("nothing was acquired");
    }
}

/// Logs each tile it paints, after logging any barrier signal seen so far.
struct RecordingRasterizer {
    log: Log,
    signals: Receiver<RasterCompletionSignal>,
}

impl RecordingRasterizer {
    fn drain_signals(&self) {
        let mut log = self.log.lock();
        for signal in self.signals.try_iter() {
            log.push(format!("{signal:?}"));
        }
    }
}

impl Rasterizer for RecordingRasterizer {
    fn rasterize(
        &self,
        surface: &mut RasterSurface,
        content: &ContentDescriptor,
    ) -> Result<(), RasterError> {
        self.drain_signals();
        surface.pixels.fill(0xff);
        self.log.lock().push(format!("tile{}", content.tile_id));
        Ok(())
    }
}

struct FailingRasterizer;

impl Rasterizer for FailingRasterizer {
    fn rasterize(
        &self,
        surface: &mut RasterSurface,
        _content: &ContentDescriptor,
    ) -> Result<(), RasterError> {
        surface.pixels[0] = 1;
        Err(RasterError::Backend("display list replay failed".to_owned()))
    }
}

struct GateRasterizer {
    started: Sender<()>,
    release: Receiver<()>,
}

impl Rasterizer for GateRasterizer {
    fn rasterize(
        &self,
        _surface: &mut RasterSurface,
        _content: &ContentDescriptor,
    ) -> Result<(), RasterError> {
        self.started.send(()).expect("test waits for the gate");
        self.release.recv().expect("test releases the gate");
        Ok(())
    }
}

struct CountingDecoder {
    decodes: Arc<AtomicUsize>,
    log: Log,
}

impl ImageDecoder for CountingDecoder {
    fn decode(&self) {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("decode".to_owned());
    }
}

#[derive(Default)]
struct RecordingClient {
    finished: usize,
    required_for_activation_finished: usize,
    raster_outcomes: Vec<(u64, RasterTaskOutcome)>,
    decode_completions: Vec<bool>,
}

impl RecordingClient {
    fn outcome_of(&self, tile_id: u64) -> &RasterTaskOutcome {
        &self
            .raster_outcomes
            .iter()
            .find(|(tile, _)| *tile == tile_id)
            .unwrap_or_else(|| panic!("tile {tile_id} was never reported"))
            .1
    }
}

impl RasterWorkerPoolClient for RecordingClient {
    fn did_finish_running_tasks(&mut self) {
        self.finished += 1;
    }

    fn did_finish_running_tasks_required_for_activation(&mut self) {
        self.required_for_activation_finished += 1;
    }

    fn did_complete_raster_task(&mut self, task: &RasterTask, outcome: &RasterTaskOutcome) {
        assert!(task.has_completed());
        self.raster_outcomes
            .push((task.content().tile_id, outcome.clone()));
    }

    fn did_complete_image_decode_task(&mut self, _task: &ImageDecodeTask, was_canceled: bool) {
        self.decode_completions.push(was_canceled);
    }
}

fn single_worker_runner() -> Arc<TaskGraphRunner> {
    Arc::new(
        TaskGraphRunner::new(TaskGraphRunnerConfig {
            num_threads: 1,
            thread_name_prefix: "TestRaster".to_owned(),
        })
        .expect("create task graph runner"),
    )
}

fn tile_task(
    tile_id: u64,
    rasterizer: Arc<dyn Rasterizer>,
    dependencies: Vec<ImageDecodeTask>,
) -> RasterTask {
    RasterTask::new(
        RasterResource {
            id: ResourceId(tile_id),
            width: 4,
            height: 4,
        },
        ContentDescriptor {
            layer_id: 1,
            tile_id,
            content_rect: ContentRect {
                x: 0,
                y: 0,
                width: 4,
                height: 4,
            },
            contents_scale: 1.0,
            source_frame_number: 0,
        },
        rasterizer,
        dependencies,
    )
}

fn run_to_completion(
    runner: &TaskGraphRunner,
    pool: &mut RasterWorkerPool,
    client: &mut RecordingClient,
) {
    runner.wait_for_tasks_to_finish_running(pool.namespace());
    pool.check_for_completed_tasks(client);
}

#[test]
fn required_tile_and_activation_barrier_run_before_other_tiles() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let log = Log::default();
    let rasterizer = Arc::new(RecordingRasterizer {
        log: Arc::clone(&log),
        signals: pool.completion_signals(),
    });

    let mut queue = RasterTaskQueue::new();
    queue.append(tile_task(1, rasterizer.clone(), Vec::new()), 1, false);
    queue.append(tile_task(2, rasterizer.clone(), Vec::new()), 0, true);
    assert_eq!(queue.required_for_activation_count(), 1);
    pool.schedule_tasks(&mut queue).expect("schedule tiles");
    assert!(queue.is_empty());

    runner.wait_for_tasks_to_finish_running(pool.namespace());
    rasterizer.drain_signals();
    assert_eq!(
        *log.lock(),
        vec![
            "tile2".to_owned(),
            "RasterRequiredForActivationFinished".to_owned(),
            "tile1".to_owned(),
            "RasterFinished".to_owned(),
        ]
    );

    let mut client = RecordingClient::default();
    pool.check_for_completed_tasks(&mut client);
    assert_eq!(client.finished, 1);
    assert_eq!(client.required_for_activation_finished, 1);
    assert_eq!(client.outcome_of(1), &RasterTaskOutcome::Rasterized);
    assert_eq!(client.outcome_of(2), &RasterTaskOutcome::Rasterized);
    assert_eq!(pool.pending_task_count(), 0);
}

#[test]
fn barrier_notifications_fire_once_per_submission() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let mut client = RecordingClient::default();

    let mut queue = RasterTaskQueue::new();
    pool.schedule_tasks(&mut queue).expect("schedule empty submission");
    run_to_completion(&runner, &mut pool, &mut client);
    pool.check_for_completed_tasks(&mut client);
    assert_eq!(client.finished, 1);
    assert_eq!(client.required_for_activation_finished, 1);

    let rasterizer = Arc::new(FailingRasterizer);
    queue.append(tile_task(7, rasterizer, Vec::new()), 0, true);
    pool.schedule_tasks(&mut queue).expect("schedule second submission");
    run_to_completion(&runner, &mut pool, &mut client);
    assert_eq!(client.finished, 2);
    assert_eq!(client.required_for_activation_finished, 2);
}

#[test]
fn barriers_that_ran_before_being_superseded_stay_silent() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let mut client = RecordingClient::default();
    let signals = pool.completion_signals();

    let mut queue = RasterTaskQueue::new();
    pool.schedule_tasks(&mut queue).expect("schedule empty submission");
    runner.wait_for_tasks_to_finish_running(pool.namespace());
    assert_eq!(signals.try_iter().count(), 2);

    let (started_sender, started) = bounded(1);
    let (release, release_receiver) = bounded(1);
    let gate = Arc::new(GateRasterizer {
        started: started_sender,
        release: release_receiver,
    });
    queue.append(tile_task(1, gate, Vec::new()), 0, true);
    pool.schedule_tasks(&mut queue).expect("schedule second submission");
    started.recv().expect("tile 1 starts");

    pool.check_for_completed_tasks(&mut client);
    assert_eq!(client.finished, 0);
    assert_eq!(client.required_for_activation_finished, 0);

    release.send(()).expect("release tile 1");
    run_to_completion(&runner, &mut pool, &mut client);
    assert_eq!(client.finished, 1);
    assert_eq!(client.required_for_activation_finished, 1);
    assert_eq!(client.outcome_of(1), &RasterTaskOutcome::Rasterized);
    assert_eq!(pool.pending_task_count(), 0);
}

#[test]
fn surface_is_released_when_rasterization_fails() {
    let runner = single_worker_runner();
    let provider = Arc::new(CountingSurfaceProvider::default());
    let mut pool = RasterWorkerPool::new(Arc::clone(&runner), provider.clone());
    let mut client = RecordingClient::default();

    let mut queue = RasterTaskQueue::new();
    queue.append(tile_task(3, Arc::new(FailingRasterizer), Vec::new()), 0, false);
    pool.schedule_tasks(&mut queue).expect("schedule failing tile");
    run_to_completion(&runner, &mut pool, &mut client);

    assert!(matches!(
        client.outcome_of(3),
        RasterTaskOutcome::RasterFailed(RasterError::Backend(_))
    ));
    assert_eq!(provider.acquired.load(Ordering::SeqCst), 1);
    assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    assert_eq!(pool.held_canvas_count(), 0);
}

#[test]
fn surface_held_elsewhere_is_rejected_until_released() {
    let runner = single_worker_runner();
    let provider = Arc::new(CountingSurfaceProvider::default());
    let mut pool = RasterWorkerPool::new(Arc::clone(&runner), provider.clone());
    let mut client = RecordingClient::default();
    let task = tile_task(5, Arc::new(FailingRasterizer), Vec::new());

    let canvas = pool
        .acquire_canvas_for_raster(&task)
        .expect("first acquire succeeds");
    assert_eq!(canvas.surface().resource, ResourceId(5));
    assert_eq!(
        pool.acquire_canvas_for_raster(&task).unwrap_err(),
        RasterCanvasError::AlreadyHeld {
            resource: ResourceId(5)
        }
    );

    let mut queue = RasterTaskQueue::new();
    queue.append(task.clone(), 0, false);
    pool.schedule_tasks(&mut queue).expect("schedule tile");
    run_to_completion(&runner, &mut pool, &mut client);
    assert_eq!(
        client.outcome_of(5),
        &RasterTaskOutcome::CanvasUnavailable(RasterCanvasError::AlreadyHeld {
            resource: ResourceId(5)
        })
    );

    pool.release_canvas_for_raster(canvas);
    assert_eq!(pool.held_canvas_count(), 0);
    let canvas = pool
        .acquire_canvas_for_raster(&task)
        .expect("acquire after release succeeds");
    drop(canvas);
    assert_eq!(provider.acquired.load(Ordering::SeqCst), 2);
    assert_eq!(provider.released.load(Ordering::SeqCst), 2);
}

#[test]
fn exhausted_provider_is_reported_in_the_outcome() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(Arc::clone(&runner), Arc::new(ExhaustedSurfaceProvider));
    let mut client = RecordingClient::default();

    let mut queue = RasterTaskQueue::new();
    queue.append(tile_task(9, Arc::new(FailingRasterizer), Vec::new()), 0, false);
    pool.schedule_tasks(&mut queue).expect("schedule tile");
    run_to_completion(&runner, &mut pool, &mut client);

    assert!(matches!(
        client.outcome_of(9),
        RasterTaskOutcome::CanvasUnavailable(RasterCanvasError::Unavailable { .. })
    ));
    assert_eq!(pool.held_canvas_count(), 0);
}

#[test]
fn new_submission_cancels_tiles_that_have_not_started() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let log = Log::default();
    let recording = Arc::new(RecordingRasterizer {
        log: Arc::clone(&log),
        signals: crossbeam_channel::never(),
    });
    let (started_sender, started) = bounded(1);
    let (release, release_receiver) = bounded(1);
    let gate = Arc::new(GateRasterizer {
        started: started_sender,
        release: release_receiver,
    });

    let mut queue = RasterTaskQueue::new();
    queue.append(tile_task(1, gate, Vec::new()), 0, true);
    queue.append(tile_task(2, recording.clone(), Vec::new()), 1, true);
    pool.schedule_tasks(&mut queue).expect("schedule first submission");
    started.recv().expect("tile 1 starts");

    queue.append(tile_task(3, recording, Vec::new()), 0, false);
    pool.schedule_tasks(&mut queue).expect("schedule second submission");
    release.send(()).expect("release tile 1");

    let mut client = RecordingClient::default();
    run_to_completion(&runner, &mut pool, &mut client);
    assert_eq!(client.outcome_of(1), &RasterTaskOutcome::Rasterized);
    assert_eq!(client.outcome_of(2), &RasterTaskOutcome::Canceled);
    assert_eq!(client.outcome_of(3), &RasterTaskOutcome::Rasterized);
    assert_eq!(*log.lock(), vec!["tile3".to_owned()]);
    assert_eq!(client.finished, 1);
    assert_eq!(client.required_for_activation_finished, 1);
    assert_eq!(pool.pending_task_count(), 0);
}

#[test]
fn resubmitted_tile_is_reported_once() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let log = Log::default();
    let recording = Arc::new(RecordingRasterizer {
        log: Arc::clone(&log),
        signals: crossbeam_channel::never(),
    });
    let (started_sender, started) = bounded(1);
    let (release, release_receiver) = bounded(1);
    let gate = Arc::new(GateRasterizer {
        started: started_sender,
        release: release_receiver,
    });
    let waiting = tile_task(2, recording, Vec::new());

    let mut queue = RasterTaskQueue::new();
    queue.append(tile_task(1, gate, Vec::new()), 0, false);
    queue.append(waiting.clone(), 1, false);
    pool.schedule_tasks(&mut queue).expect("schedule first submission");
    started.recv().expect("tile 1 starts");

    queue.append(waiting.clone(), 0, true);
    pool.schedule_tasks(&mut queue).expect("resubmit waiting tile");
    release.send(()).expect("release tile 1");

    let mut client = RecordingClient::default();
    run_to_completion(&runner, &mut pool, &mut client);
    let reports = client
        .raster_outcomes
        .iter()
        .filter(|(tile, _)| *tile == 2)
        .count();
    assert_eq!(reports, 1);
    assert_eq!(client.outcome_of(2), &RasterTaskOutcome::Rasterized);
    assert!(waiting.has_completed());
    assert_eq!(*log.lock(), vec!["tile2".to_owned()]);
    assert_eq!(client.finished, 1);
    assert_eq!(client.required_for_activation_finished, 1);
}

#[test]
fn shared_decode_dependency_runs_once_before_its_rasters() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let log = Log::default();
    let decodes = Arc::new(AtomicUsize::new(0));
    let decode = ImageDecodeTask::new(Arc::new(CountingDecoder {
        decodes: Arc::clone(&decodes),
        log: Arc::clone(&log),
    }));
    let rasterizer = Arc::new(RecordingRasterizer {
        log: Arc::clone(&log),
        signals: crossbeam_channel::never(),
    });

    let mut queue = RasterTaskQueue::new();
    queue.append(tile_task(1, rasterizer.clone(), vec![decode.clone()]), 0, false);
    queue.append(tile_task(2, rasterizer.clone(), vec![decode.clone()]), 1, false);
    pool.schedule_tasks(&mut queue).expect("schedule tiles with decode");
    let mut client = RecordingClient::default();
    run_to_completion(&runner, &mut pool, &mut client);

    assert_eq!(
        *log.lock(),
        vec!["decode".to_owned(), "tile1".to_owned(), "tile2".to_owned()]
    );
    assert_eq!(client.decode_completions, vec![false]);
    assert!(decode.has_completed());

    queue.append(tile_task(3, rasterizer, vec![decode]), 0, false);
    pool.schedule_tasks(&mut queue).expect("schedule tile with completed decode");
    run_to_completion(&runner, &mut pool, &mut client);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert_eq!(client.outcome_of(3), &RasterTaskOutcome::Rasterized);
}

#[test]
#[should_panic(expected = "already completed")]
fn completed_raster_task_cannot_be_scheduled_again() {
    let runner = single_worker_runner();
    let mut pool = RasterWorkerPool::new(
        Arc::clone(&runner),
        Arc::new(CountingSurfaceProvider::default()),
    );
    let task = tile_task(4, Arc::new(FailingRasterizer), Vec::new());
    let mut queue = RasterTaskQueue::new();
    queue.append(task.clone(), 0, false);
    pool.schedule_tasks(&mut queue).expect("schedule tile");
    run_to_completion(&runner, &mut pool, &mut RecordingClient::default());

    queue.append(task, 0, false);
    let _ = pool.schedule_tasks(&mut queue);
}

#[test]
fn shutdown_reports_every_task_and_rejects_new_work() {
    let runner = Arc::new(
        TaskGraphRunner::new(TaskGraphRunnerConfig {
            num_threads: 2,
            thread_name_prefix: "TestRaster".to_owned(),
        })
        .expect("create task graph runner"),
    );
    let provider = Arc::new(CountingSurfaceProvider::default());
    let mut pool = RasterWorkerPool::new(Arc::clone(&runner), provider.clone());
    let rasterizer = Arc::new(RecordingRasterizer {
        log: Log::default(),
        signals: crossbeam_channel::never(),
    });

    let mut queue = RasterTaskQueue::new();
    for tile_id in 0..16 {
        queue.append(tile_task(tile_id, rasterizer.clone(), Vec::new()), 0, tile_id < 4);
    }
    pool.schedule_tasks(&mut queue).expect("schedule tiles");
    pool.shutdown();
    assert!(pool.is_shutdown());
    assert_eq!(pool.held_canvas_count(), 0);

    let mut client = RecordingClient::default();
    pool.check_for_completed_tasks(&mut client);
    assert_eq!(client.raster_outcomes.len(), 16);
    assert_eq!(pool.pending_task_count(), 0);
    let rasterized = client
        .raster_outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == RasterTaskOutcome::Rasterized)
        .count();
    assert_eq!(provider.acquired.load(Ordering::SeqCst), rasterized);
    assert_eq!(provider.released.load(Ordering::SeqCst), rasterized);

    queue.append(tile_task(99, rasterizer, Vec::new()), 0, false);
    assert!(matches!(
        pool.schedule_tasks(&mut queue),
        Err(RasterWorkerPoolError::ShutDown)
    ));
    pool.shutdown();
}
