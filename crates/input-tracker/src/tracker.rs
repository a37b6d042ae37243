use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::bucket::{ActivityCounter, ActivitySample};
use crate::config::TrackerConfig;
use crate::db::{ActivityRecord, ActivityStore};
use crate::error::{Result, TrackerError};
use crate::surface::{InputKind, InputSurface, SurfaceId, SurfaceRegistry};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Shared {
    enabled: bool,
    counter: ActivityCounter,
    surfaces: SurfaceRegistry,
}

impl Shared {
    fn notify(&self) {
        if self.enabled {
            self.counter.notify();
        }
    }

    fn on_raw_input(&self, surface: SurfaceId, kind: InputKind) {
        if self.enabled && kind.is_qualifying() && self.surfaces.contains(surface) {
            self.counter.notify();
        }
    }
}

/// Cheap handle for forwarding input from any thread.
#[derive(Clone)]
pub struct InputNotifier {
    shared: Arc<Shared>,
}

impl InputNotifier {
    pub fn notify_input(&self) {
        self.shared.notify();
    }

    pub fn on_raw_input(&self, surface: SurfaceId, kind: InputKind) {
        self.shared.on_raw_input(surface, kind);
    }

    /// Whether input from `surface` currently counts.
    pub fn is_registered(&self, surface: SurfaceId) -> bool {
        self.shared.surfaces.contains(surface)
    }
}

#[derive(Debug, Clone)]
struct RecordContext {
    process_id: u32,
    action_id: i64,
    machine_name: String,
    user_name: String,
}

impl RecordContext {
    fn from_config(config: &TrackerConfig) -> Self {
        Self {
            process_id: config.process_id,
            action_id: config.action_id,
            machine_name: config.machine_name.clone(),
            user_name: config.user_name.clone(),
        }
    }

    fn record(&self, sample: ActivitySample) -> ActivityRecord {
        ActivityRecord {
            minute: sample.start,
            active_seconds: sample.active_seconds,
            process_id: self.process_id,
            action_id: self.action_id,
            machine_name: self.machine_name.clone(),
            user_name: self.user_name.clone(),
        }
    }
}

#[derive(Default)]
struct StopSignal {
    raised: Mutex<bool>,
    cvar: Condvar,
}

impl StopSignal {
    fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        *raised = true;
        self.cvar.notify_all();
    }

    /// Blocks until `deadline` passes or the signal is raised. Returns true
    /// when raised.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *raised {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cvar
                .wait_timeout(raised, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            raised = guard;
        }
    }
}

struct Workers {
    sampler: JoinHandle<()>,
    roller: JoinHandle<()>,
    persister: JoinHandle<()>,
    queue: mpsc::Sender<ActivitySample>,
}

/// Counts active seconds per minute from raw input and persists each
/// completed minute through an [`ActivityStore`].
///
/// Three background threads do the work once [`start`](Self::start) is
/// called: a sampler on every sample boundary, a roller on every bucket
/// boundary, and a persister draining completed buckets in order. Dropping
/// the tracker runs [`stop`](Self::stop).
pub struct ActivityTracker {
    config: TrackerConfig,
    context: RecordContext,
    shared: Arc<Shared>,
    store: Arc<dyn ActivityStore>,
    stop: Arc<StopSignal>,
    workers: Option<Workers>,
    started: bool,
}

impl ActivityTracker {
    pub fn new(config: TrackerConfig, store: Arc<dyn ActivityStore>) -> Result<Self> {
        if config.enabled {
            config.validate()?;
        }

        let shared = Arc::new(Shared {
            enabled: config.enabled,
            counter: ActivityCounter::new(
                config.bucket_span,
                config.sample_interval,
                config.samples_per_bucket(),
            ),
            surfaces: SurfaceRegistry::default(),
        });

        Ok(Self {
            context: RecordContext::from_config(&config),
            config,
            shared,
            store,
            stop: Arc::new(StopSignal::default()),
            workers: None,
            started: false,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    pub fn notifier(&self) -> InputNotifier {
        InputNotifier {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn notify_input(&self) {
        self.shared.notify();
    }

    pub fn on_raw_input(&self, surface: SurfaceId, kind: InputKind) {
        self.shared.on_raw_input(surface, kind);
    }

    /// Hands out an id unique within this tracker.
    pub fn new_surface_id(&self) -> SurfaceId {
        self.shared.surfaces.allocate()
    }

    pub fn register_surface<S: InputSurface + ?Sized>(&self, surface: &S) -> Result<()> {
        let id = surface.surface_id();
        self.shared.surfaces.register(id)?;
        debug!("registered input surface {id}");
        Ok(())
    }

    pub fn unregister_surface<S: InputSurface + ?Sized>(&self, surface: &S) -> Result<()> {
        let id = surface.surface_id();
        self.shared.surfaces.unregister(id)?;
        debug!("unregistered input surface {id}");
        Ok(())
    }

    pub fn surface_count(&self) -> usize {
        self.shared.surfaces.len()
    }

    /// The bucket currently being filled, if it has seen input.
    pub fn current_bucket(&self) -> Option<ActivitySample> {
        self.shared.counter.current()
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.shared.enabled {
            debug!("input activity tracking disabled; not starting");
            return Ok(());
        }
        if self.started {
            return Err(TrackerError::AlreadyStarted);
        }
        self.started = true;

        let (queue, pending) = mpsc::channel::<ActivitySample>();

        let store = Arc::clone(&self.store);
        let context = self.context.clone();
        let persister = spawn("input-persister", move || {
            while let Ok(sample) = pending.recv() {
                persist(store.as_ref(), &context, sample);
            }
        })?;

        let sampler = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&self.stop);
            let queue = queue.clone();
            let interval = self.config.sample_interval;
            spawn("input-sampler", move || {
                run_on_boundaries(&stop, interval, Duration::ZERO, wall_clock_ms, |tick| {
                    shared.counter.sample(tick, |completed| enqueue(&queue, completed));
                });
            })
        };
        let sampler = match sampler {
            Ok(handle) => handle,
            Err(err) => {
                self.stop.raise();
                return Err(err);
            }
        };

        let roller = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&self.stop);
            let queue = queue.clone();
            let span = self.config.bucket_span;
            // One sample after the bucket boundary, once the sampler has
            // counted the bucket's last interval.
            let offset = self.config.sample_interval;
            spawn("input-roller", move || {
                run_on_boundaries(&stop, span, offset, wall_clock_ms, |tick| {
                    shared.counter.roll(tick, |completed| enqueue(&queue, completed));
                });
            })
        };
        let roller = match roller {
            Ok(handle) => handle,
            Err(err) => {
                self.stop.raise();
                return Err(err);
            }
        };

        self.workers = Some(Workers {
            sampler,
            roller,
            persister,
            queue,
        });

        info!(
            "input activity tracker started | process={} | action={} | sample={}ms | bucket={}ms",
            self.context.process_id,
            self.context.action_id,
            self.config.sample_interval.as_millis(),
            self.config.bucket_span.as_millis()
        );
        Ok(())
    }

    /// Stops the background threads and flushes the partial bucket. Safe to
    /// call more than once; never panics.
    pub fn stop(&mut self) {
        let Some(workers) = self.workers.take() else {
            return;
        };

        self.stop.raise();
        let deadline = Instant::now() + self.config.shutdown_grace;
        join_with_grace("input-sampler", workers.sampler, deadline);
        join_with_grace("input-roller", workers.roller, deadline);

        // Input seen since the last tick still belongs to the current bucket.
        let queue = workers.queue;
        self.shared
            .counter
            .drain(Utc::now(), |completed| enqueue(&queue, completed));
        drop(queue);
        join_with_grace("input-persister", workers.persister, deadline);

        if let Some(partial) = self.shared.counter.take_partial() {
            persist(self.store.as_ref(), &self.context, partial);
        }
        info!("input activity tracker stopped");
    }
}

impl Drop for ActivityTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn(name: &'static str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .map_err(|source| TrackerError::Spawn { name, source })
}

fn wall_clock_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Calls `tick` with each wall-clock boundary `k * period + offset` until
/// `stop` is raised. The next boundary is recomputed from `clock` every time,
/// so a late wake-up does not shift later ticks and a clock step in either
/// direction costs at most one period.
fn run_on_boundaries(
    stop: &StopSignal,
    period: Duration,
    offset: Duration,
    clock: impl Fn() -> i64,
    mut tick: impl FnMut(DateTime<Utc>),
) {
    let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1);
    let offset_ms = i64::try_from(offset.as_millis()).unwrap_or(0);
    let mut last_boundary = None;

    loop {
        let now_ms = clock();
        let next_ms = next_boundary(now_ms, period_ms, offset_ms, last_boundary);
        let delay = Duration::from_millis(next_ms.saturating_sub(now_ms).max(0) as u64);
        if stop.wait_until(Instant::now() + delay) {
            return;
        }

        last_boundary = Some(next_ms);
        if let Some(boundary) = DateTime::from_timestamp_millis(next_ms) {
            tick(boundary);
        }
    }
}

fn next_boundary(now_ms: i64, period_ms: i64, offset_ms: i64, last: Option<i64>) -> i64 {
    let next = (now_ms - offset_ms).div_euclid(period_ms) * period_ms + period_ms + offset_ms;
    match last {
        // Woke a hair before the boundary that just fired.
        Some(last) if next <= last && last - now_ms <= period_ms => last + period_ms,
        // Otherwise the clock stepped back; follow it rather than wait out the gap.
        _ => next,
    }
}

fn enqueue(queue: &mpsc::Sender<ActivitySample>, sample: ActivitySample) {
    if queue.send(sample).is_err() {
        warn!(
            "persister gone; dropping {} active seconds for {}",
            sample.active_seconds, sample.start
        );
    }
}

fn persist(store: &dyn ActivityStore, context: &RecordContext, sample: ActivitySample) {
    let record = context.record(sample);
    match store.record_activity(&record) {
        Ok(()) => debug!(
            "recorded {} active seconds for {}",
            record.active_seconds, record.minute
        ),
        Err(err) => error!(
            "failed to record {} active seconds for {}: {err:#}",
            record.active_seconds, record.minute
        ),
    }
}

fn join_with_grace(name: &str, handle: JoinHandle<()>, deadline: Instant) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!("{name} thread did not stop in time; abandoning it");
            return;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    if handle.join().is_err() {
        error!("{name} thread panicked");
    }
}
