//! Telemetry Pipeline
//!
//! Pulls raw frames off the transport's stream, parses them and hands each
//! accepted sample to the single registered handler. Frames are processed
//! one at a time in arrival order on the session's executor, so the handler
//! is never re-entered.

use crate::domain::models::{hex_dump, SensorSample};
use crate::domain::window::TelemetryWindow;
use crate::infrastructure::bluetooth::{FrameParser, FrameReceiver};
use crate::infrastructure::runtime::AsyncBridge;
use crate::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Receives parsed samples.
///
/// Called on an executor thread, not on the thread that registered it.
/// Implementations hand the sample off (channel, lock) and return quickly;
/// a slow handler delays every later sample.
pub trait SampleHandler: Send + Sync {
    fn on_sample(&self, sample: &SensorSample);
}

impl<F> SampleHandler for F
where
    F: Fn(&SensorSample) + Send + Sync,
{
    fn on_sample(&self, sample: &SensorSample) {
        self(sample)
    }
}

impl SampleHandler for crossbeam_channel::Sender<SensorSample> {
    fn on_sample(&self, sample: &SensorSample) {
        let _ = self.send(*sample);
    }
}

impl SampleHandler for tokio::sync::mpsc::UnboundedSender<SensorSample> {
    fn on_sample(&self, sample: &SensorSample) {
        let _ = self.send(*sample);
    }
}

/// Pushes samples into a shared window, timestamped relative to when the
/// feeder was created.
pub struct WindowFeeder {
    window: Arc<Mutex<TelemetryWindow>>,
    started: Instant,
}

impl WindowFeeder {
    pub fn new(window: Arc<Mutex<TelemetryWindow>>) -> Self {
        Self {
            window,
            started: Instant::now(),
        }
    }

    pub fn window(&self) -> Arc<Mutex<TelemetryWindow>> {
        self.window.clone()
    }
}

impl SampleHandler for WindowFeeder {
    fn on_sample(&self, sample: &SensorSample) {
        let timestamp = self.started.elapsed().as_secs_f64();
        if let Ok(mut window) = self.window.lock() {
            window.push(*sample, timestamp);
        }
    }
}

/// Counters for the current subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub samples_delivered: u64,
    /// Frames the parser rejected
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    samples_delivered: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.frames_received.store(0, Ordering::Relaxed);
        self.samples_delivered.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            samples_delivered: self.samples_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn SampleHandler>>>>;

/// A running pump and its stop flag
struct PumpTask {
    task: JoinHandle<()>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct TelemetryPipeline {
    handler: HandlerSlot,
    counters: Arc<Counters>,
    /// Held by a pump for the whole of one frame's delivery
    delivery: Arc<Mutex<()>>,
    pump: Mutex<Option<PumpTask>>,
}

impl TelemetryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler`, replacing any previous one
    pub fn register(&self, handler: Arc<dyn SampleHandler>) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.replace(handler).is_some() {
            debug!("Telemetry handler replaced");
        }
    }

    pub fn unregister(&self) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Whether a frame stream is currently being consumed
    pub fn is_running(&self) -> bool {
        self.pump
            .lock()
            .map(|pump| pump.as_ref().map_or(false, |pump| !pump.task.is_finished()))
            .unwrap_or(false)
    }

    /// Consume `frames` on the bridge's executor until the stream closes
    /// or `stop` is called.
    pub fn start(
        &self,
        bridge: &AsyncBridge,
        frames: FrameReceiver,
        parser: Arc<dyn FrameParser>,
    ) -> Result<()> {
        self.stop();
        self.counters.reset();

        let cancelled = Arc::new(AtomicBool::new(false));
        let task = bridge.spawn(pump(
            frames,
            parser,
            self.handler.clone(),
            self.counters.clone(),
            self.delivery.clone(),
            cancelled.clone(),
        ))?;
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(PumpTask { task, cancelled });
        }
        Ok(())
    }

    /// Stop the pump. On return the handler is not running and will not be
    /// called again by this pump.
    ///
    /// From inside a handler (an executor thread) the wait is skipped; the
    /// pump exits once that handler returns.
    pub fn stop(&self) {
        let pump = self.pump.lock().ok().and_then(|mut pump| pump.take());
        let Some(pump) = pump else {
            return;
        };

        pump.cancelled.store(true, Ordering::Release);
        pump.task.abort();

        if Handle::try_current().is_ok() {
            debug!("Telemetry pump stop requested from the executor");
            return;
        }
        // Wait out a delivery already in progress
        drop(
            self.delivery
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        debug!("Telemetry pump stopped");
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(
    mut frames: FrameReceiver,
    parser: Arc<dyn FrameParser>,
    handler: HandlerSlot,
    counters: Arc<Counters>,
    delivery: Arc<Mutex<()>>,
    cancelled: Arc<AtomicBool>,
) {
    info!("Telemetry stream started");
    while let Some(frame) = frames.recv().await {
        let _delivering = delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cancelled.load(Ordering::Acquire) {
            return;
        }
        process_frame(&frame, parser.as_ref(), &handler, &counters);
    }
    warn!("Telemetry stream ended by transport");
}

fn process_frame(
    frame: &[u8],
    parser: &dyn FrameParser,
    handler: &HandlerSlot,
    counters: &Counters,
) {
    counters.frames_received.fetch_add(1, Ordering::Relaxed);
    trace!("Received {} bytes: {}", frame.len(), hex_dump(frame));

    let sample = match parser.parse(frame) {
        Ok(sample) => sample,
        Err(e) => {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping frame ({}): {}", e, hex_dump(frame));
            return;
        }
    };

    // Clone out so the lock is not held while consumer code runs
    let current = handler.read().ok().and_then(|slot| slot.clone());
    if let Some(current) = current {
        current.on_sample(&sample);
        counters.samples_delivered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::tests::frame;
    use crate::infrastructure::bluetooth::Wt9011Parser;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Handler that takes `delay` per sample and records overlapping calls
    pub(crate) struct SlowHandler {
        delay: Duration,
        pub(crate) active: AtomicUsize,
        pub(crate) max_active: AtomicUsize,
        pub(crate) calls: AtomicUsize,
    }

    impl SlowHandler {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                delay,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SampleHandler for SlowHandler {
        fn on_sample(&self, _sample: &SensorSample) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn slot_with(handler: Arc<dyn SampleHandler>) -> HandlerSlot {
        Arc::new(RwLock::new(Some(handler)))
    }

    #[test]
    fn test_malformed_frame_not_delivered() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let slot = slot_with(Arc::new(tx));
        let counters = Counters::default();

        process_frame(&[0x55, 0x61, 0x00], &Wt9011Parser, &slot, &counters);
        process_frame(&[0xAA; 20], &Wt9011Parser, &slot, &counters);

        assert!(rx.try_recv().is_err());
        assert_eq!(
            counters.snapshot(),
            PipelineStats {
                frames_received: 2,
                samples_delivered: 0,
                frames_dropped: 2,
            }
        );
    }

    #[test]
    fn test_closure_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let slot = slot_with(Arc::new(move |sample: &SensorSample| {
            sink.lock().unwrap().push(sample.accel.x);
        }));
        let counters = Counters::default();

        process_frame(&frame([2048, 0, 0], [0; 3], [0; 3]), &Wt9011Parser, &slot, &counters);
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    }

    #[test]
    fn test_pump_preserves_order_and_survives_bad_frames() {
        let bridge = AsyncBridge::new();
        let pipeline = TelemetryPipeline::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        pipeline.register(Arc::new(tx));

        let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline.start(&bridge, frame_rx, Arc::new(Wt9011Parser)).unwrap();

        frame_tx.send(frame([2048, 0, 0], [0; 3], [0; 3])).unwrap();
        frame_tx.send(vec![0x01, 0x02]).unwrap();
        frame_tx.send(frame([4096, 0, 0], [0; 3], [0; 3])).unwrap();
        frame_tx.send(frame([6144, 0, 0], [0; 3], [0; 3])).unwrap();

        let xs: Vec<f32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().accel.x)
            .collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
        assert!(pipeline.is_running());

        let stats = pipeline.stats();
        assert_eq!(stats.frames_received, 4);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.samples_delivered, 3);

        // Closing the stream ends the pump
        drop(frame_tx);
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_last_registration_wins() {
        let pipeline = TelemetryPipeline::new();
        let (first_tx, first_rx) = crossbeam_channel::unbounded();
        let (second_tx, second_rx) = crossbeam_channel::unbounded();
        pipeline.register(Arc::new(first_tx));
        pipeline.register(Arc::new(second_tx));

        process_frame(
            &frame([0; 3], [0; 3], [0; 3]),
            &Wt9011Parser,
            &pipeline.handler,
            &pipeline.counters,
        );
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_ok());

        pipeline.unregister();
        assert!(!pipeline.has_handler());
    }

    #[test]
    fn test_window_feeder_pushes_in_order() {
        let window = Arc::new(Mutex::new(TelemetryWindow::default()));
        let feeder = WindowFeeder::new(window.clone());
        for _ in 0..3 {
            feeder.on_sample(&SensorSample::default());
        }

        let entries = window.lock().unwrap().snapshot();
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_stop_waits_for_running_handler() {
        let bridge = AsyncBridge::new();
        let pipeline = TelemetryPipeline::new();
        let handler = Arc::new(SlowHandler::new(Duration::from_millis(300)));
        pipeline.register(handler.clone());

        let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline.start(&bridge, frame_rx, Arc::new(Wt9011Parser)).unwrap();
        frame_tx.send(frame([0; 3], [0; 3], [0; 3])).unwrap();
        frame_tx.send(frame([0; 3], [0; 3], [0; 3])).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            handler.active.load(Ordering::SeqCst) == 1
        }));

        pipeline.stop();
        assert_eq!(handler.active.load(Ordering::SeqCst), 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        // The queued frame of the stopped stream is never delivered
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let (frame_tx, frame_rx) = tokio::sync::mpsc::unbounded_channel();
        pipeline.start(&bridge, frame_rx, Arc::new(Wt9011Parser)).unwrap();
        frame_tx.send(frame([0; 3], [0; 3], [0; 3])).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            handler.calls.load(Ordering::SeqCst) == 2
        }));
        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    }
}
