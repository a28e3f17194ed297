//! Capture and render worker threads.
//!
//! Each worker owns one OS thread and the collaborator it drives. The
//! collaborator moves into the thread on [`start`](CaptureWorker::start)
//! and comes back out when the thread is joined, so a device is never
//! released while a thread might still touch it.
//!
//! Workers never escalate on their own. Transient conditions only bump
//! counters; anything the orchestrator must act on travels as a
//! [`WorkerEvent`] over an mpsc channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::packet::SequenceCounter;
use crate::pipeline::capture::FrameSource;
use crate::pipeline::render::RenderSink;
use crate::pipeline::types::{RenderFrame, SequencedFrame};
use crate::queue::BoundedFrameQueue;

pub const DEFAULT_TARGET_FPS: u32 = 60;
pub const DEFAULT_RENDER_POLL: Duration = Duration::from_millis(1);

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug)]
pub enum WorkerEvent {
    /// A lost device came back after one re-initialisation.
    Recovered { worker: &'static str },
    /// The worker stopped itself and will not restart.
    Fatal {
        worker: &'static str,
        error: StreamError,
    },
    /// The render sink reported that its window was closed.
    SinkClosed,
}

// ── Counters ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkerStats {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    /// Frames the source reported as identical to the previous one.
    pub frames_unchanged: u64,
    /// Smoothed time spent per frame in this stage.
    pub avg_stage_ms: f64,
}

/// Counters written by the worker thread and read by anyone.
#[derive(Debug, Default)]
struct WorkerCounters {
    processed: AtomicU64,
    dropped: AtomicU64,
    unchanged: AtomicU64,
    avg_stage_ms_bits: AtomicU64,
}

impl WorkerCounters {
    /// `avg = avg * 0.9 + sample * 0.1`. Only the worker thread writes.
    fn record_stage(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let avg = f64::from_bits(self.avg_stage_ms_bits.load(Ordering::Relaxed));
        let next = if avg == 0.0 { sample } else { avg * 0.9 + sample * 0.1 };
        self.avg_stage_ms_bits.store(next.to_bits(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            frames_processed: self.processed.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_unchanged: self.unchanged.load(Ordering::Relaxed),
            avg_stage_ms: f64::from_bits(self.avg_stage_ms_bits.load(Ordering::Relaxed)),
        }
    }
}

// ── WorkerHandle ─────────────────────────────────────────────────

/// A named thread plus its stop flag. Dropping the handle stops and
/// joins the thread.
pub struct WorkerHandle<T> {
    name: String,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn `body`, which must return once the flag it is given is set.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self, StreamError>
    where
        F: FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(flag))
            .map_err(|e| StreamError::init("worker thread", e))?;
        debug!(worker = %name, "thread started");
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }
}

impl<T> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` until the thread body has returned.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal, join and return what the thread handed back. `None` when
    /// already stopped or when the thread panicked.
    pub fn stop(&mut self) -> Option<T> {
        self.stop.store(true, Ordering::SeqCst);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(output) => {
                debug!(worker = %self.name, "thread joined");
                Some(output)
            }
            Err(_) => {
                error!(worker = %self.name, "thread panicked");
                None
            }
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── CaptureWorker ────────────────────────────────────────────────

type CaptureOutput = (Box<dyn FrameSource>, SequenceCounter);

/// Pulls one frame per tick from a [`FrameSource`] into a queue.
pub struct CaptureWorker {
    source: Option<Box<dyn FrameSource>>,
    sequence: SequenceCounter,
    queue: Arc<BoundedFrameQueue<SequencedFrame>>,
    events: Sender<WorkerEvent>,
    interval: Duration,
    counters: Arc<WorkerCounters>,
    handle: Option<WorkerHandle<CaptureOutput>>,
}

impl CaptureWorker {
    pub fn new(
        source: Box<dyn FrameSource>,
        queue: Arc<BoundedFrameQueue<SequencedFrame>>,
        events: Sender<WorkerEvent>,
        target_fps: u32,
    ) -> Self {
        Self {
            source: Some(source),
            sequence: SequenceCounter::new(),
            queue,
            events,
            interval: Duration::from_secs_f64(1.0 / target_fps.max(1) as f64),
            counters: Arc::new(WorkerCounters::default()),
            handle: None,
        }
    }

    /// Spawn the thread. `false` if it is already running.
    pub fn start(&mut self) -> bool {
        if self.handle.is_some() {
            return false;
        }
        let Some(mut source) = self.source.take() else {
            return false;
        };
        let mut sequence = self.sequence.clone();
        let queue = Arc::clone(&self.queue);
        let events = self.events.clone();
        let counters = Arc::clone(&self.counters);
        let interval = self.interval;

        let spawned = WorkerHandle::spawn("capture", move |stop| {
            capture_loop(
                source.as_mut(),
                &mut sequence,
                &queue,
                &events,
                &counters,
                interval,
                &stop,
            );
            (source, sequence)
        });
        match spawned {
            Ok(handle) => {
                info!(interval_ms = interval.as_secs_f64() * 1000.0, "capture worker started");
                self.handle = Some(handle);
                true
            }
            Err(e) => {
                error!(error = %e, "capture worker failed to start");
                false
            }
        }
    }

    /// Stop and join. The source is back in the worker afterwards.
    pub fn stop(&mut self) {
        if let Some((source, sequence)) = self.handle.as_mut().and_then(WorkerHandle::stop) {
            self.source = Some(source);
            self.sequence = sequence;
        }
        self.handle = None;
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(WorkerHandle::is_running)
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Hand the source back to the caller. Only possible while stopped.
    pub fn take_source(&mut self) -> Option<Box<dyn FrameSource>> {
        if self.handle.is_some() {
            return None;
        }
        self.source.take()
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    source: &mut dyn FrameSource,
    sequence: &mut SequenceCounter,
    queue: &BoundedFrameQueue<SequencedFrame>,
    events: &Sender<WorkerEvent>,
    counters: &WorkerCounters,
    interval: Duration,
    stop: &AtomicBool,
) {
    let mut next_tick = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        match source.acquire(interval) {
            Ok(frame) if !frame.changed => {
                counters.unchanged.fetch_add(1, Ordering::Relaxed);
            }
            Ok(frame) => {
                let item = SequencedFrame {
                    sequence: sequence.next(),
                    frame,
                };
                if queue.push(item) {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
                counters.record_stage(started.elapsed());
            }
            Err(e) if e.is_transient() => {}
            Err(StreamError::ResourceLost(reason)) => {
                warn!(%reason, "capture device lost, re-initialising");
                match source.reinitialize() {
                    Ok(()) => {
                        let _ = events.send(WorkerEvent::Recovered { worker: "capture" });
                    }
                    Err(e) => {
                        let _ = events.send(WorkerEvent::Fatal {
                            worker: "capture",
                            error: StreamError::init("frame source", format!("{reason}: {e}")),
                        });
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = events.send(WorkerEvent::Fatal {
                    worker: "capture",
                    error: e,
                });
                return;
            }
        }

        // Fixed cadence; a late tick resets the schedule instead of bursting.
        next_tick += interval;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }
}

// ── RenderWorker ─────────────────────────────────────────────────

/// Presents frames from a queue on a [`RenderSink`].
pub struct RenderWorker {
    sink: Option<Box<dyn RenderSink>>,
    queue: Arc<BoundedFrameQueue<RenderFrame>>,
    events: Sender<WorkerEvent>,
    poll_timeout: Duration,
    counters: Arc<WorkerCounters>,
    handle: Option<WorkerHandle<Box<dyn RenderSink>>>,
}

impl RenderWorker {
    pub fn new(
        sink: Box<dyn RenderSink>,
        queue: Arc<BoundedFrameQueue<RenderFrame>>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            sink: Some(sink),
            queue,
            events,
            poll_timeout: DEFAULT_RENDER_POLL,
            counters: Arc::new(WorkerCounters::default()),
            handle: None,
        }
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn start(&mut self) -> bool {
        if self.handle.is_some() {
            return false;
        }
        let Some(mut sink) = self.sink.take() else {
            return false;
        };
        let queue = Arc::clone(&self.queue);
        let events = self.events.clone();
        let counters = Arc::clone(&self.counters);
        let poll_timeout = self.poll_timeout;

        let spawned = WorkerHandle::spawn("render", move |stop| {
            render_loop(sink.as_mut(), &queue, &events, &counters, poll_timeout, &stop);
            sink
        });
        match spawned {
            Ok(handle) => {
                info!("render worker started");
                self.handle = Some(handle);
                true
            }
            Err(e) => {
                error!(error = %e, "render worker failed to start");
                false
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(sink) = self.handle.as_mut().and_then(WorkerHandle::stop) {
            self.sink = Some(sink);
        }
        self.handle = None;
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(WorkerHandle::is_running)
    }

    /// `frames_dropped` counts pops that timed out with nothing to show.
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn take_sink(&mut self) -> Option<Box<dyn RenderSink>> {
        if self.handle.is_some() {
            return None;
        }
        self.sink.take()
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(
    sink: &mut dyn RenderSink,
    queue: &BoundedFrameQueue<RenderFrame>,
    events: &Sender<WorkerEvent>,
    counters: &WorkerCounters,
    poll_timeout: Duration,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Relaxed) {
        if !sink.poll_events() {
            info!("render sink closed");
            let _ = events.send(WorkerEvent::SinkClosed);
            return;
        }

        let Some(frame) = queue.pop(poll_timeout) else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };

        let started = Instant::now();
        match sink.present(&frame.pixels, frame.width, frame.height, frame.stride) {
            Ok(()) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                counters.record_stage(started.elapsed());
            }
            Err(StreamError::ResourceLost(reason)) => {
                warn!(%reason, "render device lost, re-initialising");
                if let Err(e) = sink.reinitialize() {
                    let _ = events.send(WorkerEvent::Fatal {
                        worker: "render",
                        error: StreamError::init("render sink", format!("{reason}: {e}")),
                    });
                    return;
                }
                let _ = events.send(WorkerEvent::Recovered { worker: "render" });
            }
            Err(e) => {
                debug!(sequence = frame.sequence, error = %e, "frame not presented");
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::capture::TestPatternSource;
    use crate::pipeline::render::HeadlessSink;
    use std::sync::mpsc;

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn handle_returns_thread_output() {
        let mut handle = WorkerHandle::spawn("t", |stop| {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
            42
        })
        .unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.stop(), Some(42));
        assert_eq!(handle.stop(), None);
        assert!(!handle.is_running());
    }

    #[test]
    fn capture_fills_queue_and_counts_drops() {
        let queue = Arc::new(BoundedFrameQueue::new(2));
        let (tx, _rx) = mpsc::channel();
        let source = TestPatternSource::new(32, 8).unwrap();
        let mut worker = CaptureWorker::new(Box::new(source), Arc::clone(&queue), tx, 500);

        assert!(worker.start());
        assert!(!worker.start());
        assert!(wait_until(Duration::from_secs(5), || worker.stats().frames_dropped > 0));
        worker.stop();

        let stats = worker.stats();
        assert_eq!(stats.frames_processed, 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(Duration::ZERO).map(|f| f.sequence), Some(0));
        assert_eq!(queue.pop(Duration::ZERO).map(|f| f.sequence), Some(1));
        assert!(worker.take_source().is_some());
    }

    #[test]
    fn capture_skips_unchanged_frames() {
        let queue = Arc::new(BoundedFrameQueue::new(100));
        let (tx, _rx) = mpsc::channel();
        let source = TestPatternSource::new(32, 8).unwrap().with_motion_interval(4);
        let mut worker = CaptureWorker::new(Box::new(source), Arc::clone(&queue), tx, 500);
        worker.start();
        assert!(wait_until(Duration::from_secs(5), || worker.stats().frames_unchanged >= 3));
        worker.stop();
        let stats = worker.stats();
        assert!(stats.frames_processed >= 1);
        assert_eq!(queue.len() as u64, stats.frames_processed);
    }

    #[test]
    fn capture_recovers_once_from_device_loss() {
        let queue = Arc::new(BoundedFrameQueue::new(100));
        let (tx, rx) = mpsc::channel();
        let source = TestPatternSource::new(32, 8).unwrap().with_device_loss_at(2);
        let mut worker = CaptureWorker::new(Box::new(source), Arc::clone(&queue), tx, 500);
        worker.start();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, WorkerEvent::Recovered { worker: "capture" }));
        assert!(wait_until(Duration::from_secs(5), || worker.stats().frames_processed > 3));
        worker.stop();
    }

    #[test]
    fn capture_reports_failed_recovery() {
        let queue = Arc::new(BoundedFrameQueue::new(100));
        let (tx, rx) = mpsc::channel();
        let source = TestPatternSource::new(32, 8)
            .unwrap()
            .with_device_loss_at(0)
            .with_failing_reinitialize();
        let mut worker = CaptureWorker::new(Box::new(source), Arc::clone(&queue), tx, 500);
        worker.start();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            event,
            WorkerEvent::Fatal {
                error: StreamError::InitializationFailure { .. },
                ..
            }
        ));
        assert!(wait_until(Duration::from_secs(5), || !worker.is_running()));
        worker.stop();
    }

    #[test]
    fn render_presents_and_counts_idle_polls() {
        let queue = Arc::new(BoundedFrameQueue::new(4));
        let (tx, _rx) = mpsc::channel();
        let sink = HeadlessSink::new();
        let counters = sink.counters();
        let mut worker = RenderWorker::new(Box::new(sink), Arc::clone(&queue), tx);
        assert!(worker.start());

        queue.push(RenderFrame {
            sequence: 0,
            width: 2,
            height: 2,
            stride: 8,
            pixels: vec![0u8; 16].into(),
        });
        assert!(wait_until(Duration::from_secs(5), || counters.frames_presented() == 1));
        assert!(wait_until(Duration::from_secs(5), || worker.stats().frames_dropped > 0));
        worker.stop();
        assert_eq!(worker.stats().frames_processed, 1);
        assert!(worker.take_sink().is_some());
    }

    #[test]
    fn render_reports_closed_sink() {
        let queue = Arc::new(BoundedFrameQueue::new(4));
        let (tx, rx) = mpsc::channel();
        let sink = HeadlessSink::new().close_after(1);
        let mut worker = RenderWorker::new(Box::new(sink), Arc::clone(&queue), tx);
        worker.start();
        queue.push(RenderFrame {
            sequence: 9,
            width: 2,
            height: 2,
            stride: 8,
            pixels: vec![0u8; 16].into(),
        });
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, WorkerEvent::SinkClosed));
        worker.stop();
    }

    #[test]
    fn stop_twice_is_harmless() {
        let queue = Arc::new(BoundedFrameQueue::new(4));
        let (tx, _rx) = mpsc::channel();
        let mut worker = RenderWorker::new(Box::new(HeadlessSink::new()), queue, tx);
        worker.start();
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
    }
}
