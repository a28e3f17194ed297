//! The session state machine and its three mode loops.
//!
//! Everything here runs on the thread that calls [`SessionOrchestrator::run`].
//! Capture and render may run on worker threads; transport I/O, decoding,
//! encoding and bitrate adaptation never leave the session thread.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::flags::FrameFlags;
use crate::header::{now_millis, FrameHeader};
use crate::network::{SendOutcome, Transport, UdpTransport};
use crate::packet::{Frame, ReceiverReport, SequenceCounter, SequenceEvent, SequenceTracker};
use crate::pipeline::{
    AdaptiveBitrateController, CaptureWorker, Codec, EncodedPayload, FrameSource, InputEvent,
    InputInjector, RenderFrame, RenderSink, RenderWorker, SequencedFrame, WorkerEvent,
};
use crate::queue::BoundedFrameQueue;
use crate::session::config::{CodecKind, SessionConfig};
use crate::session::factory::CollaboratorFactory;
use crate::session::stats::{Ewma, SessionStats, StageTimings};
use crate::session::{InputHandle, SessionState, StopHandle};
use crate::signaling::{
    answer_offer, detect_local_ipv4, guest_handshake, PeerRole, SessionId, SignalMessage,
    Signaling,
};

/// Receive polls per server iteration before capture gets its turn.
const MAX_FEEDBACK_PER_TICK: usize = 64;

// ── Counters ─────────────────────────────────────────────────────

/// Session-thread bookkeeping. Worker-side numbers live in the workers.
#[derive(Debug, Default)]
struct Counters {
    frames_processed: u64,
    frames_dropped: u64,
    oversized: u64,
    recoveries: u64,
    input_events: u64,
    raw_bytes: u64,
    wire_bytes: u64,
    capture: Ewma,
    encode: Ewma,
    network: Ewma,
    render: Ewma,
    frame_time: Ewma,
    last_frame_at: Option<Instant>,
}

impl Counters {
    fn record_frame(&mut self) {
        self.frames_processed += 1;
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            self.frame_time.update_duration(now - last);
        }
        self.last_frame_at = Some(now);
    }
}

/// Keep an `InitializationFailure` as is, wrap anything else.
fn required(component: &'static str, error: StreamError) -> StreamError {
    match error {
        e @ StreamError::InitializationFailure { .. } => e,
        other => StreamError::init(component, other),
    }
}

// ── SessionOrchestrator ──────────────────────────────────────────

/// Owns one streaming session from initialization to teardown.
///
/// ```no_run
/// use deskstream_core::session::{SessionConfig, SessionOrchestrator, SyntheticCollaborators};
///
/// let mut session =
///     SessionOrchestrator::new(SessionConfig::default(), Box::new(SyntheticCollaborators::new()));
/// session.initialize_loopback(1280, 720)?;
/// let stop = session.stop_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(1));
///     stop.stop();
/// });
/// session.run()?;
/// # Ok::<(), deskstream_core::StreamError>(())
/// ```
pub struct SessionOrchestrator {
    config: SessionConfig,
    factory: Box<dyn CollaboratorFactory>,
    state: SessionState,
    stop: StopHandle,

    transport: Option<Box<dyn Transport>>,
    signaling: Option<Box<dyn Signaling>>,
    session_id: Option<SessionId>,
    /// Endpoint a host answers offers with.
    advertised: Option<SocketAddr>,
    codec: Option<Box<dyn Codec>>,
    decoder_unavailable: bool,
    abr: Option<AdaptiveBitrateController>,
    injector: Option<Box<dyn InputInjector>>,
    input_enabled: bool,
    input_tx: Sender<InputEvent>,
    input_rx: Receiver<InputEvent>,

    // Inline collaborators, used when the matching worker is absent.
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn RenderSink>>,
    capture: Option<CaptureWorker>,
    render: Option<RenderWorker>,
    capture_queue: Arc<BoundedFrameQueue<SequencedFrame>>,
    render_queue: Arc<BoundedFrameQueue<RenderFrame>>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,

    sequence: SequenceCounter,
    feedback_sequence: SequenceCounter,
    tracker: SequenceTracker,
    /// Header timestamp of the newest frame and when it arrived.
    newest_remote: Option<(u64, Instant)>,
    next_tick: Instant,
    last_stats_log: Instant,
    counters: Counters,
}

impl SessionOrchestrator {
    pub fn new(config: SessionConfig, factory: Box<dyn CollaboratorFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let (input_tx, input_rx) = mpsc::channel();
        let capacity = config.queue_capacity;
        Self {
            config,
            factory,
            state: SessionState::Uninitialized,
            stop: StopHandle::default(),
            transport: None,
            signaling: None,
            session_id: None,
            advertised: None,
            codec: None,
            decoder_unavailable: false,
            abr: None,
            injector: None,
            input_enabled: false,
            input_tx,
            input_rx,
            source: None,
            sink: None,
            capture: None,
            render: None,
            capture_queue: Arc::new(BoundedFrameQueue::new(capacity)),
            render_queue: Arc::new(BoundedFrameQueue::new(capacity)),
            events_tx,
            events_rx,
            sequence: SequenceCounter::new(),
            feedback_sequence: SequenceCounter::new(),
            tracker: SequenceTracker::new(),
            newest_remote: None,
            next_tick: Instant::now(),
            last_stats_log: Instant::now(),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// A handle that makes `run` return at its next iteration.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// A handle that queues input events for a client to forward to its
    /// server. Events queued in any other mode are discarded.
    pub fn input_handle(&self) -> InputHandle {
        InputHandle::new(self.input_tx.clone())
    }

    /// Bound socket address in server and client modes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(|t| t.local_addr().ok())
    }

    /// The id a host handed out, if this session is hosting.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    // ── Initialization ───────────────────────────────────────────

    /// Capture and present locally, no network.
    pub fn initialize_loopback(&mut self, width: u32, height: u32) -> Result<(), StreamError> {
        self.begin_initialize("initialize loopback")?;
        let setup = self
            .install_source(width, height)
            .map_err(|e| required("frame source", e))
            .and_then(|()| {
                self.install_sink(width, height)
                    .map_err(|e| required("render sink", e))
            });
        self.finish_initialize(setup, SessionState::Loopback)
    }

    /// Listen on `port` and stream to whichever client reports in.
    pub fn initialize_as_server(&mut self, port: u16, bitrate_mbps: u32) -> Result<(), StreamError> {
        self.begin_initialize("initialize server")?;
        let setup = self.setup_server(port, bitrate_mbps);
        self.finish_initialize(setup, SessionState::Server)
    }

    /// Receive from the server at `address:port`.
    pub fn initialize_as_client(&mut self, address: &str, port: u16) -> Result<(), StreamError> {
        self.begin_initialize("initialize client")?;
        let setup = UdpTransport::connect(address, port, self.config.transport)
            .and_then(|transport| self.setup_client(transport));
        self.finish_initialize(setup, SessionState::Client)
    }

    /// Server mode plus a registration with `signaling`. Returns the id a
    /// guest needs to join.
    pub fn initialize_as_host(
        &mut self,
        port: u16,
        bitrate_mbps: u32,
        signaling: Box<dyn Signaling>,
    ) -> Result<SessionId, StreamError> {
        self.begin_initialize("initialize host")?;
        let setup = self.setup_host(port, bitrate_mbps, signaling);
        self.finish_initialize(setup, SessionState::Server)
    }

    /// Client mode, with the server address learned through `signaling`.
    pub fn initialize_as_guest(
        &mut self,
        session_id: &str,
        signaling: Box<dyn Signaling>,
    ) -> Result<(), StreamError> {
        self.begin_initialize("initialize guest")?;
        let setup = self.setup_guest(session_id, signaling);
        self.finish_initialize(setup, SessionState::Client)
    }

    fn begin_initialize(&self, action: &'static str) -> Result<(), StreamError> {
        if self.state != SessionState::Uninitialized {
            return Err(StreamError::InvalidState {
                state: self.state.name(),
                action,
            });
        }
        self.config.validate()
    }

    fn finish_initialize<T>(
        &mut self,
        setup: Result<T, StreamError>,
        state: SessionState,
    ) -> Result<T, StreamError> {
        match setup {
            Ok(value) => {
                info!(from = %self.state, to = %state, "session initialized");
                self.state = state;
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, mode = %state, "initialization failed");
                self.teardown();
                self.discard_attempt();
                Err(e)
            }
        }
    }

    fn setup_server(&mut self, port: u16, bitrate_mbps: u32) -> Result<(), StreamError> {
        let transport = UdpTransport::bind(port, self.config.transport)?;
        self.transport = Some(Box::new(transport));

        let mut abr = AdaptiveBitrateController::with_initial(
            bitrate_mbps,
            self.config.min_bitrate_mbps,
            self.config.max_bitrate_mbps,
        )?;
        abr.set_adaptation_mode(self.config.adaptation_mode);
        let bitrate = abr.current_bitrate();
        self.abr = Some(abr);

        match self.factory.codec(self.config.codec, bitrate) {
            Ok(codec) => {
                info!(codec = codec.name(), bitrate_mbps = bitrate, "encoder ready");
                self.codec = Some(codec);
            }
            Err(e) => warn!(error = %e, "codec unavailable, sending raw frames"),
        }

        let (width, height) = (self.config.capture_width, self.config.capture_height);
        if let Err(e) = self.install_source(width, height) {
            warn!(error = %e, "frame source unavailable, nothing will be streamed");
        }
        self.install_injector();
        Ok(())
    }

    fn setup_client(&mut self, transport: UdpTransport) -> Result<(), StreamError> {
        self.transport = Some(Box::new(transport));
        let (width, height) = (self.config.capture_width, self.config.capture_height);
        self.install_sink(width, height)
            .map_err(|e| required("render sink", e))?;
        // A client only forwards input; the server injects it.
        self.input_enabled = self.config.input_enabled;
        Ok(())
    }

    fn setup_host(
        &mut self,
        port: u16,
        bitrate_mbps: u32,
        mut signaling: Box<dyn Signaling>,
    ) -> Result<SessionId, StreamError> {
        self.setup_server(port, bitrate_mbps)?;
        let bound = self
            .local_addr()
            .ok_or_else(|| StreamError::init("transport", "no local address"))?;
        let advertised = SocketAddrV4::new(self.advertised_ip(), bound.port());
        let id = SessionId::new(advertised);

        signaling
            .send_signal(&SignalMessage::Register {
                peer_id: format!("host-{advertised}"),
                role: PeerRole::Host,
                session_id: id.to_string(),
            })
            .map_err(|e| StreamError::init("signaling", e))?;
        info!(session = %id, %advertised, "hosting session");

        self.signaling = Some(signaling);
        self.session_id = Some(id);
        self.advertised = Some(SocketAddr::V4(advertised));
        Ok(id)
    }

    fn setup_guest(
        &mut self,
        session_id: &str,
        mut signaling: Box<dyn Signaling>,
    ) -> Result<(), StreamError> {
        let mut transport = UdpTransport::open_client(self.config.transport)?;
        let port = transport.local_addr()?.port();
        let local = SocketAddr::V4(SocketAddrV4::new(self.advertised_ip(), port));

        let peers = guest_handshake(
            signaling.as_mut(),
            session_id,
            local,
            self.config.signaling_timeout,
        )
        .map_err(|e| StreamError::init("signaling", e))?;
        transport.connect_to(&peers.remote.ip().to_string(), peers.remote.port())?;

        self.signaling = Some(signaling);
        self.setup_client(transport)
    }

    fn advertised_ip(&self) -> Ipv4Addr {
        self.config
            .advertise_address
            .or_else(detect_local_ipv4)
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }

    /// Start a capture worker, or capture inline when threading is off or
    /// the thread does not start.
    fn install_source(&mut self, width: u32, height: u32) -> Result<(), StreamError> {
        if self.config.threaded {
            let source = self.factory.frame_source(width, height)?;
            let mut worker = CaptureWorker::new(
                source,
                Arc::clone(&self.capture_queue),
                self.events_tx.clone(),
                self.config.target_fps,
            );
            if worker.start() {
                self.capture = Some(worker);
                return Ok(());
            }
            warn!("capture worker did not start, capturing inline");
        }
        self.source = Some(self.factory.frame_source(width, height)?);
        Ok(())
    }

    fn install_sink(&mut self, width: u32, height: u32) -> Result<(), StreamError> {
        if self.config.threaded {
            let sink = self.factory.render_sink(width, height)?;
            let mut worker =
                RenderWorker::new(sink, Arc::clone(&self.render_queue), self.events_tx.clone());
            if worker.start() {
                self.render = Some(worker);
                return Ok(());
            }
            warn!("render worker did not start, presenting inline");
        }
        self.sink = Some(self.factory.render_sink(width, height)?);
        Ok(())
    }

    fn install_injector(&mut self) {
        if !self.config.input_enabled {
            return;
        }
        match self.factory.input_injector() {
            Ok(injector) => {
                self.injector = Some(injector);
                self.input_enabled = true;
            }
            Err(e) => warn!(error = %e, "input injection unavailable, continuing without it"),
        }
    }

    // ── Run ──────────────────────────────────────────────────────

    /// Run the mode loop until stopped, the sink closes, or a collaborator
    /// is lost for good. The session is torn down before this returns.
    pub fn run(&mut self) -> Result<(), StreamError> {
        let mode = self.state;
        if !mode.is_runnable() {
            return Err(StreamError::InvalidState {
                state: mode.name(),
                action: "run",
            });
        }
        info!(%mode, "session running");
        self.last_stats_log = Instant::now();
        self.next_tick = Instant::now();

        let result = match mode {
            SessionState::Loopback => self.run_loopback(),
            SessionState::Server => self.run_server(),
            _ => self.run_client(),
        };
        if let Err(e) = &result {
            error!(%mode, error = %e, "session failed");
        }
        self.stop();
        result
    }

    fn run_loopback(&mut self) -> Result<(), StreamError> {
        while self.keep_running()? {
            if let Some(frame) = self.next_captured()? {
                self.deliver(frame.into())?;
            }
        }
        Ok(())
    }

    fn run_server(&mut self) -> Result<(), StreamError> {
        let mut announced = false;
        while self.keep_running()? {
            self.poll_signaling();
            self.drain_feedback()?;

            let Some(captured) = self.next_captured()? else {
                continue;
            };
            if self.transport.as_ref().and_then(|t| t.peer()).is_none() {
                if !announced {
                    info!("waiting for a client to report in");
                    announced = true;
                }
                continue;
            }
            self.send_captured(captured)?;
        }
        Ok(())
    }

    fn run_client(&mut self) -> Result<(), StreamError> {
        self.send_report();
        let mut next_report = Instant::now() + self.config.feedback_interval;

        while self.keep_running()? {
            if Instant::now() >= next_report {
                self.send_report();
                next_report = Instant::now() + self.config.feedback_interval;
            }
            self.poll_signaling();
            self.forward_input();

            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            match transport.receive_frame(self.config.receive_timeout) {
                Ok(Some(frame)) if frame.is_feedback() || frame.is_input() => {
                    debug!(sequence = frame.sequence(), "ignoring control datagram from server");
                }
                Ok(Some(frame)) => self.accept_frame(frame)?,
                Ok(None) => {}
                Err(StreamError::MalformedPacket(reason)) => debug!(reason, "malformed datagram"),
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Check the stop flag, worker events, the inline sink and the stats
    /// timer. `Ok(false)` ends the loop cleanly.
    fn keep_running(&mut self) -> Result<bool, StreamError> {
        if self.stop.is_stopped() {
            info!("stop requested");
            return Ok(false);
        }
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                WorkerEvent::Recovered { worker } => {
                    info!(worker, "collaborator recovered");
                    self.counters.recoveries += 1;
                }
                WorkerEvent::Fatal { worker, error } => {
                    error!(worker, error = %error, "worker stopped");
                    return Err(error);
                }
                WorkerEvent::SinkClosed => {
                    info!("render sink closed");
                    return Ok(false);
                }
            }
        }
        if let Some(sink) = self.sink.as_mut() {
            if !sink.poll_events() {
                info!("render sink closed");
                return Ok(false);
            }
        }
        let interval = self.config.stats_interval;
        if !interval.is_zero() && self.last_stats_log.elapsed() >= interval {
            self.log_stats();
            self.last_stats_log = Instant::now();
        }
        Ok(true)
    }

    // ── Capture side ─────────────────────────────────────────────

    /// The next changed frame, from the capture queue or captured inline
    /// on this tick. Waits at most one frame interval.
    fn next_captured(&mut self) -> Result<Option<SequencedFrame>, StreamError> {
        let interval = self.config.frame_interval();
        if self.capture.is_some() {
            return Ok(self.capture_queue.pop(interval));
        }
        let Some(source) = self.source.as_mut() else {
            thread::sleep(interval);
            return Ok(None);
        };

        let now = Instant::now();
        if self.next_tick > now {
            thread::sleep(self.next_tick - now);
            self.next_tick += interval;
        } else {
            self.next_tick = now + interval;
        }

        let started = Instant::now();
        match source.acquire(interval) {
            Ok(frame) if !frame.changed => Ok(None),
            Ok(frame) => {
                self.counters.capture.update_duration(started.elapsed());
                Ok(Some(SequencedFrame {
                    sequence: self.sequence.next(),
                    frame,
                }))
            }
            Err(e) if e.is_transient() => Ok(None),
            Err(StreamError::ResourceLost(reason)) => {
                warn!(%reason, "capture device lost, re-initialising");
                source
                    .reinitialize()
                    .map_err(|e| StreamError::init("frame source", format!("{reason}: {e}")))?;
                self.counters.recoveries += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn send_captured(&mut self, captured: SequencedFrame) -> Result<(), StreamError> {
        let SequencedFrame { sequence, frame } = captured;

        let started = Instant::now();
        let payload = match self.codec.as_mut() {
            Some(codec) => match codec.encode(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(sequence, error = %e, "encode failed, frame dropped");
                    self.counters.frames_dropped += 1;
                    return Ok(());
                }
            },
            None => EncodedPayload {
                data: frame.pixels.clone(),
                keyframe: true,
                compressed: false,
            },
        };
        self.counters.encode.update_duration(started.elapsed());

        let packet = if payload.compressed {
            Frame::encoded(
                sequence,
                frame.width,
                frame.height,
                frame.stride,
                payload.data,
                payload.keyframe,
            )
        } else {
            Frame::raw(sequence, frame.width, frame.height, frame.stride, payload.data)
        };
        self.counters.raw_bytes += frame.byte_len() as u64;
        self.counters.wire_bytes += packet.payload().len() as u64;
        self.send_packet(&packet)
    }

    fn send_packet(&mut self, packet: &Frame) -> Result<(), StreamError> {
        let Some(transport) = self.transport.as_mut() else {
            return Ok(());
        };
        let started = Instant::now();
        match transport.send_frame(packet) {
            Ok(SendOutcome::Sent(_)) => {
                self.counters.network.update_duration(started.elapsed());
                self.counters.record_frame();
            }
            Ok(SendOutcome::WouldBlock) => self.counters.frames_dropped += 1,
            Err(StreamError::PacketTooLarge { size, max }) => {
                if self.counters.oversized == 0 {
                    warn!(size, max, "frame exceeds the datagram limit and is dropped");
                }
                self.counters.oversized += 1;
                self.counters.frames_dropped += 1;
            }
            Err(StreamError::InvalidState { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Apply every receiver report waiting on the socket.
    fn drain_feedback(&mut self) -> Result<(), StreamError> {
        for _ in 0..MAX_FEEDBACK_PER_TICK {
            let Some(transport) = self.transport.as_mut() else {
                return Ok(());
            };
            match transport.receive_frame(Duration::ZERO) {
                Ok(Some(frame)) if frame.is_feedback() => self.apply_report(&frame),
                Ok(Some(frame)) if frame.is_input() => self.apply_input(&frame),
                Ok(Some(frame)) => {
                    debug!(sequence = frame.sequence(), "ignoring frame sent to server");
                }
                Ok(None) => return Ok(()),
                Err(StreamError::MalformedPacket(reason)) => debug!(reason, "malformed datagram"),
                Err(e) if e.is_transient() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn apply_report(&mut self, frame: &Frame) {
        let report = match ReceiverReport::from_bytes(frame.payload()) {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "unreadable receiver report");
                return;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let latency_ms = if report.echo_timestamp != 0 {
            let rtt = now_millis().saturating_sub(report.echo_timestamp) as f64;
            transport.update_latency(rtt);
            rtt
        } else {
            transport.stats().latency_ms
        };
        let loss_percent = report.loss_percent();

        let Some(abr) = self.abr.as_mut() else {
            return;
        };
        let before = abr.current_bitrate();
        let bitrate = abr.update(latency_ms, loss_percent, report.buffer_ms as f64);
        if bitrate != before {
            info!(
                from = before,
                to = bitrate,
                latency_ms,
                loss_percent,
                buffer_ms = report.buffer_ms,
                "bitrate adapted"
            );
        }
        if let Some(codec) = self.codec.as_mut() {
            codec.set_target_bitrate(bitrate);
        }
    }

    /// Replay a client input event. Failures never stop the stream.
    fn apply_input(&mut self, frame: &Frame) {
        let event = match InputEvent::from_bytes(frame.payload()) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "unreadable input event");
                return;
            }
        };
        let Some(injector) = self.injector.as_mut() else {
            debug!(?event, "input disabled, event ignored");
            return;
        };
        match injector.inject(&event) {
            Ok(()) => self.counters.input_events += 1,
            Err(e) => warn!(error = %e, ?event, "input injection failed"),
        }
    }

    /// Answer offers (host) and pings. A failing channel is dropped; the
    /// stream itself does not depend on it.
    fn poll_signaling(&mut self) {
        let Some(signaling) = self.signaling.as_mut() else {
            return;
        };
        let mut failed = false;
        match signaling.recv_signal(Duration::ZERO) {
            Ok(Some(message)) => {
                let reply = match self.advertised {
                    Some(local) => {
                        let session = self.session_id.map(|id| id.to_string()).unwrap_or_default();
                        answer_offer(signaling.as_mut(), &session, local, &message).map(|_| ())
                    }
                    None if matches!(message, SignalMessage::Ping) => {
                        signaling.send_signal(&SignalMessage::Pong)
                    }
                    None => Ok(()),
                };
                if let Err(e) = reply {
                    warn!(error = %e, "signaling reply failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "signaling channel failed, continuing without it");
                failed = true;
            }
        }
        if failed {
            self.signaling = None;
        }
    }

    // ── Client side ──────────────────────────────────────────────

    fn accept_frame(&mut self, frame: Frame) -> Result<(), StreamError> {
        let (header, payload) = frame.into_parts();
        match self.tracker.observe(header.sequence) {
            SequenceEvent::InOrder => {}
            SequenceEvent::Gap(missing) => {
                debug!(sequence = header.sequence, missing, "sequence gap");
            }
            SequenceEvent::Late | SequenceEvent::Duplicate => {
                debug!(sequence = header.sequence, "stale frame discarded");
                self.counters.frames_dropped += 1;
                return Ok(());
            }
        }
        self.newest_remote = Some((header.timestamp, Instant::now()));
        self.counters
            .network
            .update(now_millis().saturating_sub(header.timestamp) as f64);

        let wire_len = payload.len() as u64;
        let pixels = if header.flags.contains(FrameFlags::ENCODED) {
            match self.decode(&header, &payload) {
                Some(pixels) => pixels,
                None => {
                    self.counters.frames_dropped += 1;
                    return Ok(());
                }
            }
        } else {
            payload
        };
        self.counters.raw_bytes += pixels.len() as u64;
        self.counters.wire_bytes += wire_len;

        self.deliver(RenderFrame {
            sequence: header.sequence,
            width: header.width,
            height: header.height,
            stride: header.stride,
            pixels,
        })
    }

    /// Decode an `ENCODED` payload, creating the decoder on first use.
    /// Only zstd produces encoded frames on this wire.
    fn decode(&mut self, header: &FrameHeader, payload: &[u8]) -> Option<Bytes> {
        if self.codec.is_none() && !self.decoder_unavailable {
            match self.factory.codec(CodecKind::Zstd, self.config.max_bitrate_mbps) {
                Ok(codec) => {
                    info!(codec = codec.name(), "decoder created");
                    self.codec = Some(codec);
                }
                Err(e) => {
                    warn!(error = %e, "no decoder, encoded frames will be dropped");
                    self.decoder_unavailable = true;
                }
            }
        }
        let codec = self.codec.as_mut()?;
        let started = Instant::now();
        match codec.decode(header, payload) {
            Ok(pixels) => {
                self.counters.encode.update_duration(started.elapsed());
                Some(Bytes::from(pixels))
            }
            Err(e) => {
                debug!(sequence = header.sequence, error = %e, "decode failed");
                None
            }
        }
    }

    /// Send a receiver report. Failures are logged; the next one may work.
    fn send_report(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let (frames_received, frames_lost) = self.tracker.take_window();
        let echo_timestamp = self
            .newest_remote
            .map(|(timestamp, at)| timestamp + at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let queued_ms = self.render_queue.len() as f64 * self.config.frame_interval().as_secs_f64() * 1000.0;
        let report = ReceiverReport {
            echo_timestamp,
            frames_received,
            frames_lost,
            highest_sequence: self.tracker.highest(),
            buffer_ms: queued_ms as u32,
        };
        let packet = Frame::feedback(self.feedback_sequence.next(), &report);
        if let Err(e) = transport.send_frame(&packet) {
            warn!(error = %e, "receiver report not sent");
        }
    }

    /// Send queued input events to the server.
    fn forward_input(&mut self) {
        while let Ok(event) = self.input_rx.try_recv() {
            if !self.input_enabled {
                continue;
            }
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            let packet = match Frame::input(self.feedback_sequence.next(), &event) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "input event not encoded");
                    continue;
                }
            };
            match transport.send_frame(&packet) {
                Ok(SendOutcome::Sent(_)) => self.counters.input_events += 1,
                Ok(SendOutcome::WouldBlock) => debug!(?event, "socket busy, input event dropped"),
                Err(e) => warn!(error = %e, "input event not sent"),
            }
        }
    }

    // ── Presentation ─────────────────────────────────────────────

    /// Hand a frame to the render worker, or present it inline.
    fn deliver(&mut self, frame: RenderFrame) -> Result<(), StreamError> {
        if self.render.is_some() {
            if self.render_queue.push(frame) {
                self.counters.record_frame();
            } else {
                self.counters.frames_dropped += 1;
            }
            return Ok(());
        }
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        let started = Instant::now();
        match sink.present(&frame.pixels, frame.width, frame.height, frame.stride) {
            Ok(()) => {
                self.counters.render.update_duration(started.elapsed());
                self.counters.record_frame();
            }
            Err(StreamError::ResourceLost(reason)) => {
                warn!(%reason, "render device lost, re-initialising");
                sink.reinitialize()
                    .map_err(|e| StreamError::init("render sink", format!("{reason}: {e}")))?;
                self.counters.recoveries += 1;
            }
            Err(e) => {
                debug!(sequence = frame.sequence, error = %e, "frame not presented");
                self.counters.frames_dropped += 1;
            }
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Join workers, flush the codec, close the transport and release every
    /// collaborator. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.stop.stop();
        let was = self.state;
        self.teardown();
        self.state = SessionState::Stopped;
        if was.is_runnable() {
            self.stats().log(was.name());
        }
        info!(from = %was, "session stopped");
    }

    fn teardown(&mut self) {
        if let Some(worker) = self.capture.as_mut() {
            worker.stop();
            if let Some(source) = worker.take_source() {
                self.source = Some(source);
            }
        }
        if let Some(worker) = self.render.as_mut() {
            worker.stop();
            if let Some(sink) = worker.take_sink() {
                self.sink = Some(sink);
            }
        }

        if let Some(codec) = self.codec.as_mut() {
            match codec.flush() {
                Ok(pending) if !pending.is_empty() => {
                    debug!(frames = pending.len(), "discarding frames held by the codec");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "codec flush failed"),
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        if let Some(mut source) = self.source.take() {
            source.release();
        }
        if let Some(mut sink) = self.sink.take() {
            sink.release();
        }
        if let Some(mut injector) = self.injector.take() {
            injector.release();
        }
        self.signaling = None;
        self.capture_queue.clear();
        self.render_queue.clear();
        while self.input_rx.try_recv().is_ok() {}
    }

    /// Forget a failed initialization so a retry starts clean.
    fn discard_attempt(&mut self) {
        self.transport = None;
        self.codec = None;
        self.abr = None;
        self.capture = None;
        self.render = None;
        self.session_id = None;
        self.advertised = None;
        self.decoder_unavailable = false;
        self.input_enabled = false;
        self.counters = Counters::default();
    }

    // ── Stats ────────────────────────────────────────────────────

    pub fn stats(&self) -> SessionStats {
        let c = &self.counters;
        let link = self.transport.as_ref().map(|t| t.stats()).unwrap_or_default();
        let capture = self.capture.as_ref().map(CaptureWorker::stats);
        let render = self.render.as_ref().map(RenderWorker::stats);
        let abr = self.abr.as_ref().map(AdaptiveBitrateController::stats);
        let frame_time_ms = c.frame_time.value();

        SessionStats {
            frames_processed: c.frames_processed,
            frames_sent: link.frames_sent,
            frames_received: link.frames_received,
            frames_dropped: c.frames_dropped + capture.map_or(0, |s| s.frames_dropped),
            render_underruns: render.map_or(0, |s| s.frames_dropped),
            frames_lost: self.tracker.total_lost(),
            malformed_packets: link.malformed_packets,
            bytes_sent: link.bytes_sent,
            bytes_received: link.bytes_received,
            compression_ratio: SessionStats::compression_ratio(c.raw_bytes, c.wire_bytes),
            timings: StageTimings {
                capture_ms: capture.map_or(c.capture.value(), |s| s.avg_stage_ms),
                encode_ms: c.encode.value(),
                network_ms: c.network.value(),
                render_ms: render.map_or(c.render.value(), |s| s.avg_stage_ms),
            },
            frame_time_ms,
            fps: SessionStats::fps_from_frame_time(frame_time_ms),
            current_bitrate_mbps: abr.map_or(0, |s| s.current_mbps),
            bitrate_changes: abr.map_or(0, |s| s.bitrate_change_count),
            latency_ms: link.latency_ms,
            bandwidth_mbps: link.bandwidth_mbps,
            recoveries: c.recoveries,
            input_enabled: self.input_enabled,
            input_events: c.input_events,
        }
    }

    pub fn log_stats(&self) {
        self.stats().log(self.state.name());
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::TransportOptions;
    use crate::session::factory::SyntheticCollaborators;
    use crate::signaling::UnavailableSignaling;

    fn small_config(threaded: bool) -> SessionConfig {
        SessionConfig {
            target_fps: 200,
            threaded,
            capture_width: 64,
            capture_height: 16,
            stats_interval: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn session(threaded: bool, factory: SyntheticCollaborators) -> SessionOrchestrator {
        SessionOrchestrator::new(small_config(threaded), Box::new(factory))
    }

    #[test]
    fn second_initialize_is_rejected() {
        let mut s = session(false, SyntheticCollaborators::new());
        s.initialize_loopback(32, 8).unwrap();
        assert_eq!(s.state(), SessionState::Loopback);
        let err = s.initialize_loopback(32, 8).unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidState {
                state: "loopback",
                ..
            }
        ));
    }

    #[test]
    fn run_requires_initialization() {
        let mut s = session(false, SyntheticCollaborators::new());
        assert!(matches!(s.run(), Err(StreamError::InvalidState { .. })));
    }

    #[test]
    fn failed_initialization_stays_uninitialized() {
        let mut s = session(false, SyntheticCollaborators::new());
        let err = s.initialize_loopback(0, 0).unwrap_err();
        assert!(matches!(err, StreamError::InitializationFailure { .. }));
        assert_eq!(s.state(), SessionState::Uninitialized);
        s.initialize_loopback(16, 4).unwrap();
    }

    #[test]
    fn inline_loopback_ends_when_sink_closes() {
        let factory = SyntheticCollaborators::new().close_after(5);
        let counters = factory.counters();
        let mut s = session(false, factory);
        s.initialize_loopback(32, 8).unwrap();
        s.run().unwrap();
        assert_eq!(s.state(), SessionState::Stopped);
        assert_eq!(counters.frames_presented(), 5);
        assert_eq!(counters.last_frame(), Some((32, 8, 128)));
        assert_eq!(s.stats().frames_processed, 5);
    }

    #[test]
    fn threaded_loopback_ends_when_sink_closes() {
        let factory = SyntheticCollaborators::new().close_after(3);
        let counters = factory.counters();
        let mut s = session(true, factory);
        s.initialize_loopback(32, 8).unwrap();
        s.run().unwrap();
        assert!(counters.frames_presented() >= 3);
        assert!(s.stats().frames_processed >= 3);
    }

    #[test]
    fn stop_handle_ends_run_from_another_thread() {
        let mut s = session(true, SyntheticCollaborators::new());
        s.initialize_loopback(32, 8).unwrap();
        let stop = s.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stop.stop();
        });
        s.run().unwrap();
        stopper.join().unwrap();
        assert_eq!(s.state(), SessionState::Stopped);
    }

    #[test]
    fn unrecoverable_inline_source_fails_run() {
        let factory = SyntheticCollaborators::new()
            .with_source_loss_at(1)
            .with_failing_reinitialize();
        let mut s = session(false, factory);
        s.initialize_loopback(32, 8).unwrap();
        let err = s.run().unwrap_err();
        assert!(matches!(err, StreamError::InitializationFailure { .. }));
        assert_eq!(s.state(), SessionState::Stopped);
    }

    #[test]
    fn unrecoverable_worker_source_fails_run() {
        let factory = SyntheticCollaborators::new()
            .with_source_loss_at(0)
            .with_failing_reinitialize();
        let mut s = session(true, factory);
        s.initialize_loopback(32, 8).unwrap();
        assert!(matches!(
            s.run(),
            Err(StreamError::InitializationFailure { .. })
        ));
    }

    #[test]
    fn recovered_source_keeps_running() {
        let factory = SyntheticCollaborators::new()
            .with_source_loss_at(2)
            .close_after(6);
        let mut s = session(false, factory);
        s.initialize_loopback(32, 8).unwrap();
        s.run().unwrap();
        assert_eq!(s.stats().recoveries, 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut s = session(true, SyntheticCollaborators::new());
        s.initialize_loopback(32, 8).unwrap();
        s.stop();
        s.stop();
        assert_eq!(s.state(), SessionState::Stopped);
        assert!(matches!(s.run(), Err(StreamError::InvalidState { .. })));
        assert!(matches!(
            s.initialize_loopback(32, 8),
            Err(StreamError::InvalidState { state: "stopped", .. })
        ));
    }

    #[test]
    fn server_without_client_sends_nothing() {
        let mut s = session(false, SyntheticCollaborators::new());
        s.initialize_as_server(0, 40).unwrap();
        assert!(s.local_addr().is_some());
        let stop = s.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stop.stop();
        });
        s.run().unwrap();
        stopper.join().unwrap();
        let stats = s.stats();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.current_bitrate_mbps, 40);
        assert!(!stats.input_enabled);
    }

    #[test]
    fn host_with_unavailable_signaling_fails() {
        let mut s = session(false, SyntheticCollaborators::new());
        let err = s
            .initialize_as_host(0, 20, Box::new(UnavailableSignaling))
            .unwrap_err();
        assert!(matches!(err, StreamError::InitializationFailure { .. }));
        assert_eq!(s.state(), SessionState::Uninitialized);
    }

    #[test]
    fn failed_initialization_leaves_nothing_behind() {
        let mut s = session(true, SyntheticCollaborators::new());
        assert!(s
            .initialize_as_host(0, 20, Box::new(UnavailableSignaling))
            .is_err());
        assert_eq!(s.local_addr(), None);
        assert_eq!(s.session_id(), None);
        let stats = s.stats();
        assert_eq!(stats.current_bitrate_mbps, 0);
        assert_eq!(stats.bitrate_changes, 0);
        assert_eq!(stats.frames_dropped, 0);

        s.initialize_as_server(0, 30).unwrap();
        assert_eq!(s.stats().current_bitrate_mbps, 30);
    }

    #[test]
    fn server_injects_client_input() {
        let factory = SyntheticCollaborators::new().record_input();
        let recorder = factory.input_recorder().unwrap();
        let mut s = session(false, factory);
        s.initialize_as_server(0, 20).unwrap();
        assert!(s.stats().input_enabled);
        let port = s.local_addr().unwrap().port();

        let mut client =
            UdpTransport::connect("127.0.0.1", port, TransportOptions::default()).unwrap();
        client
            .send_frame(&Frame::feedback(0, &ReceiverReport::default()))
            .unwrap();
        let mut header = FrameHeader::new(1, 0, 0, 0, 3);
        header.flags = FrameFlags::INPUT;
        let mut unreadable = header.to_bytes().to_vec();
        unreadable.extend_from_slice(&[0xFF; 3]);
        client.send(&unreadable).unwrap();
        let event = InputEvent::Key {
            virtual_key: 0x20,
            pressed: true,
        };
        client.send_frame(&Frame::input(2, &event).unwrap()).unwrap();

        let stop = s.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stop.stop();
        });
        s.run().unwrap();
        stopper.join().unwrap();
        assert_eq!(recorder.events(), vec![event]);
        assert_eq!(s.stats().input_events, 1);
    }

    #[test]
    fn client_forwards_queued_input() {
        let mut server = UdpTransport::bind(0, TransportOptions::default()).unwrap();
        let port = server.local_addr().unwrap().port();
        let mut s = session(false, SyntheticCollaborators::new());
        s.initialize_as_client("127.0.0.1", port).unwrap();

        let event = InputEvent::MouseMove { x: 40, y: 7 };
        assert!(s.input_handle().send(event));
        let stop = s.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            stop.stop();
        });
        s.run().unwrap();
        stopper.join().unwrap();
        assert_eq!(s.stats().input_events, 1);

        let mut forwarded = Vec::new();
        while let Some(frame) = server.receive_frame(Duration::from_millis(200)).unwrap() {
            if frame.is_input() {
                forwarded.push(InputEvent::from_bytes(frame.payload()).unwrap());
            }
        }
        assert_eq!(forwarded, vec![event]);
    }

    #[test]
    fn invalid_config_is_reported() {
        let config = SessionConfig {
            min_bitrate_mbps: 0,
            ..small_config(false)
        };
        let mut s = SessionOrchestrator::new(config, Box::new(SyntheticCollaborators::new()));
        assert!(matches!(
            s.initialize_as_server(0, 10),
            Err(StreamError::InvalidConfig(_))
        ));
    }
}
