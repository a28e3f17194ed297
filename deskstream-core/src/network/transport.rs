//! Unreliable datagram transport for frames.
//!
//! One [`Frame`] is one UDP datagram. There is no handshake, no
//! acknowledgement, no retransmission and no reordering: a lost datagram
//! is simply a gap in the sequence numbers the receiver sees.
//!
//! A server transport does not know its peer up front. It learns the
//! sender address from every valid frame it receives, so a client that is
//! rebound behind a NAT is picked up again on its next datagram. Datagrams
//! that fail validation never move the peer.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};

use crate::codec::{DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_MAX_FRAME_BYTES, FrameCodec};
use crate::error::StreamError;
use crate::packet::Frame;
use crate::pipeline::bandwidth::BandwidthEstimator;

/// Socket buffer size requested for both directions.
pub const DEFAULT_SOCKET_BUFFER: usize = 2 * 1024 * 1024;

// ── Types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Server,
    Client,
}

/// Result of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    /// The kernel buffer was full; the datagram was not queued.
    WouldBlock,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub max_datagram_size: usize,
    /// Largest `stride * height` a received header may describe.
    pub max_frame_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            send_buffer: DEFAULT_SOCKET_BUFFER,
            recv_buffer: DEFAULT_SOCKET_BUFFER,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Per-connection counters. Reset whenever the remote endpoint changes
/// through `connect_to`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    /// Valid frames only. Malformed datagrams are counted separately.
    pub frames_received: u64,
    pub malformed_packets: u64,
    /// Smoothed latency estimate in milliseconds.
    pub latency_ms: f64,
    /// Send throughput over the last second.
    pub bandwidth_mbps: f64,
}

// ── Transport trait ──────────────────────────────────────────────

/// A bidirectional, unreliable, unordered datagram channel.
pub trait Transport: Send {
    fn role(&self) -> TransportRole;

    /// Send one datagram to the current peer. Never blocks.
    fn send(&mut self, datagram: &[u8]) -> Result<SendOutcome, StreamError>;

    /// Wait up to `timeout` for one datagram. `Duration::ZERO` polls.
    /// Raw datagrams are not validated and never change the peer.
    fn receive(&mut self, timeout: Duration) -> Result<Option<(Bytes, SocketAddr)>, StreamError>;

    /// Encode and send one frame.
    fn send_frame(&mut self, frame: &Frame) -> Result<SendOutcome, StreamError>;

    /// Receive and decode one frame. A datagram that fails validation is
    /// counted in `malformed_packets` and returned as `MalformedPacket`.
    /// A server adopts the sender of a valid frame as its peer.
    fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, StreamError>;

    fn stats(&self) -> ConnectionStats;

    /// Fold a latency sample (ms) into the smoothed estimate.
    fn update_latency(&mut self, sample_ms: f64);

    fn peer(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Result<SocketAddr, StreamError>;

    /// Release the socket. Later sends and receives fail with `InvalidState`.
    fn close(&mut self);
}

// ── UdpTransport ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    NonBlocking,
    Timeout(Duration),
}

pub struct UdpTransport {
    socket: Option<UdpSocket>,
    role: TransportRole,
    peer: Option<SocketAddr>,
    codec: FrameCodec,
    stats: ConnectionStats,
    bandwidth: BandwidthEstimator,
    read_mode: Option<ReadMode>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Listen on `0.0.0.0:port` as a server. Port 0 picks an ephemeral port.
    pub fn bind(port: u16, options: TransportOptions) -> Result<Self, StreamError> {
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let socket = open_socket(local, &options)
            .map_err(|e| StreamError::init("transport", format!("bind {local}: {e}")))?;
        info!(addr = %local, "UDP transport listening");
        Ok(Self::from_socket(socket, TransportRole::Server, None, &options))
    }

    /// Open a client socket targeting `address:port`. No handshake happens;
    /// the first datagram either side sends is the first traffic.
    pub fn connect(address: &str, port: u16, options: TransportOptions) -> Result<Self, StreamError> {
        let mut transport = Self::open_client(options)?;
        transport.connect_to(address, port)?;
        info!(remote = ?transport.peer, "UDP transport targeting peer");
        Ok(transport)
    }

    /// A client socket on an ephemeral port with no peer yet. Used when the
    /// local port must be known before the remote one, as in signaling.
    pub fn open_client(options: TransportOptions) -> Result<Self, StreamError> {
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let socket = open_socket(local, &options)
            .map_err(|e| StreamError::init("transport", format!("bind {local}: {e}")))?;
        Ok(Self::from_socket(socket, TransportRole::Client, None, &options))
    }

    /// Re-target an open transport and reset its counters.
    pub fn connect_to(&mut self, address: &str, port: u16) -> Result<(), StreamError> {
        let remote = resolve(address, port)
            .map_err(|e| StreamError::init("transport", format!("resolve {address}:{port}: {e}")))?;
        self.peer = Some(remote);
        self.reset_stats();
        debug!(%remote, "transport re-targeted");
        Ok(())
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn from_socket(
        socket: UdpSocket,
        role: TransportRole,
        peer: Option<SocketAddr>,
        options: &TransportOptions,
    ) -> Self {
        let codec =
            FrameCodec::new(options.max_datagram_size).with_max_frame_bytes(options.max_frame_bytes);
        Self {
            socket: Some(socket),
            role,
            peer,
            codec,
            stats: ConnectionStats::default(),
            bandwidth: BandwidthEstimator::new(),
            read_mode: None,
            recv_buf: vec![0u8; codec.max_datagram_size() + 1],
        }
    }

    fn reset_stats(&mut self) {
        self.stats = ConnectionStats::default();
        self.bandwidth = BandwidthEstimator::new();
    }

    fn socket(&self, action: &'static str) -> Result<&UdpSocket, StreamError> {
        self.socket.as_ref().ok_or(StreamError::InvalidState {
            state: "closed",
            action,
        })
    }

    /// Switch the socket between polling and timed reads, skipping the
    /// syscalls when it is already in the requested mode.
    fn set_read_mode(&mut self, mode: ReadMode) -> Result<(), StreamError> {
        if self.read_mode == Some(mode) {
            return Ok(());
        }
        let socket = self.socket("configure")?;
        match mode {
            ReadMode::NonBlocking => socket.set_nonblocking(true)?,
            ReadMode::Timeout(timeout) => {
                socket.set_nonblocking(false)?;
                socket.set_read_timeout(Some(timeout))?;
            }
        }
        self.read_mode = Some(mode);
        Ok(())
    }

    /// Read one datagram into `recv_buf`. `None` when nothing arrived in time.
    fn recv_datagram(&mut self, timeout: Duration) -> Result<Option<(usize, SocketAddr)>, StreamError> {
        let mode = if timeout.is_zero() {
            ReadMode::NonBlocking
        } else {
            ReadMode::Timeout(timeout)
        };
        self.set_read_mode(mode)?;

        let Some(socket) = self.socket.as_ref() else {
            return Err(StreamError::InvalidState {
                state: "closed",
                action: "receive",
            });
        };
        let (len, from) = match socket.recv_from(&mut self.recv_buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.stats.bytes_received += len as u64;
        Ok(Some((len, from)))
    }

    fn learn_peer(&mut self, from: SocketAddr) {
        if self.role == TransportRole::Server && self.peer != Some(from) {
            info!(peer = %from, "learned peer address");
            self.peer = Some(from);
        }
    }
}

impl Transport for UdpTransport {
    fn role(&self) -> TransportRole {
        self.role
    }

    fn send(&mut self, datagram: &[u8]) -> Result<SendOutcome, StreamError> {
        let Some(peer) = self.peer else {
            return Err(StreamError::InvalidState {
                state: "waiting for peer",
                action: "send",
            });
        };
        self.set_read_mode(ReadMode::NonBlocking)?;
        let sent = self.socket("send")?.send_to(datagram, peer);
        match sent {
            Ok(n) => {
                self.stats.bytes_sent += n as u64;
                self.bandwidth.record(n as u64);
                self.stats.bandwidth_mbps = self.bandwidth.estimate_bps() as f64 * 8.0 / 1_000_000.0;
                Ok(SendOutcome::Sent(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, timeout: Duration) -> Result<Option<(Bytes, SocketAddr)>, StreamError> {
        let received = self.recv_datagram(timeout)?;
        Ok(received.map(|(len, from)| (Bytes::copy_from_slice(&self.recv_buf[..len]), from)))
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<SendOutcome, StreamError> {
        let mut datagram = BytesMut::with_capacity(frame.wire_len());
        self.codec.encode(frame, &mut datagram)?;
        let outcome = self.send(&datagram)?;
        if matches!(outcome, SendOutcome::Sent(_)) {
            self.stats.frames_sent += 1;
        }
        Ok(outcome)
    }

    fn receive_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, StreamError> {
        let Some((len, from)) = self.recv_datagram(timeout)? else {
            return Ok(None);
        };
        let mut datagram = BytesMut::from(&self.recv_buf[..len]);
        let decoded = match self.codec.decode(&mut datagram) {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(StreamError::MalformedPacket("empty datagram")),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(frame) => {
                self.stats.frames_received += 1;
                self.learn_peer(from);
                Ok(Some(frame))
            }
            Err(e) => {
                self.stats.malformed_packets += 1;
                debug!(%from, len, error = %e, "dropping datagram");
                Err(e)
            }
        }
    }

    fn stats(&self) -> ConnectionStats {
        self.stats
    }

    fn update_latency(&mut self, sample_ms: f64) {
        self.stats.latency_ms = if self.stats.latency_ms == 0.0 {
            sample_ms
        } else {
            self.stats.latency_ms * 0.9 + sample_ms * 0.1
        };
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Result<SocketAddr, StreamError> {
        Ok(self.socket("query")?.local_addr()?)
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!(role = ?self.role, "transport closed");
        }
        self.read_mode = None;
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn open_socket(local: SocketAddr, options: &TransportOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    // The kernel may cap these; a smaller buffer is not an error.
    if let Err(e) = socket.set_send_buffer_size(options.send_buffer) {
        debug!(error = %e, "send buffer size not applied");
    }
    if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer) {
        debug!(error = %e, "receive buffer size not applied");
    }
    socket.bind(&local.into())?;
    Ok(socket.into())
}

fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    let mut candidates: Vec<SocketAddr> = (address, port).to_socket_addrs()?.collect();
    // Sockets are bound on IPv4.
    candidates.sort_by_key(|a| !a.is_ipv4());
    candidates
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address"))
}

// ── Tests ────────────────────────────────────────────────────────
