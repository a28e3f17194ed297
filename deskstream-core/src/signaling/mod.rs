//! Peer discovery for the `host` / `join` modes.
//!
//! The streaming core only needs a `(local, remote)` address pair. How the
//! peers find each other sits behind [`Signaling`]:
//!
//! - [`UnavailableSignaling`] fails every call; used when no channel is
//!   configured.
//! - [`DirectSignaling`] needs no server at all: the host's address is
//!   packed into the [`SessionId`] the user shares, and offers are
//!   answered locally from it.
//! - [`ChannelSignaling`] carries the JSON wire messages over an
//!   in-process channel pair.

use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StreamError;

// ── Wire messages ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    Guest,
}

/// Minimal session description carrying one UDP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn for_address(addr: SocketAddr) -> Self {
        Self {
            sdp: format!(
                "v=0\r\nc=IN IP4 {}\r\nm=application {} udp deskstream\r\n",
                addr.ip(),
                addr.port()
            ),
        }
    }

    /// The endpoint announced by the `c=` and `m=` lines.
    pub fn address(&self) -> Result<SocketAddr, StreamError> {
        let mut ip = None;
        let mut port = None;
        for line in self.sdp.lines() {
            if let Some(rest) = line.strip_prefix("c=IN IP4 ") {
                ip = rest.trim().parse::<Ipv4Addr>().ok();
            } else if let Some(rest) = line.strip_prefix("m=application ") {
                port = rest.split_whitespace().next().and_then(|p| p.parse::<u16>().ok());
            }
        }
        match (ip, port) {
            (Some(ip), Some(port)) => Ok(SocketAddr::V4(SocketAddrV4::new(ip, port))),
            _ => Err(StreamError::Signaling("session description has no endpoint".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_m_line_index: String,
    pub sdp_mid: String,
}

/// JSON messages exchanged with a signaling server, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        peer_id: String,
        role: PeerRole,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_peer_id: Option<String>,
        session_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_peer_id: Option<String>,
        session_id: String,
        data: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        peer_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_peer_id: Option<String>,
        session_id: String,
        data: IceCandidate,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

impl SignalMessage {
    pub fn to_json(&self) -> Result<String, StreamError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, StreamError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ── Signaling trait ──────────────────────────────────────────────

pub trait Signaling: Send {
    fn send_signal(&mut self, message: &SignalMessage) -> Result<(), StreamError>;

    /// Next message, waiting up to `timeout`. `None` when nothing arrived.
    fn recv_signal(&mut self, timeout: Duration) -> Result<Option<SignalMessage>, StreamError>;
}

/// Placeholder for a signaling server that is not available.
#[derive(Debug, Default)]
pub struct UnavailableSignaling;

impl Signaling for UnavailableSignaling {
    fn send_signal(&mut self, _message: &SignalMessage) -> Result<(), StreamError> {
        Err(StreamError::Signaling("no signaling channel configured".into()))
    }

    fn recv_signal(&mut self, _timeout: Duration) -> Result<Option<SignalMessage>, StreamError> {
        Err(StreamError::Signaling("no signaling channel configured".into()))
    }
}

// ── SessionId ────────────────────────────────────────────────────

/// Shareable id encoding the host's IPv4 endpoint.
///
/// Eight bytes rendered as four dash-separated hex groups: four address
/// octets, the port (big-endian) and a two-byte blake3 checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    host: SocketAddrV4,
}

impl SessionId {
    pub fn new(host: SocketAddrV4) -> Self {
        Self { host }
    }

    pub fn host(&self) -> SocketAddrV4 {
        self.host
    }

    fn payload(&self) -> [u8; 6] {
        let [a, b, c, d] = self.host.ip().octets();
        let [p0, p1] = self.host.port().to_be_bytes();
        [a, b, c, d, p0, p1]
    }
}

fn checksum(payload: &[u8]) -> [u8; 2] {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    [bytes[0], bytes[1]]
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = self.payload();
        let sum = checksum(&payload);
        let all: Vec<u8> = payload.iter().chain(sum.iter()).copied().collect();
        for (i, pair) in all.chunks(2).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl FromStr for SessionId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::Signaling(format!("invalid session id `{s}`"));
        let digits: String = s.chars().filter(|c| *c != '-').collect();
        if digits.len() != 16 || !digits.is_ascii() {
            return Err(invalid());
        }
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        if checksum(&bytes[..6]) != [bytes[6], bytes[7]] {
            return Err(invalid());
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Ok(Self::new(SocketAddrV4::new(ip, port)))
    }
}

// ── DirectSignaling ──────────────────────────────────────────────

/// Serverless signaling: everything needed is in the session id.
///
/// A host learns its id from its own `register`; a guest is built from
/// the id the user typed.
#[derive(Debug)]
pub struct DirectSignaling {
    session: Option<SessionId>,
    role: PeerRole,
    inbox: VecDeque<SignalMessage>,
}

impl DirectSignaling {
    pub fn host() -> Self {
        Self {
            session: None,
            role: PeerRole::Host,
            inbox: VecDeque::new(),
        }
    }

    pub fn guest(session: SessionId) -> Self {
        Self {
            session: Some(session),
            role: PeerRole::Guest,
            inbox: VecDeque::new(),
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }
}

impl Signaling for DirectSignaling {
    fn send_signal(&mut self, message: &SignalMessage) -> Result<(), StreamError> {
        match (message, self.session) {
            (SignalMessage::Register { session_id, .. }, _) if self.role == PeerRole::Host => {
                self.session = Some(session_id.parse()?);
            }
            (SignalMessage::Offer { peer_id, .. }, Some(session)) if self.role == PeerRole::Guest => {
                let host = SocketAddr::V4(session.host());
                self.inbox.push_back(SignalMessage::Answer {
                    peer_id: format!("host-{host}"),
                    remote_peer_id: Some(peer_id.clone()),
                    session_id: session.to_string(),
                    data: SessionDescription::for_address(host),
                });
            }
            (SignalMessage::Ping, _) => self.inbox.push_back(SignalMessage::Pong),
            (other, _) => debug!(message = ?other, "direct signaling: nothing to relay"),
        }
        Ok(())
    }

    fn recv_signal(&mut self, _timeout: Duration) -> Result<Option<SignalMessage>, StreamError> {
        Ok(self.inbox.pop_front())
    }
}

// ── ChannelSignaling ─────────────────────────────────────────────

/// One end of an in-process signaling link. Messages cross as JSON text.
#[derive(Debug)]
pub struct ChannelSignaling {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl ChannelSignaling {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl Signaling for ChannelSignaling {
    fn send_signal(&mut self, message: &SignalMessage) -> Result<(), StreamError> {
        self.tx
            .send(message.to_json()?)
            .map_err(|_| StreamError::Signaling("peer hung up".into()))
    }

    fn recv_signal(&mut self, timeout: Duration) -> Result<Option<SignalMessage>, StreamError> {
        let text = if timeout.is_zero() {
            match self.rx.try_recv() {
                Ok(text) => text,
                Err(mpsc::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(StreamError::Signaling("peer hung up".into()));
                }
            }
        } else {
            match self.rx.recv_timeout(timeout) {
                Ok(text) => text,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StreamError::Signaling("peer hung up".into()));
                }
            }
        };
        SignalMessage::from_json(&text).map(Some)
    }
}

// ── Handshakes ───────────────────────────────────────────────────

/// Addresses the transport should use once signaling finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddresses {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Register as guest, offer `local`, and wait for the host's answer.
pub fn guest_handshake(
    signaling: &mut dyn Signaling,
    session: &str,
    local: SocketAddr,
    timeout: Duration,
) -> Result<PeerAddresses, StreamError> {
    let peer_id = format!("guest-{local}");
    signaling.send_signal(&SignalMessage::Register {
        peer_id: peer_id.clone(),
        role: PeerRole::Guest,
        session_id: session.to_string(),
    })?;
    signaling.send_signal(&SignalMessage::Offer {
        peer_id: peer_id.clone(),
        remote_peer_id: None,
        session_id: session.to_string(),
        data: SessionDescription::for_address(local),
    })?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StreamError::Timeout(timeout));
        }
        match signaling.recv_signal(remaining)? {
            Some(SignalMessage::Answer { data, .. }) => {
                let remote = data.address()?;
                info!(%local, %remote, "signaling answered");
                return Ok(PeerAddresses { local, remote });
            }
            Some(SignalMessage::Ping) => signaling.send_signal(&SignalMessage::Pong)?,
            Some(SignalMessage::Error { message }) => {
                return Err(StreamError::Signaling(message));
            }
            Some(other) => debug!(message = ?other, "ignoring signal while waiting for answer"),
            None => {}
        }
    }
}

/// Host side: answer a guest's offer with `local`. Other messages are
/// not offers and yield `None`.
pub fn answer_offer(
    signaling: &mut dyn Signaling,
    session: &str,
    local: SocketAddr,
    message: &SignalMessage,
) -> Result<Option<PeerAddresses>, StreamError> {
    match message {
        SignalMessage::Offer { peer_id, data, .. } => {
            let remote = data.address()?;
            signaling.send_signal(&SignalMessage::Answer {
                peer_id: format!("host-{local}"),
                remote_peer_id: Some(peer_id.clone()),
                session_id: session.to_string(),
                data: SessionDescription::for_address(local),
            })?;
            info!(%remote, "answered offer");
            Ok(Some(PeerAddresses { local, remote }))
        }
        SignalMessage::Ping => {
            signaling.send_signal(&SignalMessage::Pong)?;
            Ok(None)
        }
        SignalMessage::Error { message } => {
            warn!(%message, "signaling error");
            Ok(None)
        }
        _ => Ok(None),
    }
}

/// Best guess at the address other machines reach us on.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which
/// interface would route to the target.
pub fn detect_local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}
