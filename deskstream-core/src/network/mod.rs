pub mod transport;

pub use transport::{
    ConnectionStats, DEFAULT_SOCKET_BUFFER, SendOutcome, Transport, TransportOptions,
    TransportRole, UdpTransport,
};
