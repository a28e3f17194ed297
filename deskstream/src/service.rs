//! Streaming service: turns a mode and a configuration into a running
//! session.

use tracing::info;

use deskstream_core::{
    DirectSignaling, SessionId, SessionOrchestrator, SessionState, StopHandle, StreamError,
    SyntheticCollaborators,
};

use crate::config::AppConfig;

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Capture and present locally.
    Loopback,
    /// Stream to whichever client reports in on `port`.
    Server { port: u16, bitrate_mbps: u32 },
    /// Receive from `address:port`.
    Client { address: String, port: u16 },
    /// Server with a shareable session id.
    Host { port: u16, bitrate_mbps: u32 },
    /// Client that finds its server through a session id.
    Join { session_id: String },
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loopback => write!(f, "loopback"),
            Self::Server { port, .. } => write!(f, "server on :{port}"),
            Self::Client { address, port } => write!(f, "client of {address}:{port}"),
            Self::Host { port, .. } => write!(f, "host on :{port}"),
            Self::Join { session_id } => write!(f, "guest of {session_id}"),
        }
    }
}

// ── StreamService ────────────────────────────────────────────────

/// One session driven from the configuration file.
pub struct StreamService {
    config: AppConfig,
    session: SessionOrchestrator,
}

impl StreamService {
    pub fn new(config: AppConfig) -> Self {
        let mut factory = SyntheticCollaborators::new();
        if config.display.close_after_frames > 0 {
            factory = factory.close_after(config.display.close_after_frames);
        }
        let session = SessionOrchestrator::new(config.to_session_config(), Box::new(factory));
        Self { config, session }
    }

    /// Obtain a handle that stops the session from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Bring the session up in `mode`. Returns the session id when hosting.
    pub fn initialize(&mut self, mode: &Mode) -> Result<Option<SessionId>, StreamError> {
        info!(%mode, "initializing");
        match mode {
            Mode::Loopback => {
                let (width, height) = (self.config.display.width, self.config.display.height);
                self.session.initialize_loopback(width, height)?;
            }
            Mode::Server { port, bitrate_mbps } => {
                self.session.initialize_as_server(*port, *bitrate_mbps)?;
            }
            Mode::Client { address, port } => {
                self.session.initialize_as_client(address, *port)?;
            }
            Mode::Host { port, bitrate_mbps } => {
                let id = self.session.initialize_as_host(
                    *port,
                    *bitrate_mbps,
                    Box::new(DirectSignaling::host()),
                )?;
                return Ok(Some(id));
            }
            Mode::Join { session_id } => {
                let parsed: SessionId = session_id.trim().parse()?;
                self.session
                    .initialize_as_guest(&parsed.to_string(), Box::new(DirectSignaling::guest(parsed)))?;
            }
        }
        Ok(None)
    }

    /// Run until stopped. Blocks the calling thread.
    pub fn run(&mut self) -> Result<(), StreamError> {
        self.session.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.display.width = 64;
        config.display.height = 16;
        config.display.close_after_frames = 3;
        config.display.stats_interval_secs = 0;
        config.pipeline.threaded = false;
        config.input.enabled = false;
        config
    }

    #[test]
    fn loopback_runs_until_window_closes() {
        let mut service = StreamService::new(test_config());
        assert_eq!(service.initialize(&Mode::Loopback).unwrap(), None);
        assert_eq!(service.state(), SessionState::Loopback);
        service.run().unwrap();
        assert_eq!(service.state(), SessionState::Stopped);
    }

    #[test]
    fn host_reports_session_id() {
        let mut config = test_config();
        config.network.advertise_address = "127.0.0.1".into();
        let mut service = StreamService::new(config);
        let id = service
            .initialize(&Mode::Host {
                port: 0,
                bitrate_mbps: 10,
            })
            .unwrap()
            .expect("session id");
        assert_eq!(id.host().ip().octets(), [127, 0, 0, 1]);
        service.stop_handle().stop();
        service.run().unwrap();
    }

    #[test]
    fn join_rejects_garbled_session_id() {
        let mut service = StreamService::new(test_config());
        let err = service
            .initialize(&Mode::Join {
                session_id: "nonsense".into(),
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::Signaling(_)));
        assert_eq!(service.state(), SessionState::Uninitialized);
    }

    #[test]
    fn mode_display() {
        let mode = Mode::Client {
            address: "10.0.0.2".into(),
            port: 7331,
        };
        assert_eq!(mode.to_string(), "client of 10.0.0.2:7331");
    }
}
