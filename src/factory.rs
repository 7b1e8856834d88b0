//! Maps a session key's protocol onto its adapter.

use crate::config::{snapshot, SharedConfig};
use knock_core::{Protocol, SessionFactory, SessionKey, SessionRef};
use knock_ftp::FtpSession;
use knock_rtsp::RtspSession;
use knock_ssh::SshSession;
use std::sync::Arc;

/// Builds real FTP, SSH and RTSP sessions using the current config.
pub struct DefaultSessionFactory {
    config: SharedConfig,
}

impl DefaultSessionFactory {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for DefaultSessionFactory {
    fn create(&self, key: &SessionKey) -> SessionRef {
        let config = snapshot(&self.config);
        let timeout = config.execute_timeout();
        match key.protocol {
            Protocol::Ftp => Arc::new(FtpSession::new(key.clone(), timeout)),
            Protocol::Ssh => Arc::new(SshSession::new(key.clone(), timeout)),
            Protocol::Rtsp => Arc::new(RtspSession::with_path(key.clone(), timeout, &config.rtsp_path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use knock_core::SessionState;

    #[test]
    fn creates_unopened_session_per_protocol() {
        let factory = DefaultSessionFactory::new(OrchestratorConfig::default().shared());
        for protocol in Protocol::ALL {
            let session = factory.create(&SessionKey::new("D1", protocol));
            assert_eq!(session.protocol(), protocol);
            assert_eq!(session.state(), SessionState::Idle);
        }
    }
}
