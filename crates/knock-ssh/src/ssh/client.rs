//! Blocking libssh2 wrapper. Every method here must run on the blocking pool.

use crate::ssh::error::map_ssh_error;
use knock_core::{ExecOutput, SessionError, SessionResult};
use secrecy::{ExposeSecret, SecretString};
use ssh2::Session;
use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

const KEEPALIVE_INTERVAL_SECS: u32 = 30;

pub struct SshClient {
    session: Session,
    endpoint: String,
}

impl SshClient {
    /// Establish TCP asynchronously, then hand the socket to libssh2 for the
    /// handshake and password authentication.
    pub async fn connect(
        address: &str,
        port: u16,
        username: String,
        password: SecretString,
        io_timeout: Duration,
    ) -> SessionResult<Self> {
        let endpoint = format!("{}:{}", address, port);
        let tcp = tokio::net::TcpStream::connect(&endpoint)
            .await
            .map_err(|e| SessionError::unreachable(format!("TCP connect to {}: {}", endpoint, e)))?;
        tcp.set_nodelay(true).ok();
        let tcp = tcp.into_std()?;
        tcp.set_nonblocking(false)?;

        tokio::task::spawn_blocking(move || {
            Self::handshake(tcp, endpoint, &username, &password, io_timeout)
        })
        .await
        .map_err(|e| SessionError::closed(format!("SSH handshake task aborted: {}", e)))?
    }

    fn handshake(
        tcp: TcpStream,
        endpoint: String,
        username: &str,
        password: &SecretString,
        io_timeout: Duration,
    ) -> SessionResult<Self> {
        let mut session = Session::new().map_err(|e| map_ssh_error("create session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(io_timeout));
        session
            .handshake()
            .map_err(|e| map_ssh_error("SSH handshake", e))?;
        session
            .userauth_password(username, password.expose_secret())
            .map_err(|e| map_ssh_error("password authentication", e))?;
        if !session.authenticated() {
            return Err(SessionError::auth_rejected(format!(
                "{} did not accept the credentials for {}",
                endpoint, username
            )));
        }
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);
        log::debug!("SSH authenticated to {} as {}", endpoint, username);
        Ok(Self { session, endpoint })
    }

    pub fn set_io_timeout(&self, limit: Duration) {
        self.session.set_timeout(timeout_millis(limit));
    }

    /// Run one command to completion and collect its output.
    pub fn exec(&self, command: &str) -> SessionResult<ExecOutput> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| map_ssh_error("open channel", e))?;
        channel
            .exec(command)
            .map_err(|e| map_ssh_error("exec", e))?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel
            .wait_close()
            .map_err(|e| map_ssh_error("close channel", e))?;
        let exit_status = channel
            .exit_status()
            .map_err(|e| map_ssh_error("exit status", e))?;

        log::debug!("{}: `{}` exited with {}", self.endpoint, command, exit_status);
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_status,
        })
    }

    /// Keepalive plus a no-op command.
    pub fn probe(&self) -> SessionResult<()> {
        self.session
            .keepalive_send()
            .map_err(|e| map_ssh_error("keepalive", e))?;
        let out = self.exec("true")?;
        if out.exit_status != 0 {
            return Err(SessionError::protocol(
                out.exit_status.unsigned_abs() as u16,
                "liveness command failed",
            ));
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            log::debug!("{}: SSH disconnect failed: {}", self.endpoint, e);
        }
    }
}

fn timeout_millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_clamps() {
        assert_eq!(timeout_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(timeout_millis(Duration::from_secs(u64::MAX / 2)), u32::MAX);
    }
}
