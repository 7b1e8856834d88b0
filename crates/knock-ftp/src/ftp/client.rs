//! Stateful FTP client: owns the control connection and issues commands.
//!
//! Lifecycle: `connect()` → banner → USER/PASS → FEAT → OPTS UTF8 → TYPE I.
//! Every transfer opens a fresh passive data connection.

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::parser;
use crate::ftp::protocol::FtpCodec;
use crate::ftp::transfer;
use crate::ftp::types::ServerFeatures;
use knock_core::{FtpCommand, Outcome, RemoteEntry};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A logged-in FTP control connection.
pub struct FtpClient {
    codec: FtpCodec,
    host: String,
    data_timeout: Duration,
    pub features: ServerFeatures,
    pub banner: String,
}

impl FtpClient {
    /// Connect, authenticate and switch to binary mode.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &SecretString,
        data_timeout: Duration,
    ) -> FtpResult<Self> {
        let addr = format!("{}:{}", host, port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| FtpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();

        let mut codec = FtpCodec::from_tcp(tcp);
        let banner = codec.read_response().await?;
        if banner.code != 220 {
            return Err(FtpError::from_reply(banner.code, &banner.text()));
        }

        let user_resp = codec.execute(&format!("USER {}", username)).await?;
        if user_resp.code == 331 {
            let pass_resp = codec
                .execute(&format!("PASS {}", password.expose_secret()))
                .await?;
            if !pass_resp.is_success() {
                return Err(FtpError::auth_failed(format!("Login failed: {}", pass_resp.text()))
                    .with_code(pass_resp.code));
            }
        } else if !user_resp.is_success() {
            return Err(FtpError::auth_failed(format!("USER rejected: {}", user_resp.text()))
                .with_code(user_resp.code));
        }

        let features = match codec.execute("FEAT").await {
            Ok(r) if r.is_success() => ServerFeatures::from_feat(&r.lines),
            _ => ServerFeatures::default(),
        };
        if features.utf8 {
            let _ = codec.execute("OPTS UTF8 ON").await;
        }
        codec.expect_ok("TYPE I").await?;

        log::debug!("FTP logged in to {} as {}", addr, username);
        Ok(Self {
            codec,
            host: host.to_string(),
            data_timeout,
            features,
            banner: banner.text(),
        })
    }

    /// Dispatch one request.
    pub async fn run(&mut self, command: FtpCommand) -> FtpResult<Outcome> {
        match command {
            FtpCommand::List { path } => self.list(&path).await.map(Outcome::Listing),
            FtpCommand::Download { path } => self.retrieve(&path).await.map(Outcome::Bytes),
            FtpCommand::Upload { path, data } => self.store(&path, &data).await.map(|_| Outcome::Done),
            FtpCommand::Delete { path } => self.simple(&format!("DELE {}", path)).await,
            FtpCommand::MakeDir { path } => self.simple(&format!("MKD {}", path)).await,
            FtpCommand::RemoveDir { path } => self.simple(&format!("RMD {}", path)).await,
            FtpCommand::Rename { from, to } => self.rename(&from, &to).await.map(|_| Outcome::Done),
            FtpCommand::Size { path } => self.size(&path).await.map(Outcome::Size),
        }
    }

    async fn simple(&mut self, cmd: &str) -> FtpResult<Outcome> {
        self.codec.expect_ok(cmd).await?;
        Ok(Outcome::Done)
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// MLSD when advertised, LIST otherwise or when MLSD is refused.
    pub async fn list(&mut self, path: &str) -> FtpResult<Vec<RemoteEntry>> {
        if self.features.mlsd {
            match self.retrieve_text(&with_arg("MLSD", path)).await {
                Ok(body) => return Ok(parser::parse_listing(&body)),
                Err(e) if e.kind == FtpErrorKind::CommandRejected => {
                    log::debug!("MLSD refused ({}), falling back to LIST", e);
                }
                Err(e) => return Err(e),
            }
        }
        let body = self.retrieve_text(&with_arg("LIST", path)).await?;
        Ok(parser::parse_listing(&body))
    }

    async fn retrieve_text(&mut self, cmd: &str) -> FtpResult<String> {
        let data = self.retrieve_data(cmd).await?;
        String::from_utf8(data).map_err(|e| FtpError::protocol_error(format!("Listing not UTF-8: {}", e)))
    }

    // ─── Transfers ───────────────────────────────────────────────

    pub async fn retrieve(&mut self, path: &str) -> FtpResult<Vec<u8>> {
        self.retrieve_data(&format!("RETR {}", path)).await
    }

    /// Open a data channel, send `cmd`, drain the channel and read the
    /// completion reply.
    async fn retrieve_data(&mut self, cmd: &str) -> FtpResult<Vec<u8>> {
        let mut data = transfer::open_passive(&mut self.codec, &self.host, self.data_timeout).await?;
        self.start_transfer(cmd).await?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .await
            .map_err(|e| FtpError::new(FtpErrorKind::TransferFailed, format!("data read: {}", e)))?;
        drop(data);
        self.finish_transfer().await?;
        Ok(buf)
    }

    pub async fn store(&mut self, path: &str, bytes: &[u8]) -> FtpResult<()> {
        let mut data = transfer::open_passive(&mut self.codec, &self.host, self.data_timeout).await?;
        self.start_transfer(&format!("STOR {}", path)).await?;
        data.write_all(bytes)
            .await
            .map_err(|e| FtpError::new(FtpErrorKind::TransferFailed, format!("data write: {}", e)))?;
        data.shutdown().await.ok();
        drop(data);
        self.finish_transfer().await
    }

    async fn start_transfer(&mut self, cmd: &str) -> FtpResult<()> {
        let resp = self.codec.execute(cmd).await?;
        if !resp.is_preliminary() && resp.code / 100 != 2 {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(())
    }

    async fn finish_transfer(&mut self) -> FtpResult<()> {
        let done = self.codec.read_response().await?;
        if done.code / 100 != 2 {
            return Err(FtpError::from_reply(done.code, &done.text()));
        }
        Ok(())
    }

    // ─── File commands ───────────────────────────────────────────

    pub async fn rename(&mut self, from: &str, to: &str) -> FtpResult<()> {
        let resp = self.codec.execute(&format!("RNFR {}", from)).await?;
        if resp.code != 350 {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        self.codec.expect_ok(&format!("RNTO {}", to)).await?;
        Ok(())
    }

    /// RFC 3659 SIZE: `213 12345`.
    pub async fn size(&mut self, path: &str) -> FtpResult<u64> {
        let resp = self.codec.expect_ok(&format!("SIZE {}", path)).await?;
        let text = resp.text();
        text.split_whitespace()
            .nth(1)
            .and_then(|n| n.trim().parse::<u64>().ok())
            .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse SIZE: {}", text)))
    }

    pub async fn noop(&mut self) -> FtpResult<()> {
        self.codec.expect_ok("NOOP").await?;
        Ok(())
    }

    /// Best-effort QUIT.
    pub async fn quit(&mut self) {
        if let Err(e) = self.codec.execute("QUIT").await {
            log::debug!("FTP QUIT to {} failed: {}", self.host, e);
        }
    }
}

fn with_arg(cmd: &str, path: &str) -> String {
    if path.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::fake_server::FakeFtpServer;
    use knock_core::EntryKind;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[tokio::test]
    async fn login_and_list_via_mlsd() {
        let server = FakeFtpServer::start().await;
        let mut client = FtpClient::connect("127.0.0.1", server.port, "pi", &secret("raspberry"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(client.features.mlsd);
        let entries = client.list("/clips").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "visitor.jpg");
        assert_eq!(entries[1].kind, EntryKind::Directory);
        client.quit().await;
    }

    #[tokio::test]
    async fn wrong_password_is_auth_failure() {
        let server = FakeFtpServer::start().await;
        let err = FtpClient::connect("127.0.0.1", server.port, "pi", &secret("nope"), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, FtpErrorKind::AuthFailed);
        assert_eq!(err.code, Some(530));
    }

    #[tokio::test]
    async fn retrieve_size_and_missing_delete() {
        let server = FakeFtpServer::start().await;
        let mut client = FtpClient::connect("127.0.0.1", server.port, "pi", &secret("raspberry"), Duration::from_secs(5))
            .await
            .unwrap();
        let bytes = client.retrieve("visitor.jpg").await.unwrap();
        assert_eq!(bytes, FakeFtpServer::FILE_BODY);
        assert_eq!(client.size("visitor.jpg").await.unwrap(), FakeFtpServer::FILE_BODY.len() as u64);
        let err = client.run(FtpCommand::Delete { path: "missing.txt".into() }).await.unwrap_err();
        assert_eq!(err.code, Some(550));
        assert_eq!(err.kind, FtpErrorKind::NotFound);
    }

    #[tokio::test]
    async fn store_uploads_bytes() {
        let server = FakeFtpServer::start().await;
        let mut client = FtpClient::connect("127.0.0.1", server.port, "pi", &secret("raspberry"), Duration::from_secs(5))
            .await
            .unwrap();
        client.store("upload.bin", b"hello doorbell").await.unwrap();
        assert_eq!(server.uploaded().await, b"hello doorbell".to_vec());
    }

    #[test]
    fn empty_path_omits_argument() {
        assert_eq!(with_arg("LIST", ""), "LIST");
        assert_eq!(with_arg("MLSD", "/a"), "MLSD /a");
    }
}
