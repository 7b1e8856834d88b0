//! Control-channel codec (RFC 959 §4): CRLF-terminated commands and
//! single or multi-line replies with a 3-digit code.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::FtpResponse;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Longest reply line accepted, CRLF included.
pub const MAX_LINE: usize = 8 * 1024;
/// Most lines accepted in one multi-line reply.
pub const MAX_REPLY_LINES: usize = 1024;

pub struct FtpCodec {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FtpCodec {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            reader: BufReader::new(rd),
            writer: wr,
        }
    }

    /// Send a raw command; CRLF is appended here.
    pub async fn send_command(&mut self, cmd: &str) -> FtpResult<()> {
        let line = format!("{}\r\n", cmd);
        self.writer.write_all(line.as_bytes()).await?;
        if cmd.starts_with("PASS ") {
            log::trace!(">>> PASS ****");
        } else {
            log::trace!(">>> {}", cmd);
        }
        Ok(())
    }

    async fn read_line_raw(&mut self) -> FtpResult<String> {
        let mut buf = String::new();
        let n = (&mut self.reader).take(MAX_LINE as u64).read_line(&mut buf).await?;
        if n == 0 {
            return Err(FtpError::disconnected("Server closed connection"));
        }
        if n >= MAX_LINE && !buf.ends_with('\n') {
            return Err(FtpError::protocol_error(format!("Reply line exceeds {} bytes", MAX_LINE)));
        }
        Ok(buf)
    }

    /// Read a complete reply. Multi-line replies open with `NNN-` and end
    /// at the first line starting with `NNN `.
    pub async fn read_response(&mut self) -> FtpResult<FtpResponse> {
        let first = self.read_line_raw().await?;
        let first = first.trim_end_matches(['\r', '\n']);
        let code = parse_code(first)?;
        let mut lines = vec![first.to_string()];

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line_raw().await?;
                let next = next.trim_end_matches(['\r', '\n']);
                lines.push(next.to_string());
                if next.starts_with(&terminator) {
                    break;
                }
                if lines.len() >= MAX_REPLY_LINES {
                    return Err(FtpError::protocol_error(format!(
                        "Multi-line {} reply exceeds {} lines",
                        code, MAX_REPLY_LINES
                    )));
                }
            }
        }

        let resp = FtpResponse { code, lines };
        log::trace!("<<< {}", resp.lines.last().map(String::as_str).unwrap_or(""));
        Ok(resp)
    }

    pub async fn execute(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        self.send_command(cmd).await?;
        self.read_response().await
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str) -> FtpResult<FtpResponse> {
        let resp = self.execute(cmd).await?;
        if resp.code / 100 != 2 {
            return Err(FtpError::from_reply(resp.code, &resp.text()));
        }
        Ok(resp)
    }
}

fn parse_code(line: &str) -> FtpResult<u16> {
    line.get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| FtpError::protocol_error(format!("Invalid reply code in: '{}'", line)))
}
