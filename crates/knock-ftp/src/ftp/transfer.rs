//! Passive data channel (RFC 959 PASV, RFC 2428 EPSV).

use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::protocol::FtpCodec;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

lazy_static! {
    static ref PASV_RE: Regex =
        Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").expect("valid PASV regex");
    static ref EPSV_RE: Regex = Regex::new(r"\|\|\|(\d+)\|").expect("valid EPSV regex");
}

/// Open a data connection: PASV first, EPSV when PASV is refused.
pub async fn open_passive(
    codec: &mut FtpCodec,
    host: &str,
    data_timeout: Duration,
) -> FtpResult<TcpStream> {
    match open_pasv(codec, data_timeout).await {
        Ok(tcp) => Ok(tcp),
        Err(e) if e.kind == FtpErrorKind::CommandRejected => {
            log::debug!("PASV refused ({}), trying EPSV", e);
            open_epsv(codec, host, data_timeout).await
        }
        Err(e) => Err(e),
    }
}

/// Reply format: `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`
async fn open_pasv(codec: &mut FtpCodec, data_timeout: Duration) -> FtpResult<TcpStream> {
    let resp = codec.expect_ok("PASV").await?;
    let addr = parse_pasv_response(&resp.text())?;
    connect_data(addr.to_string(), "PASV", data_timeout).await
}

/// Reply format: `229 Entering Extended Passive Mode (|||port|)`; the data
/// port lives on the control host.
async fn open_epsv(codec: &mut FtpCodec, host: &str, data_timeout: Duration) -> FtpResult<TcpStream> {
    let resp = codec.expect_ok("EPSV").await?;
    let port = parse_epsv_response(&resp.text())?;
    connect_data(format!("{}:{}", host, port), "EPSV", data_timeout).await
}

async fn connect_data(addr: String, mode: &str, data_timeout: Duration) -> FtpResult<TcpStream> {
    timeout(data_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| FtpError::data_channel(format!("{} data connect timed out", mode)))?
        .map_err(|e| FtpError::data_channel(format!("{} data connect to {}: {}", mode, addr, e)))
}

fn parse_pasv_response(text: &str) -> FtpResult<SocketAddr> {
    let caps = PASV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse PASV: {}", text)))?;
    let nums = (1..=6)
        .map(|i| {
            caps[i]
                .parse::<u8>()
                .map_err(|_| FtpError::protocol_error("PASV number out of range"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (nums[4] as u16) * 256 + nums[5] as u16;
    Ok(SocketAddr::new(ip, port))
}

fn parse_epsv_response(text: &str) -> FtpResult<u16> {
    let caps = EPSV_RE
        .captures(text)
        .ok_or_else(|| FtpError::protocol_error(format!("Cannot parse EPSV: {}", text)))?;
    caps[1]
        .parse::<u16>()
        .map_err(|_| FtpError::protocol_error("EPSV port out of range"))
}
