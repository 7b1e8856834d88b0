//! Scripted in-process RTSP server for tests.
//!
//! DESCRIBE requires `Basic pi:raspberry`. PLAY is followed by
//! [`FakeRtspServer::FRAMES`] interleaved frames on channel 0.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=doorbell\r\na=control:*\r\n\
                   m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=control:trackID=0\r\n";
const EXPECTED_AUTH: &str = "Basic cGk6cmFzcGJlcnJ5";

pub struct FakeRtspServer {
    pub port: u16,
    methods: Arc<Mutex<Vec<String>>>,
    kill: CancellationToken,
}

impl FakeRtspServer {
    pub const FRAMES: u8 = 3;

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let methods = Arc::new(Mutex::new(Vec::new()));
        let kill = CancellationToken::new();
        let (log, stop) = (methods.clone(), kill.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (log, stop) = (log.clone(), stop.clone());
                tokio::spawn(async move {
                    tokio::select! {
                        _ = handle(stream, log) => {}
                        _ = stop.cancelled() => {}
                    }
                });
            }
        });
        Self { port, methods, kill }
    }

    /// Methods received so far, in order.
    pub async fn requests(&self) -> Vec<String> {
        self.methods.lock().await.clone()
    }

    /// Drop every open connection.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

async fn handle(stream: TcpStream, log: Arc<Mutex<Vec<String>>>) {
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);
    loop {
        let mut start = String::new();
        if reader.read_line(&mut start).await.unwrap_or(0) == 0 {
            return;
        }
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            headers.push(line);
        }
        let header = |name: &str| {
            headers.iter().find_map(|h| {
                let (k, v) = h.split_once(':')?;
                k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
            })
        };
        let method = start.split(' ').next().unwrap_or_default().to_string();
        let cseq = header("CSeq").unwrap_or_default();
        log.lock().await.push(method.clone());

        let (status, extra, body) = match method.as_str() {
            "OPTIONS" => ("200 OK", "Public: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN\r\n".to_string(), ""),
            "DESCRIBE" if header("Authorization").as_deref() != Some(EXPECTED_AUTH) => (
                "401 Unauthorized",
                "WWW-Authenticate: Basic realm=\"doorbell\"\r\n".to_string(),
                "",
            ),
            "DESCRIBE" => ("200 OK", "Content-Type: application/sdp\r\n".to_string(), SDP),
            "SETUP" => (
                "200 OK",
                "Session: 12345678;timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n".to_string(),
                "",
            ),
            "PLAY" | "PAUSE" | "TEARDOWN" => ("200 OK", "Session: 12345678\r\n".to_string(), ""),
            _ => ("501 Not Implemented", String::new(), ""),
        };
        let reply = format!(
            "RTSP/1.0 {}\r\nCSeq: {}\r\n{}Content-Length: {}\r\n\r\n{}",
            status,
            cseq,
            extra,
            body.len(),
            body
        );
        if wr.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
        if method == "PLAY" {
            for i in 0..FakeRtspServer::FRAMES {
                let frame = [b'$', 0, 0, 3, 0x80, 0x60, i];
                if wr.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    }
}
