//! One RTSP control connection.
//!
//! A reader task owns the read half. `$`-prefixed interleaved frames go to
//! the attached media channel; responses are matched to their request by
//! `CSeq`. When the reader stops, every outstanding request fails with
//! `SessionClosed` and the media channel ends.

use crate::rtsp::message::{parse_head, RtspRequest, RtspResponse};
use bytes::Bytes;
use knock_core::{MediaFrame, SessionError, SessionResult};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest status or header line accepted, CRLF included.
pub const MAX_LINE: usize = 8 * 1024;
/// Most header lines accepted in one message.
pub const MAX_HEADERS: usize = 64;
/// Largest message body accepted.
pub const MAX_BODY: usize = 1024 * 1024;

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u32, oneshot::Sender<RtspResponse>>>,
    media: Mutex<Option<mpsc::Sender<MediaFrame>>>,
    /// Last frame handed to the media consumer, or the attach time.
    media_seen: Mutex<Option<Instant>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<RtspResponse>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn media(&self) -> MutexGuard<'_, Option<mpsc::Sender<MediaFrame>>> {
        self.media.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn media_seen(&self) -> MutexGuard<'_, Option<Instant>> {
        self.media_seen.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Removes a request's response slot when the caller stops waiting.
struct PendingSlot<'a> {
    shared: &'a Shared,
    cseq: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.cseq);
    }
}

pub struct RtspConnection {
    endpoint: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    next_cseq: AtomicU32,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl RtspConnection {
    pub async fn connect(endpoint: &str) -> SessionResult<Self> {
        let tcp = TcpStream::connect(endpoint)
            .await
            .map_err(|e| SessionError::unreachable(format!("TCP connect to {}: {}", endpoint, e)))?;
        tcp.set_nodelay(true).ok();
        let (rd, wr) = tcp.into_split();

        let shared = Arc::new(Shared::default());
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            endpoint.to_string(),
            BufReader::new(rd),
            shared.clone(),
            closed.clone(),
        ));

        Ok(Self {
            endpoint: endpoint.to_string(),
            writer: tokio::sync::Mutex::new(wr),
            shared,
            next_cseq: AtomicU32::new(1),
            closed,
            reader,
        })
    }

    /// Fires once the connection is gone, whether dropped or shut down.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a request and wait for the response carrying the same `CSeq`.
    pub async fn send(&self, request: &RtspRequest) -> SessionResult<RtspResponse> {
        if self.is_closed() {
            return Err(SessionError::closed(format!("{}: connection closed", self.endpoint)));
        }
        let cseq = self.next_cseq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(cseq, tx);
        let _slot = PendingSlot {
            shared: &self.shared,
            cseq,
        };

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(request.encode(cseq).as_bytes()).await?;
        }
        log::trace!("{} >>> {} {} (CSeq {})", self.endpoint, request.method, request.url, cseq);

        tokio::select! {
            biased;
            resp = rx => resp.map_err(|_| SessionError::closed(format!("{}: connection dropped", self.endpoint))),
            _ = self.closed.cancelled() => Err(SessionError::closed(format!("{}: connection dropped", self.endpoint))),
        }
    }

    /// Route interleaved frames to a fresh channel, replacing any earlier one.
    pub fn attach_media(&self, capacity: usize) -> mpsc::Receiver<MediaFrame> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.shared.media() = Some(tx);
        *self.shared.media_seen() = Some(Instant::now());
        rx
    }

    pub fn detach_media(&self) {
        self.shared.media().take();
    }

    /// Time since media last reached the consumer, `None` with no consumer.
    pub fn media_idle_for(&self) -> Option<Duration> {
        let media = self.shared.media();
        match media.as_ref() {
            Some(tx) if !tx.is_closed() => self.shared.media_seen().map(|at| at.elapsed()),
            _ => None,
        }
    }

    pub async fn shutdown(&self) {
        self.closed.cancel();
        self.reader.abort();
        self.detach_media();
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for RtspConnection {
    fn drop(&mut self) {
        self.closed.cancel();
        self.reader.abort();
    }
}

/// Marks the connection closed however the reader task ends, abort included.
struct ReaderExit {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        self.closed.cancel();
        self.shared.pending().clear();
        self.shared.media().take();
    }
}

async fn read_loop(
    endpoint: String,
    mut reader: BufReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    closed: CancellationToken,
) {
    let _exit = ReaderExit {
        shared: shared.clone(),
        closed: closed.clone(),
    };
    let outcome = tokio::select! {
        r = pump(&mut reader, &shared) => r,
        _ = closed.cancelled() => Ok(()),
    };
    match outcome {
        Ok(()) => log::debug!("{}: RTSP reader stopped", endpoint),
        Err(e) => log::debug!("{}: RTSP connection lost: {}", endpoint, e),
    }
}

async fn pump(reader: &mut BufReader<OwnedReadHalf>, shared: &Shared) -> io::Result<()> {
    loop {
        let first = {
            let buf = reader.fill_buf().await?;
            match buf.first() {
                Some(b) => *b,
                None => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed")),
            }
        };
        if first == b'$' {
            let frame = read_frame(reader).await?;
            deliver_frame(shared, frame);
        } else {
            let Some(resp) = read_response(reader).await? else {
                continue;
            };
            match resp.cseq().and_then(|cseq| shared.pending().remove(&cseq)) {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => log::debug!("dropping unmatched RTSP response {}", resp.status),
            }
        }
    }
}

/// `$` + channel + 16-bit big-endian length + payload.
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<MediaFrame> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let len = u16::from_be_bytes([head[2], head[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(MediaFrame {
        channel: head[1],
        payload: Bytes::from(payload),
    })
}

fn deliver_frame(shared: &Shared, frame: MediaFrame) {
    let mut media = shared.media();
    let Some(tx) = media.as_ref() else {
        return;
    };
    match tx.try_send(frame) {
        Ok(()) => *shared.media_seen() = Some(Instant::now()),
        Err(mpsc::error::TrySendError::Full(_)) => log::trace!("media consumer lagging, frame dropped"),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            media.take();
        }
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// `read_line` that refuses lines longer than [`MAX_LINE`].
async fn read_bounded_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut String) -> io::Result<usize> {
    let n = (&mut *reader).take(MAX_LINE as u64).read_line(buf).await?;
    if n >= MAX_LINE && !buf.ends_with('\n') {
        return Err(invalid(format!("RTSP line exceeds {} bytes", MAX_LINE)));
    }
    Ok(n)
}

/// Read one text message. Server-initiated requests are skipped and
/// yield `None`.
async fn read_response(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<RtspResponse>> {
    let mut start = String::new();
    if read_bounded_line(reader, &mut start).await? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
    }
    if start.trim().is_empty() {
        return Ok(None);
    }

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if read_bounded_line(reader, &mut line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed mid-message"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(invalid(format!("RTSP message exceeds {} headers", MAX_HEADERS)));
        }
        headers.push(line.to_string());
    }

    let parsed = parse_head(&start, &headers);
    let content_length = match &parsed {
        Ok(resp) => resp.content_length(),
        Err(_) => headers
            .iter()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0),
    };
    if content_length > MAX_BODY {
        return Err(invalid(format!(
            "RTSP body of {} bytes exceeds {} bytes",
            content_length, MAX_BODY
        )));
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    match parsed {
        Ok(mut resp) => {
            resp.body = String::from_utf8_lossy(&body).into_owned();
            log::trace!("<<< RTSP {} {}", resp.status, resp.reason);
            Ok(Some(resp))
        }
        Err(e) => {
            log::debug!("ignoring server message: {}", e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knock_core::SessionErrorKind;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    /// Answers the first request with `reply` verbatim and keeps the
    /// socket open afterwards.
    async fn serve_once(reply: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = stream.into_split();
            let mut reader = BufReader::new(rd);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 || line.trim().is_empty() {
                    break;
                }
            }
            let _ = wr.write_all(&reply).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        addr
    }

    async fn send_options(reply: Vec<u8>) -> (RtspConnection, SessionResult<RtspResponse>, Duration) {
        let endpoint = serve_once(reply).await;
        let conn = RtspConnection::connect(&endpoint).await.unwrap();
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(3),
            conn.send(&RtspRequest::new("OPTIONS", format!("rtsp://{}/doorbell", endpoint))),
        )
        .await
        .expect("send should settle before the timeout");
        (conn, result, started.elapsed())
    }

    #[tokio::test]
    async fn answers_normal_reply() {
        let (conn, result, _) = send_options(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;
        let resp = result.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "ok");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn delivered_frames_reset_media_idle_clock() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            let _ = stream.write_all(&[b'$', 0, 0, 2, 0x80, 0x60]).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let conn = RtspConnection::connect(&endpoint).await.unwrap();
        assert_eq!(conn.media_idle_for(), None);
        let mut rx = conn.attach_media(8);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.media_idle_for().unwrap() >= Duration::from_millis(50));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.payload.as_ref(), &[0x80, 0x60]);
        assert!(conn.media_idle_for().unwrap() < Duration::from_millis(50));

        drop(rx);
        assert_eq!(conn.media_idle_for(), None);
    }

    #[tokio::test]
    async fn huge_content_length_closes_the_connection() {
        for length in [(MAX_BODY + 1).to_string(), (1u64 << 62).to_string(), usize::MAX.to_string()] {
            let reply = format!("RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: {}\r\n\r\n", length);
            let (conn, result, elapsed) = send_options(reply.into_bytes()).await;
            assert_eq!(result.unwrap_err().kind, SessionErrorKind::SessionClosed);
            assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
            assert!(conn.is_closed());
        }
    }

    #[tokio::test]
    async fn overlong_header_line_closes_the_connection() {
        let mut reply = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nX-Junk: ".to_vec();
        reply.resize(reply.len() + MAX_LINE, b'a');
        reply.extend_from_slice(b"\r\n\r\n");
        let (conn, result, _) = send_options(reply).await;
        assert_eq!(result.unwrap_err().kind, SessionErrorKind::SessionClosed);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn too_many_headers_close_the_connection() {
        let mut reply = String::from("RTSP/1.0 200 OK\r\nCSeq: 1\r\n");
        for i in 0..=MAX_HEADERS {
            reply.push_str(&format!("X-Extra-{}: 1\r\n", i));
        }
        reply.push_str("\r\n");
        let (conn, result, _) = send_options(reply.into_bytes()).await;
        assert_eq!(result.unwrap_err().kind, SessionErrorKind::SessionClosed);
        assert!(conn.is_closed());
    }
}
