//! Protocol-specific request payloads and their results.
//!
//! A [`Payload`] is carried opaquely through `ProtocolSession::execute`; its
//! variant decides which protocol (and therefore which session) serves it.

use crate::types::{Capability, Protocol};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

// ─── Requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FtpCommand {
    List { path: String },
    Download { path: String },
    Upload { path: String, data: Vec<u8> },
    Delete { path: String },
    MakeDir { path: String },
    RemoveDir { path: String },
    Rename { from: String, to: String },
    Size { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SshCommand {
    Exec { command: String },
}

impl SshCommand {
    /// Make `name` executable inside `dir` and run it.
    pub fn script(dir: &str, name: &str) -> Self {
        SshCommand::Exec {
            command: format!("cd {dir} && chmod +x {name} && ./{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspCommand {
    /// Fetch the SDP description of the stream.
    Describe,
    Play,
    Pause,
    /// SETUP + PLAY and hand back a streaming handle.
    OpenStream,
    Teardown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ftp(FtpCommand),
    Ssh(SshCommand),
    Rtsp(RtspCommand),
}

impl Payload {
    pub fn protocol(&self) -> Protocol {
        match self {
            Payload::Ftp(_) => Protocol::Ftp,
            Payload::Ssh(_) => Protocol::Ssh,
            Payload::Rtsp(_) => Protocol::Rtsp,
        }
    }

    pub fn capability(&self) -> Capability {
        self.protocol().capability()
    }

    /// Payloads that destroy remote data; always gated.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Payload::Ftp(FtpCommand::Delete { .. }) | Payload::Ftp(FtpCommand::RemoveDir { .. })
        )
    }

    /// Whether issuing the payload twice has the same effect as once.
    pub fn is_idempotent(&self) -> bool {
        match self {
            Payload::Ftp(cmd) => matches!(
                cmd,
                FtpCommand::List { .. }
                    | FtpCommand::Download { .. }
                    | FtpCommand::Size { .. }
                    | FtpCommand::Upload { .. }
            ),
            Payload::Ssh(_) => false,
            Payload::Rtsp(cmd) => !matches!(cmd, RtspCommand::OpenStream),
        }
    }

    /// Parse a caller verb such as `list-files` with its single argument.
    pub fn from_verb(verb: &str, arg: &str) -> Option<Self> {
        let path = || arg.to_string();
        let payload = match verb {
            "list-files" => Payload::Ftp(FtpCommand::List { path: path() }),
            "download-file" => Payload::Ftp(FtpCommand::Download { path: path() }),
            "delete-file" => Payload::Ftp(FtpCommand::Delete { path: path() }),
            "make-dir" => Payload::Ftp(FtpCommand::MakeDir { path: path() }),
            "remove-dir" => Payload::Ftp(FtpCommand::RemoveDir { path: path() }),
            "file-size" => Payload::Ftp(FtpCommand::Size { path: path() }),
            "exec" => Payload::Ssh(SshCommand::Exec { command: path() }),
            "describe-stream" => Payload::Rtsp(RtspCommand::Describe),
            "play-stream" => Payload::Rtsp(RtspCommand::Play),
            "pause-stream" => Payload::Rtsp(RtspCommand::Pause),
            "open-stream" => Payload::Rtsp(RtspCommand::OpenStream),
            "teardown-stream" => Payload::Rtsp(RtspCommand::Teardown),
            _ => return None,
        };
        Some(payload)
    }
}

// ─── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub permissions: Option<String>,
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// One interleaved RTP/RTCP frame received on an RTSP connection.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    pub channel: u8,
    pub payload: Bytes,
}

/// Long-lived receiver for a device's media stream.
///
/// Dropping the handle stops delivery; the session stays open.
pub struct StreamHandle {
    rx: mpsc::Receiver<MediaFrame>,
}

impl StreamHandle {
    pub fn new(rx: mpsc::Receiver<MediaFrame>) -> Self {
        Self { rx }
    }

    /// Next frame, or `None` once the session closes.
    pub async fn next_frame(&mut self) -> Option<MediaFrame> {
        self.rx.recv().await
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Outcome {
    Listing(Vec<RemoteEntry>),
    Bytes(Vec<u8>),
    Size(u64),
    Exec(ExecOutput),
    /// SDP body returned by DESCRIBE.
    Description(String),
    Stream(StreamHandle),
    Done,
}
