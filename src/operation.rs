//! Caller-issued operations and the handles returned for them.

use crate::error::{OrchestratorError, OrchestratorResult};
use knock_core::{Capability, FtpCommand, Outcome, Payload, RtspCommand, SshCommand};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// One request as it flows through the orchestrator.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: String,
    pub device_id: String,
    pub capability: Capability,
    pub payload: Payload,
    /// Caller asked for a biometric check.
    pub sensitive: bool,
    pub cancel: CancellationToken,
}

impl Operation {
    pub fn new(device_id: &str, capability: Capability, payload: Payload, sensitive: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            capability,
            payload,
            sensitive,
            cancel: CancellationToken::new(),
        }
    }

    /// Destructive payloads are gated whatever the caller said.
    pub fn requires_gate(&self) -> bool {
        self.sensitive || self.payload.is_destructive()
    }

    /// Short text for the biometric prompt, e.g. `delete-file /a.txt`.
    pub fn summary(&self) -> String {
        match &self.payload {
            Payload::Ftp(cmd) => match cmd {
                FtpCommand::List { path } => format!("list-files {}", path),
                FtpCommand::Download { path } => format!("download-file {}", path),
                FtpCommand::Upload { path, data } => format!("upload-file {} ({} bytes)", path, data.len()),
                FtpCommand::Delete { path } => format!("delete-file {}", path),
                FtpCommand::MakeDir { path } => format!("make-dir {}", path),
                FtpCommand::RemoveDir { path } => format!("remove-dir {}", path),
                FtpCommand::Rename { from, to } => format!("rename {} -> {}", from, to),
                FtpCommand::Size { path } => format!("file-size {}", path),
            },
            Payload::Ssh(SshCommand::Exec { command }) => format!("exec {}", command),
            Payload::Rtsp(cmd) => match cmd {
                RtspCommand::Describe => "describe-stream".into(),
                RtspCommand::Play => "play-stream".into(),
                RtspCommand::Pause => "pause-stream".into(),
                RtspCommand::OpenStream => "open-stream".into(),
                RtspCommand::Teardown => "teardown-stream".into(),
            },
        }
    }
}

/// Handle for an in-flight operation.
pub struct OperationHandle {
    id: String,
    cancel: CancellationToken,
    result: oneshot::Receiver<OrchestratorResult<Outcome>>,
}

impl OperationHandle {
    pub(crate) fn new(
        id: String,
        cancel: CancellationToken,
        result: oneshot::Receiver<OrchestratorResult<Outcome>>,
    ) -> Self {
        Self { id, cancel, result }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancel the operation; `result()` then yields `OperationCancelled`
    /// unless the outcome was already delivered.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this operation, for handing to another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the outcome.
    pub async fn result(self) -> OrchestratorResult<Outcome> {
        let Self { cancel, mut result, .. } = self;
        tokio::select! {
            biased;
            delivered = &mut result => delivered.unwrap_or(Err(OrchestratorError::OperationCancelled)),
            _ = cancel.cancelled() => Err(OrchestratorError::OperationCancelled),
        }
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle").field("id", &self.id).finish_non_exhaustive()
    }
}
