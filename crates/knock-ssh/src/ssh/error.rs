//! libssh2 error classification.

use knock_core::SessionError;
use ssh2::ErrorCode;

// libssh2 session error codes (libssh2.h).
const ERROR_BANNER_RECV: i32 = -2;
const ERROR_BANNER_SEND: i32 = -3;
const ERROR_KEX_FAILURE: i32 = -5;
const ERROR_SOCKET_SEND: i32 = -7;
const ERROR_KEY_EXCHANGE_FAILURE: i32 = -8;
const ERROR_TIMEOUT: i32 = -9;
const ERROR_SOCKET_DISCONNECT: i32 = -13;
const ERROR_PASSWORD_EXPIRED: i32 = -15;
const ERROR_AUTHENTICATION_FAILED: i32 = -18;
const ERROR_SOCKET_TIMEOUT: i32 = -30;
const ERROR_SOCKET_RECV: i32 = -43;

/// Map a libssh2 failure onto the shared session error kinds.
pub fn map_ssh_error(context: &str, e: ssh2::Error) -> SessionError {
    let msg = format!("{}: {}", context, e.message());
    match e.code() {
        ErrorCode::Session(ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(ERROR_PASSWORD_EXPIRED) => SessionError::auth_rejected(msg),
        ErrorCode::Session(ERROR_TIMEOUT) | ErrorCode::Session(ERROR_SOCKET_TIMEOUT) => {
            SessionError::timeout(msg)
        }
        ErrorCode::Session(ERROR_SOCKET_SEND)
        | ErrorCode::Session(ERROR_SOCKET_RECV)
        | ErrorCode::Session(ERROR_SOCKET_DISCONNECT) => SessionError::closed(msg),
        ErrorCode::Session(ERROR_BANNER_RECV)
        | ErrorCode::Session(ERROR_BANNER_SEND)
        | ErrorCode::Session(ERROR_KEX_FAILURE)
        | ErrorCode::Session(ERROR_KEY_EXCHANGE_FAILURE) => SessionError::unreachable(msg),
        ErrorCode::Session(code) | ErrorCode::SFTP(code) => {
            SessionError::protocol(code.unsigned_abs() as u16, msg)
        }
    }
}
