pub mod client;
pub mod error;
pub mod session;

pub use client::SshClient;
pub use error::map_ssh_error;
pub use session::SshSession;
