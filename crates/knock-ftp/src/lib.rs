//! # knock-ftp
//!
//! FTP file-transfer sessions for the device orchestrator.

pub mod ftp;

pub use ftp::*;
