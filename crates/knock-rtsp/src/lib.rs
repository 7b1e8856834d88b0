//! # knock-rtsp
//!
//! RTSP media sessions for the device orchestrator. Media arrives
//! interleaved on the control connection and is handed out as raw RTP
//! frames; depacketisation is left to the consumer.

pub mod rtsp;

pub use rtsp::*;
