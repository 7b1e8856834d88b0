//! RTSP/1.0 message framing.

use std::fmt::Write as _;

const USER_AGENT: &str = concat!("knockly/", env!("CARGO_PKG_VERSION"));

/// Outgoing request. `CSeq` is assigned by the connection at send time.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn new(method: &'static str, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Replace any existing header of the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn encode(&self, cseq: u32) -> String {
        let mut out = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", self.method, self.url, cseq);
        for (k, v) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", k, v);
        }
        let _ = write!(out, "User-Agent: {}\r\n\r\n", USER_AGENT);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspResponse {
    /// First header with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")?.trim().parse().ok()
    }

    /// Session identifier without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<String> {
        let raw = self.header("Session")?;
        let id = raw.split(';').next()?.trim();
        (!id.is_empty()).then(|| id.to_string())
    }

    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Parse a status line and header lines (the blank terminator excluded).
/// The body is filled in separately once `Content-Length` is known.
pub fn parse_head(status_line: &str, header_lines: &[String]) -> Result<RtspResponse, String> {
    let mut parts = status_line.trim_end().splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(format!("not an RTSP status line: '{}'", status_line.trim_end()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| format!("bad status code in '{}'", status_line.trim_end()))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = header_lines
        .iter()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok(RtspResponse {
        status,
        reason,
        headers,
        body: String::new(),
    })
}

/// `a=control:` of the first media section, falling back to the
/// session-level attribute.
pub fn media_control(sdp: &str) -> Option<String> {
    let mut session_level = None;
    let mut in_media = false;
    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            in_media = true;
        } else if let Some(control) = line.strip_prefix("a=control:") {
            if in_media {
                return Some(control.trim().to_string());
            }
            session_level.get_or_insert_with(|| control.trim().to_string());
        }
    }
    session_level
}

/// Resolve a control attribute against the presentation URL.
pub fn resolve_control(base: &str, control: &str) -> String {
    if control.is_empty() || control == "*" {
        base.to_string()
    } else if control.starts_with("rtsp://") {
        control.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), control.trim_start_matches('/'))
    }
}
