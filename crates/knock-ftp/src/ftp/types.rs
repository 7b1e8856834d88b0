//! Wire-level FTP types.

/// One (possibly multi-line) reply from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FtpResponse {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpResponse {
    /// Full response text (all lines joined).
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// 1xx–3xx.
    pub fn is_success(&self) -> bool {
        self.code < 400
    }

    /// Positive-preliminary reply (1xx).
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }
}

/// What the server advertised in its FEAT reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerFeatures {
    pub mlsd: bool,
    pub size: bool,
    pub utf8: bool,
    pub epsv: bool,
    pub raw: Vec<String>,
}

impl ServerFeatures {
    /// Build from the body lines of a `211` FEAT reply.
    pub fn from_feat(lines: &[String]) -> Self {
        let raw: Vec<String> = lines
            .iter()
            .skip(1)
            .filter(|l| !l.starts_with("211"))
            .map(|l| l.trim().to_uppercase())
            .collect();
        let has = |feat: &str| raw.iter().any(|l| l.starts_with(feat));
        Self {
            mlsd: has("MLSD"),
            size: has("SIZE"),
            utf8: has("UTF8"),
            epsv: has("EPSV"),
            raw,
        }
    }
}
