//! `Authorization` headers for RTSP (RFC 2617 Basic and MD5 Digest).

use base64::Engine;
use md5::{Digest, Md5};
use secrecy::{ExposeSecret, SecretString};

#[derive(Debug, Clone, PartialEq)]
pub enum Challenge {
    Basic,
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
    },
}

/// Parse one `WWW-Authenticate` value.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("digest") {
        return None;
    }
    let param = |name: &str| -> Option<String> {
        params.split(',').find_map(|p| {
            let (k, v) = p.trim().split_once('=')?;
            k.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().trim_matches('"').to_string())
        })
    };
    Some(Challenge::Digest {
        realm: param("realm")?,
        nonce: param("nonce")?,
        opaque: param("opaque"),
    })
}

/// Credentials plus the last challenge the server issued.
#[derive(Clone)]
pub struct Authenticator {
    username: String,
    password: SecretString,
    challenge: Option<Challenge>,
}

impl Authenticator {
    pub fn new(username: String, password: SecretString) -> Self {
        Self {
            username,
            password,
            challenge: None,
        }
    }

    /// Adopt the strongest usable challenge. Returns false when nothing
    /// changed, so a second 401 is final.
    pub fn accept_challenges<'a>(&mut self, headers: impl Iterator<Item = &'a str>) -> bool {
        if self.username.is_empty() {
            return false;
        }
        let mut offered: Vec<Challenge> = headers.filter_map(parse_challenge).collect();
        offered.sort_by_key(|c| matches!(c, Challenge::Basic));
        match offered.into_iter().next() {
            Some(c) if self.challenge.as_ref() != Some(&c) => {
                self.challenge = Some(c);
                true
            }
            _ => false,
        }
    }

    pub fn header(&self, method: &str, uri: &str) -> Option<String> {
        match self.challenge.as_ref()? {
            Challenge::Basic => {
                let raw = format!("{}:{}", self.username, self.password.expose_secret());
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                ))
            }
            Challenge::Digest {
                realm,
                nonce,
                opaque,
            } => {
                let ha1 = md5_hex(&format!(
                    "{}:{}:{}",
                    self.username,
                    realm,
                    self.password.expose_secret()
                ));
                let ha2 = md5_hex(&format!("{}:{}", method, uri));
                let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));
                let mut value = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.username, realm, nonce, uri, response
                );
                if let Some(opaque) = opaque {
                    value.push_str(&format!(", opaque=\"{}\"", opaque));
                }
                Some(value)
            }
        }
    }
}

pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> Authenticator {
        Authenticator::new("pi".into(), SecretString::new("raspberry".into()))
    }

    #[test]
    fn no_header_before_challenge() {
        assert!(auth().header("DESCRIBE", "rtsp://cam/doorbell").is_none());
    }

    #[test]
    fn basic_header() {
        let mut a = auth();
        assert!(a.accept_challenges(["Basic realm=\"doorbell\""].into_iter()));
        assert_eq!(
            a.header("DESCRIBE", "rtsp://cam/doorbell").unwrap(),
            "Basic cGk6cmFzcGJlcnJ5"
        );
        assert!(!a.accept_challenges(["Basic realm=\"doorbell\""].into_iter()));
    }

    #[test]
    fn prefers_digest_over_basic() {
        let mut a = auth();
        a.accept_challenges(
            [
                "Basic realm=\"cam\"",
                "Digest realm=\"cam\", nonce=\"abc123\", opaque=\"xyz\"",
            ]
            .into_iter(),
        );
        let h = a.header("DESCRIBE", "rtsp://cam/doorbell").unwrap();
        let ha1 = md5_hex("pi:cam:raspberry");
        let ha2 = md5_hex("DESCRIBE:rtsp://cam/doorbell");
        let expected = md5_hex(&format!("{}:abc123:{}", ha1, ha2));
        assert!(h.starts_with("Digest username=\"pi\", realm=\"cam\", nonce=\"abc123\""));
        assert!(h.contains(&format!("response=\"{}\"", expected)));
        assert!(h.ends_with("opaque=\"xyz\""));
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn anonymous_never_answers_challenges() {
        let mut a = Authenticator::new(String::new(), SecretString::new(String::new()));
        assert!(!a.accept_challenges(["Basic realm=\"x\""].into_iter()));
    }
}
