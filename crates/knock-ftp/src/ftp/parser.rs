//! LIST / MLSD response parser.
//!
//! Three line formats are recognised:
//! 1. MLSD facts (RFC 3659): `type=file;size=1234;modify=20260101120000; clip.mp4`
//! 2. Unix `ls -l`: `-rwxr-xr-x 1 pi pi 1234 Jan  1 12:00 clip.mp4`
//! 3. Windows/IIS: `01-01-26  12:00AM       1234 clip.mp4`
//!
//! Anything else becomes an entry of kind `Unknown` named by the raw line.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use knock_core::{EntryKind, RemoteEntry};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    static ref UNIX_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})\S?\s+  # permissions
        (\d+)\s+                         # link count
        (\S+)\s+                         # owner
        (\S+)\s+                         # group
        (\d+)\s+                         # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s+    # date
        (.+)$                            # name, possibly `name -> target`
        ",
    )
    .expect("valid unix listing regex");
    static ref WINDOWS_RE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2})\s+          # date
        (\d{1,2}:\d{2}(?:AM|PM)?)\s+     # time
        (<DIR>|\d+)\s+                   # size or <DIR>
        (.+)$                            # name
        ",
    )
    .expect("valid windows listing regex");
}

/// Parse a full LIST or MLSD body, dropping `.` and `..`.
pub fn parse_listing(raw: &str) -> Vec<RemoteEntry> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(parse_line)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

fn parse_line(line: &str) -> RemoteEntry {
    if line.contains(';') && line.contains('=') {
        if let Some(e) = parse_mlsd(line) {
            return e;
        }
    }
    parse_unix(line)
        .or_else(|| parse_windows(line))
        .unwrap_or_else(|| RemoteEntry {
            name: line.to_string(),
            kind: EntryKind::Unknown,
            size: 0,
            modified: None,
            permissions: None,
            link_target: None,
        })
}

// ─── MLSD ────────────────────────────────────────────────────────────

fn parse_mlsd(line: &str) -> Option<RemoteEntry> {
    let (facts_str, name) = match line.find("; ") {
        Some(pos) => (&line[..pos + 1], &line[pos + 2..]),
        None => {
            let pos = line.rfind(' ')?;
            (&line[..pos], &line[pos + 1..])
        }
    };
    if name.is_empty() {
        return None;
    }

    let facts: HashMap<String, &str> = facts_str
        .split(';')
        .filter_map(|seg| seg.trim().split_once('='))
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let kind = match facts.get("type").map(|s| s.to_lowercase()).as_deref() {
        Some("dir") | Some("cdir") | Some("pdir") => EntryKind::Directory,
        Some("file") => EntryKind::File,
        Some("os.unix=symlink") | Some("os.unix=slink") => EntryKind::Symlink,
        _ => EntryKind::Unknown,
    };

    Some(RemoteEntry {
        name: name.to_string(),
        kind,
        size: facts
            .get("size")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0),
        modified: facts.get("modify").and_then(|v| parse_mlsd_time(v)),
        permissions: facts.get("unix.mode").map(|s| s.to_string()),
        link_target: None,
    })
}

/// `YYYYMMDDHHmmSS[.fraction]`
fn parse_mlsd_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.get(..14).unwrap_or(s);
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

// ─── Unix ────────────────────────────────────────────────────────────

fn parse_unix(line: &str) -> Option<RemoteEntry> {
    let caps = UNIX_RE.captures(line)?;
    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let name_raw = caps.get(7)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => EntryKind::Directory,
        Some(b'l') => EntryKind::Symlink,
        Some(b'-') => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.split_once(" -> ")) {
        (EntryKind::Symlink, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (name_raw.to_string(), None),
    };

    Some(RemoteEntry {
        name,
        kind,
        size,
        modified: parse_unix_date(caps.get(6)?.as_str()),
        permissions: Some(perms.to_string()),
        link_target,
    })
}

/// `Jan  1 12:00` (current year) or `Jan  1  2025` (midnight).
fn parse_unix_date(s: &str) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let with_year = format!("{} {}", Utc::now().format("%Y"), normalised);
    if let Ok(dt) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    let dt = date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?);
    Some(Utc.from_utc_datetime(&dt))
}

// ─── Windows ─────────────────────────────────────────────────────────

fn parse_windows(line: &str) -> Option<RemoteEntry> {
    let caps = WINDOWS_RE.captures(line)?;
    let size_or_dir = caps.get(3)?.as_str();
    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, size_or_dir.parse::<u64>().unwrap_or(0))
    };

    Some(RemoteEntry {
        name: caps.get(4)?.as_str().to_string(),
        kind,
        size,
        modified: parse_windows_date(caps.get(1)?.as_str(), caps.get(2)?.as_str()),
        permissions: None,
        link_target: None,
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    NaiveDateTime::parse_from_str(&combined, "%m-%d-%y %I:%M%p")
        .or_else(|_| NaiveDateTime::parse_from_str(&combined, "%m-%d-%y %H:%M"))
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}
