//! LIST / MLSD response parser.
//!
//! Supports three formats:
//! 1. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//! 2. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 3. **Windows/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines that match none of them (e.g. `total 42`) are dropped.

use crate::ftp::types::{FtpEntry, FtpEntryKind};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Parse a full multi-line LIST or MLSD response body.
pub fn parse_listing(raw: &str) -> Vec<FtpEntry> {
    raw.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_line)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

/// Parse a single line from a listing.
pub fn parse_line(line: &str) -> Option<FtpEntry> {
    if line.contains(';') && line.contains('=') {
        if let Some(e) = parse_mlsd(line) {
            return Some(e);
        }
    }
    let line = line.trim_start();
    parse_unix(line).or_else(|| parse_windows(line))
}

// ─── MLSD parser ─────────────────────────────────────────────────────

/// Parse MLSD fact-line: `fact1=val1;fact2=val2; filename`
fn parse_mlsd(line: &str) -> Option<FtpEntry> {
    let line = line.trim_start();
    let (facts_str, name) = line.split_once(' ')?;
    if name.is_empty() {
        return None;
    }

    let mut kind = FtpEntryKind::Unknown;
    let mut size = 0u64;
    let mut modified = None;
    for segment in facts_str.split(';') {
        let Some((k, v)) = segment.trim().split_once('=') else {
            continue;
        };
        match k.to_lowercase().as_str() {
            "type" => {
                kind = match v.to_lowercase().as_str() {
                    "dir" | "cdir" | "pdir" => FtpEntryKind::Directory,
                    "file" => FtpEntryKind::File,
                    "os.unix=symlink" | "os.unix=slink" => FtpEntryKind::Symlink,
                    _ => FtpEntryKind::Unknown,
                }
            }
            "size" | "sizd" => size = v.parse().unwrap_or(0),
            "modify" => modified = parse_mlsd_time(v),
            _ => {}
        }
    }
    // cdir / pdir entries carry the directory itself.
    if facts_str.to_lowercase().contains("type=cdir") || facts_str.to_lowercase().contains("type=pdir") {
        return None;
    }

    Some(FtpEntry {
        name: name.to_string(),
        kind,
        size,
        modified,
        link_target: None,
    })
}

/// Parse MLSD / MDTM timestamp: `YYYYMMDDHHmmSS[.fraction]`, always UTC.
pub fn parse_mlsd_time(s: &str) -> Option<DateTime<Utc>> {
    let base = s.get(..14)?;
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt))
}

/// Format a timestamp the way MFMT expects it.
pub fn format_mlsd_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%S").to_string()
}

// ─── Unix-style parser ───────────────────────────────────────────────

fn unix_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^([dlcbps-][rwxsStT-]{9})[+@.]?\s+  # permissions
            (\d+)\s+                             # link count
            (\S+)\s+                             # owner
            (?:(\S+)\s+)?                        # group (optional)
            (\d+)\s+                             # size
            (\w{3}\s+\d{1,2}\s+[\d:]+)\s         # date
            (.+)$                                # filename (possibly with -> target)
            ",
        )
        .ok()
    })
    .as_ref()
}

/// Parse a Unix `ls -l` line:
/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str) -> Option<FtpEntry> {
    let caps = unix_re()?.captures(line)?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let date_str = caps.get(6)?.as_str();
    let name_raw = caps.get(7)?.as_str().trim_start();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => FtpEntryKind::Directory,
        Some(b'l') => FtpEntryKind::Symlink,
        Some(b'-') => FtpEntryKind::File,
        _ => FtpEntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.split_once(" -> ")) {
        (FtpEntryKind::Symlink, Some((n, t))) => (n.to_string(), Some(t.to_string())),
        _ => (name_raw.to_string(), None),
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: parse_unix_date(date_str, Utc::now()),
        link_target,
    })
}

/// Parse the date portion: "Jan  1 12:00" or "Jan  1  2025".
///
/// The short form omits the year; it means "within the last six months",
/// so a date that would land in the future belongs to last year.
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        let year = now.year();
        let parse = |y: i32| {
            NaiveDateTime::parse_from_str(&format!("{} {}", y, normalised), "%Y %b %d %H:%M")
                .ok()
                .map(|dt| Utc.from_utc_datetime(&dt))
        };
        let candidate = parse(year)?;
        if candidate > now + chrono::Duration::days(1) {
            return parse(year - 1);
        }
        return Some(candidate);
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)))
}

// ─── Windows-style parser ────────────────────────────────────────────

fn windows_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^(\d{2}-\d{2}-\d{2,4})\s+        # date
            (\d{1,2}:\d{2}(?:AM|PM)?)\s+     # time
            (<DIR>|\d+)\s+                    # size or <DIR>
            (.+)$                             # filename
            ",
        )
        .ok()
    })
    .as_ref()
}

/// Parse Windows / IIS style line:
/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_windows(line: &str) -> Option<FtpEntry> {
    let caps = windows_re()?.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (FtpEntryKind::Directory, 0)
    } else {
        (FtpEntryKind::File, size_or_dir.parse::<u64>().unwrap_or(0))
    };

    Some(FtpEntry {
        name,
        kind,
        size,
        modified: parse_windows_date(date_str, time_str),
        link_target: None,
    })
}

fn parse_windows_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let combined = format!("{} {}", date, time);
    ["%m-%d-%y %I:%M%p", "%m-%d-%y %H:%M", "%m-%d-%Y %I:%M%p", "%m-%d-%Y %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&combined, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}
