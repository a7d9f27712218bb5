//! Archive member stat collaborator (§4.5a): resolves `archive(member)`
//! references directly against the `ar` container format, without shelling
//! out to `ar`/`nm`. Full archive semantics (thin archives, symbol tables,
//! BSD/GNU extended-name tables) are a Non-goal; this covers the common
//! fixed-width-name case well enough for the out-of-date oracle.

use std::fs;
use std::time::{Duration, SystemTime};

const AR_MAGIC: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;

#[derive(Debug, Clone, Copy)]
pub struct MemberStat {
    pub mtime: SystemTime,
}

/// Split `lib(member)` into `("lib", "member")`. Returns `None` for a bare
/// name with no parenthesized member.
pub fn parse_archive_member(name: &str) -> Option<(String, String)> {
    let open = name.find('(')?;
    if !name.ends_with(')') {
        return None;
    }
    let archive = &name[..open];
    let member = &name[open + 1..name.len() - 1];
    if archive.is_empty() || member.is_empty() {
        return None;
    }
    Some((archive.to_string(), member.to_string()))
}

/// §4.5a resolution order: full name, then the legacy 15-byte-truncated
/// name, then `None`. No other fallback exists.
pub fn arch_stat_member(archive_path: &str, member_name: &str) -> Option<MemberStat> {
    let data = fs::read(archive_path).ok()?;
    if data.len() < AR_MAGIC.len() || &data[..AR_MAGIC.len()] != AR_MAGIC {
        return None;
    }
    find_member(&data, member_name).or_else(|| {
        if member_name.len() > 15 {
            find_member(&data, &member_name[..15])
        } else {
            None
        }
    })
}

/// `true` if `path` begins with the `ar` magic (used by the oracle's
/// `lib`-with-nonzero-mtime branch to tell a real archive from a plain file).
pub fn is_valid_archive(path: &str) -> bool {
    match fs::read(path) {
        Ok(data) => data.len() >= AR_MAGIC.len() && &data[..AR_MAGIC.len()] == AR_MAGIC,
        Err(_) => false,
    }
}

fn find_member(data: &[u8], name: &str) -> Option<MemberStat> {
    let mut pos = AR_MAGIC.len();
    while pos + HEADER_LEN <= data.len() {
        let header = &data[pos..pos + HEADER_LEN];
        let hdr_name = std::str::from_utf8(&header[0..16]).ok()?.trim_end();
        let hdr_mtime = std::str::from_utf8(&header[16..28]).ok()?.trim();
        let hdr_size = std::str::from_utf8(&header[48..58]).ok()?.trim();
        let size: usize = hdr_size.parse().ok()?;
        let clean_name = hdr_name.trim_end_matches('/');

        if clean_name == name {
            let secs: u64 = hdr_mtime.parse().ok()?;
            return Some(MemberStat {
                mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            });
        }
        pos += HEADER_LEN + size + (size % 2);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn splits_archive_and_member() {
        assert_eq!(
            parse_archive_member("libfoo.a(bar.o)"),
            Some(("libfoo.a".to_string(), "bar.o".to_string()))
        );
        assert_eq!(parse_archive_member("plain.o"), None);
    }

    fn write_test_archive(dir: &std::path::Path, members: &[(&str, &[u8], u64)]) -> std::path::PathBuf {
        let path = dir.join("test.a");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(AR_MAGIC).unwrap();
        for (name, data, mtime) in members {
            let padded_name = format!("{name:<16}");
            let header = format!(
                "{}{:<12}{:<6}{:<6}{:<8}{:<10}`\n",
                &padded_name[..16],
                mtime,
                0,
                0,
                0o644,
                data.len()
            );
            f.write_all(header.as_bytes()).unwrap();
            f.write_all(data).unwrap();
            if data.len() % 2 == 1 {
                f.write_all(b"\n").unwrap();
            }
        }
        path
    }

    #[test]
    fn finds_member_by_exact_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(dir.path(), &[("bar.o", b"hello", 1_700_000_000)]);
        let stat = arch_stat_member(path.to_str().unwrap(), "bar.o").unwrap();
        assert_eq!(
            stat.mtime,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn falls_back_to_truncated_name() {
        let dir = tempfile::tempdir().unwrap();
        let long_name = "this_name_is_way_too_long_for_ar.o";
        let truncated = &long_name[..15];
        let path = write_test_archive(dir.path(), &[(truncated, b"x", 42)]);
        let stat = arch_stat_member(path.to_str().unwrap(), long_name);
        assert!(stat.is_some());
    }

    #[test]
    fn missing_member_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(dir.path(), &[("present.o", b"x", 1)]);
        assert!(arch_stat_member(path.to_str().unwrap(), "absent.o").is_none());
    }

    #[test]
    fn not_an_archive_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, b"just text").unwrap();
        assert!(arch_stat_member(path.to_str().unwrap(), "anything").is_none());
    }
}
