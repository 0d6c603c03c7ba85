#![forbid(unsafe_code)]

//! Process and credential hygiene shared by the tubegrab binaries.

use anyhow::{Context, Result, bail};
use nix::unistd::Uid;
use std::{fs, io::Write, path::Path};

const NETSCAPE_HEADERS: [&str; 2] = ["# Netscape HTTP Cookie File", "# HTTP Cookie File"];

/// Fails fast when a binary is started as root. Downloads land in user
/// directories and scratch space, neither of which needs elevated rights.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it as a regular user");
    }
    Ok(())
}

/// Rejects uploads that cannot be a Netscape cookie jar. This is a sanity
/// check, not a parser: the extraction tool owns cookie semantics.
pub fn check_cookie_jar(raw: &[u8]) -> Result<()> {
    if raw.is_empty() {
        bail!("cookie file is empty");
    }
    let Ok(text) = std::str::from_utf8(raw) else {
        bail!("cookie file is not text; export it in Netscape format");
    };
    let has_header = text
        .lines()
        .take(5)
        .any(|line| NETSCAPE_HEADERS.iter().any(|header| line.trim() == *header));
    let has_record = text.lines().any(|line| {
        let line = line.trim_start();
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        !line.starts_with('#') && line.split('\t').count() >= 7
    });
    if !has_header && !has_record {
        bail!("cookie file is not in Netscape format");
    }
    Ok(())
}

/// Writes credentials so that only the current user can read them.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    const JAR: &str = "# Netscape HTTP Cookie File\n.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn cookie_jar_accepts_netscape_text() {
        assert!(check_cookie_jar(JAR.as_bytes()).is_ok());
        let headerless = ".youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";
        assert!(check_cookie_jar(headerless.as_bytes()).is_ok());
        let http_only = "#HttpOnly_.youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";
        assert!(check_cookie_jar(http_only.as_bytes()).is_ok());
    }

    #[test]
    fn cookie_jar_rejects_garbage() {
        assert!(check_cookie_jar(b"").is_err());
        assert!(check_cookie_jar(&[0xff, 0xfe, 0x00]).is_err());
        let json = r#"[{"name":"SID","value":"abc"}]"#;
        let err = check_cookie_jar(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Netscape"));
    }

    #[test]
    fn private_file_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        write_private_file(&path, JAR.as_bytes()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), JAR);
        assert!(write_private_file(&path, b"other").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn private_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        write_private_file(&path, JAR.as_bytes()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
