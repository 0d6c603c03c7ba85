#![forbid(unsafe_code)]

//! Request-scoped scratch space. Every request gets its own randomly named
//! directory; the cookie jar and the media output both live inside it, so
//! removing the directory releases everything the request wrote.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

use crate::security::write_private_file;

const SCRATCH_PREFIX: &str = "tubegrab-";
const COOKIES_FILE: &str = "cookies.txt";
const OUTPUT_STEM: &str = "media";

#[derive(Debug)]
pub struct Scratch {
    dir: TempDir,
    cookies: Option<PathBuf>,
}

impl Scratch {
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)
            .with_context(|| format!("creating scratch directory in {}", root.display()))?;
        Ok(Self { dir, cookies: None })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Persists an uploaded cookie jar with owner-only permissions.
    pub fn write_cookies(&mut self, raw: &[u8]) -> Result<&Path> {
        let path = self.dir.path().join(COOKIES_FILE);
        write_private_file(&path, raw)?;
        Ok(self.cookies.insert(path).as_path())
    }

    pub fn cookies(&self) -> Option<&Path> {
        self.cookies.as_deref()
    }

    /// Output template handed to the tool; it fills in the extension.
    pub fn output_template(&self) -> String {
        self.dir
            .path()
            .join(format!("{OUTPUT_STEM}.%(ext)s"))
            .to_string_lossy()
            .into_owned()
    }

    /// Removes the directory now. Failures are logged, never returned:
    /// cleanup must not turn a finished request into a failed one.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => tracing::debug!(path = %path.display(), "scratch removed"),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not remove scratch")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(root: &Path) -> usize {
        fs::read_dir(root).unwrap().count()
    }

    #[test]
    fn scratch_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = Scratch::create(root.path()).unwrap();
        let b = Scratch::create(root.path()).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(
            a.path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(SCRATCH_PREFIX)
        );
    }

    #[test]
    fn close_removes_cookies_and_media() {
        let root = tempfile::tempdir().unwrap();
        let mut scratch = Scratch::create(root.path()).unwrap();
        let cookies = scratch.write_cookies(b"jar").unwrap().to_path_buf();
        fs::write(scratch.path().join("media.mp4"), b"bytes").unwrap();
        assert!(cookies.exists());

        scratch.close();
        assert!(!cookies.exists());
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn drop_also_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        {
            let mut scratch = Scratch::create(root.path()).unwrap();
            scratch.write_cookies(b"jar").unwrap();
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn creates_missing_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("nested").join("scratch");
        let scratch = Scratch::create(&root).unwrap();
        assert!(scratch.path().starts_with(&root));
    }

    #[test]
    fn output_template_stays_inside_scratch() {
        let root = tempfile::tempdir().unwrap();
        let scratch = Scratch::create(root.path()).unwrap();
        let template = scratch.output_template();
        assert!(template.starts_with(&*scratch.path().to_string_lossy()));
        assert!(template.ends_with("media.%(ext)s"));
        assert!(scratch.cookies().is_none());
    }
}
