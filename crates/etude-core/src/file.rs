// src/file.rs
//! Read-only file mappings for zero-copy responses.

use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use crate::http::Status;

/// A read-only mapping of a served file. Unmapped on drop.
pub struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len()).finish()
    }
}

#[derive(Debug)]
pub enum Served {
    Mapped(MappedFile),
    /// Zero-length file; nothing to map.
    Empty,
}

/// Stat and map `path`, translating failures into the status to send.
///
/// Missing paths are 404, files without the world-read bit are 403,
/// directories are 400.
pub fn map_file(path: &Path) -> Result<Served, Status> {
    let meta = fs::metadata(path).map_err(|_| Status::NotFound)?;

    if meta.permissions().mode() & libc::S_IROTH == 0 {
        return Err(Status::Forbidden);
    }
    if meta.is_dir() {
        return Err(Status::BadRequest);
    }
    if meta.len() == 0 {
        return Ok(Served::Empty);
    }

    let file = File::open(path).map_err(|_| Status::Forbidden)?;
    // The mapping is private and read-only; a concurrent truncate by another
    // process is outside what the server guards against.
    let map = unsafe { Mmap::map(&file) }.map_err(|e| {
        warn!(path = %path.display(), error = %e, "mmap failed");
        Status::InternalError
    })?;
    Ok(Served::Mapped(MappedFile { map }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn maps_readable_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        fs::write(&path, b"<h1>hi</h1>").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        match map_file(&path).unwrap() {
            Served::Mapped(file) => assert_eq!(file.as_bytes(), b"<h1>hi</h1>"),
            Served::Empty => panic!("expected a mapping"),
        }
    }

    #[test]
    fn classifies_failures() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(map_file(&dir.path().join("missing")).unwrap_err(), Status::NotFound);

        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(map_file(&sub).unwrap_err(), Status::BadRequest);

        let private = dir.path().join("private.html");
        fs::write(&private, b"secret").unwrap();
        fs::set_permissions(&private, fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(map_file(&private).unwrap_err(), Status::Forbidden);

        let empty = dir.path().join("empty.html");
        fs::write(&empty, b"").unwrap();
        fs::set_permissions(&empty, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(map_file(&empty).unwrap(), Served::Empty));
    }
}
