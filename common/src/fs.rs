//! Filesystem access behind a small trait so policy, key, and certificate
//! I/O can run against an in-memory backend in tests.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::error::AuthError;

/// Metadata subset the verify path cares about.
#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    /// Unix permission bits (low 12 bits of `st_mode`).
    pub mode: u32,
    pub uid: u32,
    pub is_symlink: bool,
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>, AuthError>;
    fn write(&self, path: &Path, data: &[u8]) -> Result<(), AuthError>;
    /// Write with mode 0600, creating parent directories as needed.
    fn write_private(&self, path: &Path, data: &[u8]) -> Result<(), AuthError>;
    fn append(&self, path: &Path, data: &[u8]) -> Result<(), AuthError>;
    /// Metadata of the path itself; symlinks are reported, not followed.
    fn metadata(&self, path: &Path) -> Result<FileMeta, AuthError>;
    fn exists(&self, path: &Path) -> bool;
}

/// The real filesystem.
pub struct RealFs;

impl FileSystem for RealFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>, AuthError> {
        std::fs::read(path).map_err(AuthError::io)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(AuthError::io)?;
        }
        std::fs::write(path, data).map_err(AuthError::io)
    }

    fn write_private(&self, path: &Path, data: &[u8]) -> Result<(), AuthError> {
        use std::os::unix::fs::OpenOptionsExt;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(AuthError::io)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(AuthError::io)?;
        file.write_all(data).map_err(AuthError::io)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<(), AuthError> {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(AuthError::io)?;
        file.write_all(data).map_err(AuthError::io)
    }

    fn metadata(&self, path: &Path) -> Result<FileMeta, AuthError> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::symlink_metadata(path).map_err(AuthError::io)?;
        Ok(FileMeta {
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            is_symlink: meta.file_type().is_symlink(),
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    mode: u32,
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, MemFile>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file with an explicit mode.
    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>, mode: u32) {
        self.files.lock().expect("memfs lock").insert(
            path.into(),
            MemFile {
                data: data.into(),
                mode,
            },
        );
    }
}

impl FileSystem for MemFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>, AuthError> {
        self.files
            .lock()
            .expect("memfs lock")
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| AuthError::Io(format!("{}: no such file", path.display())))
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<(), AuthError> {
        self.insert(path, data, 0o644);
        Ok(())
    }

    fn write_private(&self, path: &Path, data: &[u8]) -> Result<(), AuthError> {
        self.insert(path, data, 0o600);
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<(), AuthError> {
        let mut files = self.files.lock().expect("memfs lock");
        files
            .entry(path.to_path_buf())
            .or_insert_with(|| MemFile {
                data: Vec::new(),
                mode: 0o644,
            })
            .data
            .extend_from_slice(data);
        Ok(())
    }

    fn metadata(&self, path: &Path) -> Result<FileMeta, AuthError> {
        self.files
            .lock()
            .expect("memfs lock")
            .get(path)
            .map(|f| FileMeta {
                mode: f.mode,
                uid: 0,
                is_symlink: false,
            })
            .ok_or_else(|| AuthError::Io(format!("{}: no such file", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("memfs lock").contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfs_roundtrip() {
        let fs = MemFs::new();
        let path = Path::new("/etc/opk/auth_id");
        assert!(!fs.exists(path));

        fs.write(path, b"alice sub u https://op.test/\n").unwrap();
        assert!(fs.exists(path));
        fs.append(path, b"bob sub v https://op.test/\n").unwrap();

        let data = fs.read(path).unwrap();
        assert_eq!(data.split(|b| *b == b'\n').count(), 3, "two rows + trailing");
    }

    #[test]
    fn test_memfs_private_mode() {
        let fs = MemFs::new();
        let path = Path::new("/home/alice/.ssh/id_ed25519");
        fs.write_private(path, b"key").unwrap();
        assert_eq!(fs.metadata(path).unwrap().mode, 0o600);
    }

    #[test]
    fn test_memfs_missing_file_is_io_error() {
        let fs = MemFs::new();
        let err = fs.read(Path::new("/nope")).unwrap_err();
        assert_eq!(err.code(), "io-error");
    }
}
