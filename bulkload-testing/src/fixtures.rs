//! Temporary source folders for upload tests.
use crate::Result;
use bulkload::Config;
use rand::RngCore;
use std::path::{Path, PathBuf};

/// A connection string which parses, for configs whose storage is replaced by
/// [`crate::memory::MemoryStorage`]
pub const DUMMY_CONNECTION_STRING: &str =
    "Endpoint=http://127.0.0.1:1;Region=us-east-1;AccessKeyId=test;SecretAccessKey=test";

/// A folder of files to upload, deleted when dropped
pub struct SourceTree {
    dir: tempfile::TempDir,
}

impl SourceTree {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    /// Make a tree with one file of `len` random bytes at each of `relative_paths`
    pub fn with_files(relative_paths: &[&str], len: usize) -> Result<Self> {
        let tree = Self::new()?;

        for path in relative_paths {
            tree.add_file(path, len)?;
        }

        Ok(tree)
    }

    /// Make a tree of `count` small `.wav` files spread evenly over `dirs` sub-folders
    pub fn with_many_files(count: usize, dirs: usize) -> Result<Self> {
        let tree = Self::new()?;
        let dirs = dirs.max(1);

        for dir in 0..dirs {
            std::fs::create_dir_all(tree.path().join(format!("dir{dir:04}")))?;
        }

        for i in 0..count {
            let path = tree
                .path()
                .join(format!("dir{:04}", i % dirs))
                .join(format!("file{i:06}.wav"));
            std::fs::write(path, [0u8])?;
        }

        Ok(tree)
    }

    /// Write a file of `len` random bytes, creating its parent folders as needed.  Returns the
    /// absolute path.
    pub fn add_file(&self, relative_path: &str, len: usize) -> Result<PathBuf> {
        let path = self.path().join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        std::fs::write(&path, data)?;

        Ok(path)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A valid config which uploads this tree.  The connection string is a placeholder, so the
    /// job's storage has to be replaced.
    pub fn config(&self) -> Config {
        Config {
            connection_string: Some(DUMMY_CONNECTION_STRING.to_string()),
            source_folder: Some(self.path().to_path_buf()),
            ..Default::default()
        }
    }
}
