//! Listing of the files under the source folder which should be uploaded.
use crate::Result;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recursively lists the regular files under a root folder whose names match a glob.
///
/// Matching is against the file name only, case-insensitively, so the default `*.wav` also picks
/// up `FOO.WAV`.  Each directory's entries are visited in file name order, so two listings of an
/// unchanged tree produce the same sequence.
#[derive(Clone, Debug)]
pub struct FileEnumerator {
    root: PathBuf,
    pattern: glob::Pattern,
}

impl FileEnumerator {
    /// Resolve `root` to an absolute path and compile `pattern`.
    ///
    /// Fails if `root` doesn't exist or isn't a directory.
    pub fn new(root: impl AsRef<Path>, pattern: &str) -> Result<Self> {
        let root = root.as_ref();
        let canonical = std::fs::canonicalize(root)
            .and_then(|canonical| {
                if canonical.is_dir() {
                    Ok(canonical)
                } else {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a directory",
                    ))
                }
            })
            .with_context(|_| crate::error::SourceFolderNotFoundSnafu {
                path: root.to_path_buf(),
            })?;

        let pattern = glob::Pattern::new(pattern).with_context(|_| {
            crate::error::InvalidGlobPatternSnafu {
                pattern: pattern.to_string(),
            }
        })?;

        Ok(Self {
            root: canonical,
            pattern,
        })
    }

    /// The absolute path of the root folder
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start the listing.
    ///
    /// The listing is lazy: the filesystem is only read as the iterator is advanced.  An error
    /// reading any directory is yielded in place of the files it would have produced.
    pub fn files(self) -> impl Iterator<Item = Result<PathBuf>> + Send + 'static {
        let Self { root, pattern } = self;
        let options = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            ..Default::default()
        };

        WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    let wanted = entry.file_type().is_file()
                        && pattern.matches_with(&entry.file_name().to_string_lossy(), options);

                    wanted.then(|| Ok(entry.into_path()))
                }
                Err(source) => Some(Err(source).context(
                    crate::error::ListSourceFolderSnafu { root: root.clone() },
                )),
            })
    }
}
