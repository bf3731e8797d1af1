use std::path::{Path, PathBuf};

/// One file to upload, and the object key it is uploaded to.
///
/// The key is the name of the file's immediate parent directory joined to the file name with a
/// `/`, so `/data/A/B/file2.wav` becomes `B/file2.wav`.  A file with no named parent (a file at a
/// filesystem root) is uploaded under its bare file name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UploadTask {
    source_path: PathBuf,
    destination_key: String,
}

impl UploadTask {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        let source_path = source_path.into();
        let destination_key = destination_key_for(&source_path);

        Self {
            source_path,
            destination_key,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn destination_key(&self) -> &str {
        &self.destination_key
    }
}

fn destination_key_for(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();

    match path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy())
    {
        Some(parent) => format!("{parent}/{file_name}"),
        None => file_name.into_owned(),
    }
}
