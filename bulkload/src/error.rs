use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = BulkLoadError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BulkLoadError {
    #[snafu(display("The storage connection string is required but was not provided (set BLOB_STORAGE_CONNECTION_STRING)"))]
    MissingConnectionString,

    #[snafu(display("The connection string segment '{segment}' is not of the form Key=Value"))]
    MalformedConnectionString { segment: String },

    #[snafu(display("The connection string key '{key}' is not recognized"))]
    UnknownConnectionStringKey { key: String },

    #[snafu(display("The connection string key '{key}' appears more than once"))]
    DuplicateConnectionStringKey { key: String },

    #[snafu(display(
        "The connection string must specify both AccessKeyId and SecretAccessKey, or neither"
    ))]
    IncompleteConnectionStringCredentials,

    #[snafu(display("The connection string endpoint '{endpoint}' is not a valid URL"))]
    InvalidEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    #[snafu(display("The endpoint URL '{url}' must use the http or https scheme"))]
    UnsupportedEndpointScheme { url: Url },

    #[snafu(display("The source folder is required but was not provided (set AUDIO_FILES_FOLDER_PATH)"))]
    MissingSourceFolder,

    #[snafu(display("The source folder '{}' does not exist or is not a directory", path.display()))]
    SourceFolderNotFound {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("The file pattern '{pattern}' is invalid"))]
    InvalidGlobPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[snafu(display("Invalid setting '{setting}': {reason}"))]
    InvalidSetting {
        setting: &'static str,
        reason: String,
    },

    #[snafu(display("Error listing files under '{}'", root.display()))]
    ListSourceFolder {
        root: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Error opening source file '{}'", path.display()))]
    OpenSourceFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error reading source file '{}'", path.display()))]
    ReadSourceFile {
        path: PathBuf,
        source: aws_smithy_types::byte_stream::error::Error,
    },

    #[snafu(display("Error checking whether S3 bucket '{bucket}' exists"))]
    HeadBucket {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::head_bucket::HeadBucketError,
        >,
    },

    #[snafu(display("Error creating S3 bucket '{bucket}'"))]
    CreateBucket {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_bucket::CreateBucketError,
        >,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("Upload of '{key}' was rejected: {message}"))]
    UploadRejected { key: String, message: String },

    #[snafu(display("The operation was aborted because the upload run is being cancelled"))]
    Aborted,

    #[snafu(display("The upload task channel was closed while the producer was still sending"))]
    ChannelClosed,

    #[snafu(display("Error spawning async task"))]
    Spawn { source: tokio::task::JoinError },

    #[snafu(display("Error spawning blocking task"))]
    SpawnBlocking { source: tokio::task::JoinError },
}

/// The broad category of a [`BulkLoadError`], used to decide how a failure is escalated and what
/// exit code it produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid configuration, detected before anything starts
    Configuration,

    /// The source folder couldn't be listed
    Enumeration,

    /// One upload failed, or the sink couldn't be prepared
    Transfer,

    /// Interrupted by cancellation.  Not a real failure.
    Aborted,

    /// Something went wrong in the task machinery itself
    Internal,
}

impl BulkLoadError {
    /// Build the error a storage client reports when the remote side refuses an upload for a
    /// reason that has no richer error type.
    pub fn upload_rejected(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UploadRejected {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingConnectionString
            | Self::MalformedConnectionString { .. }
            | Self::UnknownConnectionStringKey { .. }
            | Self::DuplicateConnectionStringKey { .. }
            | Self::IncompleteConnectionStringCredentials
            | Self::InvalidEndpoint { .. }
            | Self::UnsupportedEndpointScheme { .. }
            | Self::MissingSourceFolder
            | Self::SourceFolderNotFound { .. }
            | Self::InvalidGlobPattern { .. }
            | Self::InvalidSetting { .. } => ErrorKind::Configuration,

            Self::ListSourceFolder { .. } => ErrorKind::Enumeration,

            Self::OpenSourceFile { .. }
            | Self::ReadSourceFile { .. }
            | Self::HeadBucket { .. }
            | Self::CreateBucket { .. }
            | Self::PutObject { .. }
            | Self::UploadRejected { .. } => ErrorKind::Transfer,

            Self::Aborted => ErrorKind::Aborted,

            Self::ChannelClosed | Self::Spawn { .. } | Self::SpawnBlocking { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// `true` if this is the benign outcome of an operation interrupted by cancellation
    pub fn is_aborted(&self) -> bool {
        self.kind() == ErrorKind::Aborted
    }
}

/// Render an error followed by each of its sources, on one line.
///
/// SDK errors in particular keep the useful detail in their sources, and operator-facing log
/// lines have no other way to show it.
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}
