use crate::Result;
use snafu::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

/// The configuration settings that control the behavior of an upload run.
///
/// With the `clap` feature enabled every setting can also be given on the command line.  The
/// connection string, source folder and run duration also fall back to their environment
/// variables.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Connection string for the storage sink.
    ///
    /// A `;`-separated list of `Key=Value` pairs.  Recognized keys are `Endpoint`, `Region`,
    /// `AccessKeyId`, `SecretAccessKey` and `SessionToken`, all optional.  Without an access key
    /// pair the default AWS credential chain is used.
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            env = "BLOB_STORAGE_CONNECTION_STRING",
            hide_env_values = true,
            value_name = "CONNECTION_STRING"
        )
    )]
    pub connection_string: Option<String>,

    /// Root folder which is searched (recursively) for files to upload.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "AUDIO_FILES_FOLDER_PATH", value_name = "PATH")
    )]
    pub source_folder: Option<PathBuf>,

    /// Maximum run duration in seconds.  When it elapses the run is cancelled just as if an
    /// upload had failed.  0 means no limit.
    #[cfg_attr(
        feature = "clap",
        clap(long, env = "SECONDS_TO_RUN", default_value = "0")
    )]
    pub seconds_to_run: u64,

    /// Name of the bucket the files are uploaded into.  It is created if it doesn't exist.
    #[cfg_attr(feature = "clap", clap(long, default_value = "audiofiles"))]
    pub container: String,

    /// Glob matched (case-insensitively) against each file name to decide if it is uploaded.
    #[cfg_attr(feature = "clap", clap(long, default_value = "*.wav"))]
    pub file_pattern: String,

    /// The maximum number of uploads in flight at the same time.
    #[cfg_attr(feature = "clap", clap(long, default_value = "5"))]
    pub max_concurrent_uploads: usize,

    /// The number of storage clients kept for reuse by the uploads.
    ///
    /// Effective concurrency is the smaller of this and `max_concurrent_uploads`.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10"))]
    pub client_pool_size: usize,

    /// The maximum number of files waiting in the queue between the folder scan and the uploads.
    #[cfg_attr(feature = "clap", clap(long, default_value = "100000"))]
    pub max_queue_size: usize,

    /// The maximum number of progress messages waiting to be written.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1024"))]
    pub log_queue_size: usize,

    /// How long, in milliseconds, queued progress messages are still written after the run ends.
    #[cfg_attr(feature = "clap", clap(long, default_value = "500"))]
    pub log_drain_timeout_ms: u64,

    /// Log a progress line every time this many files have been queued.
    #[cfg_attr(feature = "clap", clap(long, default_value = "100"))]
    pub progress_interval: usize,

    /// Pause a random 100-1000 ms every `progress_interval` files, to simulate a bursty source.
    #[cfg_attr(feature = "clap", clap(long))]
    pub simulate_delay: bool,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: duplicated in the `clap` attributes above; `defaults_match` keeps them honest
        Self {
            connection_string: None,
            source_folder: None,
            seconds_to_run: 0,
            container: "audiofiles".to_string(),
            file_pattern: "*.wav".to_string(),
            max_concurrent_uploads: 5,
            client_pool_size: 10,
            max_queue_size: 100_000,
            log_queue_size: 1024,
            log_drain_timeout_ms: 500,
            progress_interval: 100,
            simulate_delay: false,
        }
    }
}

impl Config {
    /// Check the settings that can be checked without touching the filesystem or the network.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.connection_string
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty()),
            crate::error::MissingConnectionStringSnafu
        );
        ensure!(
            self.source_folder
                .as_deref()
                .is_some_and(|p| !p.as_os_str().is_empty()),
            crate::error::MissingSourceFolderSnafu
        );

        for (setting, value) in [
            ("max_concurrent_uploads", self.max_concurrent_uploads),
            ("client_pool_size", self.client_pool_size),
            ("max_queue_size", self.max_queue_size),
            ("log_queue_size", self.log_queue_size),
            ("progress_interval", self.progress_interval),
        ] {
            ensure!(
                value > 0,
                crate::error::InvalidSettingSnafu {
                    setting,
                    reason: "must be at least 1"
                }
            );
        }

        ensure!(
            !self.container.trim().is_empty(),
            crate::error::InvalidSettingSnafu {
                setting: "container",
                reason: "must not be empty"
            }
        );

        glob::Pattern::new(&self.file_pattern).with_context(|_| {
            crate::error::InvalidGlobPatternSnafu {
                pattern: self.file_pattern.clone(),
            }
        })?;

        Ok(())
    }

    /// The run deadline, if one is configured
    pub fn max_run_duration(&self) -> Option<Duration> {
        (self.seconds_to_run > 0).then(|| Duration::from_secs(self.seconds_to_run))
    }

    pub fn log_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.log_drain_timeout_ms)
    }
}
