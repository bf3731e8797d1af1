//! Progress bar rendering for upload runs
use bulkload::{BulkLoadError, CancelReason, UploadSummary};
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::{borrow::Cow, future::Future, path::Path, sync::Arc, time::Duration};

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .expect("BUG: invalid spinner template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Prepare and run the upload job described by `config`, with a progress bar for extra
/// pretty-ness.
///
/// Ctrl-C cancels the run.  Uploads in flight are abandoned and the summary is still produced.
pub(crate) async fn run_upload_job(
    globals: &super::Globals,
    config: bulkload::Config,
) -> color_eyre::Result<UploadSummary> {
    let progress = UploadProgressReport::new(hide_progress(globals));

    let mut builder = bulkload::UploadJobBuilder::new(config);
    if globals.quiet {
        builder = builder.with_log_collector(Arc::new(FailureLines::new(std::io::stderr())));
    } else if !globals.verbose {
        // In verbose mode the lines go to the log instead, with everything else
        builder = builder.with_log_collector(Arc::new(progress.clone()));
    }

    let job = with_spinner(globals, "Preparing upload", builder.build()).await?;
    progress.println(format!(
        "Uploading '{}' to container '{}'",
        job.source_root().display(),
        job.container()
    ));

    let abort = {
        let progress = progress.clone();

        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => progress.println("Cancelling upload"),
                Err(e) => {
                    tracing::warn!(error = %e, "Unable to listen for Ctrl-C; the run can't be interrupted");
                    std::future::pending::<()>().await
                }
            }
        }
    };

    let summary = job.run(abort, progress.clone()).await?;
    progress.finish(&summary);

    Ok(summary)
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// The collector for quiet mode.  Progress lines are dropped, but lines reporting a failed upload
/// or listing are written to `out`, since they're the only place the cause of the failure is
/// shown.
struct FailureLines<W> {
    out: Mutex<W>,
}

impl<W> FailureLines<W> {
    fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send + 'static> bulkload::LogCollector for FailureLines<W> {
    fn write(&self, message: &str) {
        if message.starts_with("Failed ") {
            let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);

            // Nowhere left to report it if stderr itself is broken
            let _ = writeln!(out, "{message}");
        }
    }
}

/// Receives progress updates from the lib crate and renders them as a single bar counting files.
///
/// The bar's length grows as files are found, so it only shows a stable total once the source
/// folder has been completely listed.
#[derive(Clone)]
struct UploadProgressReport {
    files: indicatif::ProgressBar,
}

impl UploadProgressReport {
    fn new(hide_progress: bool) -> Self {
        let files = if !hide_progress {
            indicatif::ProgressBar::new(0)
        } else {
            indicatif::ProgressBar::hidden()
        };

        files.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {msg:<40!} [{bar:30.cyan/blue}] {pos}/{len} files ({per_sec}, {elapsed})",
            )
            .expect("BUG: invalid progress bar template")
            .progress_chars("#>-"),
        );
        files.set_message("Listing files...");

        Self { files }
    }

    /// Print a line above the bar.  A hidden bar swallows `println`, so print directly in that
    /// case.
    fn println(&self, message: impl AsRef<str>) {
        if self.files.is_hidden() {
            println!("{}", message.as_ref());
        } else {
            self.files.println(message);
        }
    }

    fn finish(&self, summary: &UploadSummary) {
        let bytes = indicatif::BinaryBytes(summary.bytes_uploaded);
        let duration = indicatif::HumanDuration(summary.elapsed);

        if summary.cancel_reason.is_some() {
            self.files
                .abandon_with_message(format!("Stopped after {bytes} in {duration}"));
        } else {
            self.files
                .finish_with_message(format!("Done ({bytes} in {duration})"));
        }
    }
}

impl bulkload::LogCollector for UploadProgressReport {
    fn write(&self, message: &str) {
        self.println(message);
    }
}

#[allow(unused_variables)] // so we can keep the unused progress methods with their comments
impl bulkload::UploadProgressCallback for UploadProgressReport {
    fn task_enumerated(&self, source_path: &Path, destination_key: &str) {
        self.files.inc_length(1);
    }

    fn enumeration_finished(&self, total: u64) {
        // Should already be right from `task_enumerated`, but this is the authoritative count
        self.files.set_length(total);
    }

    fn upload_started(&self, source_path: &Path, destination_key: &str) {
        self.files.set_message(destination_key.to_string());
    }

    fn upload_completed(&self, source_path: &Path, destination_key: &str, bytes: u64) {
        self.files.inc(1);
    }

    fn upload_failed(&self, source_path: &Path, destination_key: &str, error: &BulkLoadError) {
        // The failure is reported in detail by the log sink
        self.files.set_message(format!("Failed: {destination_key}"));
    }

    fn upload_aborted(&self, source_path: &Path, destination_key: &str) {
        // Nothing to report; the cancellation itself is reported once
    }

    fn cancelled(&self, reason: &CancelReason) {
        self.files.set_message(format!("Cancelling ({reason})"));
    }
}
