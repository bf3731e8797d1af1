//! Logging in tests is important for troubleshooting, but works very differently then in
//! production.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Default filter when `RUST_LOG` isn't set.  The AWS SDK and its HTTP stack are very chatty at
/// `debug`, and the in-memory storage used by most tests doesn't touch them anyway.
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,rustls=info,aws=info,bulkload=debug,info";

/// Buffers every log event of one test, so they can be printed together once it ends
#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Take everything captured so far.  Invalid UTF-8 is replaced rather than panicking, since
    /// this runs while a test may already be unwinding.
    fn drain(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(logs: CapturedLogs) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        // Uploads run on many runtime threads at once
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(logs);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Run a test with logging enabled.
///
/// This takes the place of `tokio::test`.  It makes a dedicated multi-threaded tokio runtime for
/// the test, and a `tracing` dispatcher which is installed as the default on the calling thread
/// and on every runtime worker and blocking thread.  So events from the pipeline's workers and
/// from its producer (which runs on a blocking thread) are all captured, and only this test's
/// events are.
///
/// The captured log is printed when the test finishes, whether it passed, failed or panicked, so
/// the output of each test isn't interleaved with that of other tests running in parallel.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let logs = CapturedLogs::default();
    let dispatch = make_dispatch(logs.clone());

    std::thread_local! {
        static THREAD_DISPATCH: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
    }

    let result = tracing::dispatcher::with_default(&dispatch, || {
        let runtime = {
            let start_dispatch = dispatch.clone();

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .on_thread_start(move || {
                    let guard = tracing::dispatcher::set_default(&start_dispatch);
                    THREAD_DISPATCH.with(|cell| cell.replace(Some(guard)));
                })
                .on_thread_stop(|| {
                    THREAD_DISPATCH.with(|cell| cell.replace(None));
                })
                .build()?
        };

        // Neither the runtime nor an arbitrary test future is declared unwind safe, but the
        // panic is re-raised below and neither is used again
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        Ok::<_, color_eyre::Report>(outcome)
    })?;

    println!("Log events from this test: \n{}", logs.drain());

    match result {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
