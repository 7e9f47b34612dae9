use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ptzcam_core::{join_with_timeout, JoinFailure};
use tracing::{debug, info, warn};

use crate::buffer::Publisher;
use crate::source::{FrameSource, SourceOpener, StreamError};

/// Wait between failed opens or reads.
pub const READ_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on how long a stop waits for the worker to release its stream.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Handle to a running ingestion worker thread.
///
/// Dropping the handle signals the worker but does not wait for it.
pub struct IngestionHandle {
    name: String,
    stop: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl IngestionHandle {
    /// Asks the worker to stop at its next loop iteration.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Signals the worker and waits up to `timeout` for it to release the
    /// stream. Idempotent; returns `true` once the worker has exited.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.signal_stop();
        let Some(handle) = self.join_handle.take() else {
            return true;
        };
        match join_with_timeout(handle, timeout) {
            Ok(()) => {
                debug!(camera = %self.name, "ingestion worker joined");
                true
            }
            Err(JoinFailure::Panicked) => {
                warn!(camera = %self.name, "ingestion worker panicked");
                true
            }
            Err(JoinFailure::TimedOut) => {
                warn!(camera = %self.name, "ingestion worker did not exit in time");
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for IngestionHandle {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

/// Spawns a worker that keeps `publisher` fed with frames from `url`.
///
/// Unreachable or refused streams never surface as errors: the worker keeps
/// retrying with [`READ_BACKOFF`] and the buffer simply stays empty.
pub fn start(
    name: impl Into<String>,
    url: String,
    publisher: Publisher,
    opener: Arc<dyn SourceOpener>,
) -> IngestionHandle {
    let name = name.into();
    let stop = Arc::new(AtomicBool::new(false));

    let worker_stop = Arc::clone(&stop);
    let worker_name = name.clone();
    let join_handle = std::thread::Builder::new()
        .name(format!("ingest-{}", name))
        .spawn(move || ingestion_loop(&worker_name, &url, &publisher, opener.as_ref(), &worker_stop));

    let join_handle = match join_handle {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(camera = %name, error = %e, "failed to spawn ingestion worker");
            None
        }
    };

    IngestionHandle {
        name,
        stop,
        join_handle,
    }
}

fn ingestion_loop(
    name: &str,
    url: &str,
    publisher: &Publisher,
    opener: &dyn SourceOpener,
    stop: &AtomicBool,
) {
    let mut source: Option<Box<dyn FrameSource>> = None;
    let mut sequence = 0usize;

    info!(camera = %name, "ingestion started");
    while !stop.load(Ordering::Acquire) {
        if source.is_none() {
            match opener.open(url) {
                Ok(opened) => source = Some(opened),
                Err(e) => {
                    debug!(camera = %name, error = %e, "stream open failed");
                    std::thread::sleep(READ_BACKOFF);
                    continue;
                }
            }
        }
        let Some(current) = source.as_mut() else {
            continue;
        };

        match current.read_frame() {
            Ok(mut frame) => {
                sequence += 1;
                frame.sequence = sequence;
                publisher.publish(frame);
            }
            Err(StreamError::Closed(reason)) => {
                debug!(camera = %name, reason = %reason, "stream closed, reopening");
                source = None;
                std::thread::sleep(READ_BACKOFF);
            }
            Err(e) => {
                debug!(camera = %name, error = %e, "frame read failed");
                std::thread::sleep(READ_BACKOFF);
            }
        }
    }

    // Releases the capture resource before the thread reports completion.
    drop(source);
    info!(camera = %name, frames = sequence, "ingestion stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::FrameBuffer;
    use bytes::Bytes;
    use ptzcam_core::Frame;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Instant, SystemTime};

    /// Source that yields a frame every few milliseconds, tagging each with
    /// the index of the open that produced it.
    pub(crate) struct CountingOpener {
        pub opens: AtomicUsize,
        pub releases: Arc<AtomicUsize>,
        pub refuse: bool,
    }

    impl CountingOpener {
        pub fn new(refuse: bool) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                releases: Arc::new(AtomicUsize::new(0)),
                refuse,
            }
        }
    }

    struct CountingSource {
        open_index: usize,
        releases: Arc<AtomicUsize>,
    }

    impl SourceOpener for CountingOpener {
        fn open(&self, _url: &str) -> Result<Box<dyn FrameSource>, StreamError> {
            if self.refuse {
                return Err(StreamError::Open("connection refused".to_string()));
            }
            let open_index = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Box::new(CountingSource {
                open_index,
                releases: Arc::clone(&self.releases),
            }))
        }
    }

    impl FrameSource for CountingSource {
        fn read_frame(&mut self) -> Result<Frame, StreamError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Frame {
                width: 2,
                height: 2,
                timestamp: SystemTime::now(),
                sequence: 0,
                data: Bytes::from(self.open_index.to_string()),
            })
        }
    }

    impl Drop for CountingSource {
        fn drop(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_worker_publishes_and_releases_once() {
        let opener = Arc::new(CountingOpener::new(false));
        let releases = Arc::clone(&opener.releases);
        let buffer = Arc::new(FrameBuffer::new());

        let mut handle = start("cam1", "rtsp://cam1".into(), buffer.publisher(), opener.clone());
        assert!(wait_for(|| buffer.len() == 2, Duration::from_secs(2)));
        assert!(buffer.len() <= 2);

        assert!(handle.stop(STOP_JOIN_TIMEOUT));
        assert!(!handle.is_running());
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        // Second stop is a no-op.
        assert!(handle.stop(STOP_JOIN_TIMEOUT));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refused_stream_only_leaves_buffer_empty() {
        let opener = Arc::new(CountingOpener::new(true));
        let buffer = Arc::new(FrameBuffer::new());

        let mut handle = start("cam2", "rtsp://cam2".into(), buffer.publisher(), opener);
        std::thread::sleep(Duration::from_millis(300));
        assert!(handle.is_running());
        assert!(buffer.is_empty());
        assert!(handle.stop(STOP_JOIN_TIMEOUT));
    }
}
