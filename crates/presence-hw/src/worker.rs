//! Dedicated capture thread that owns a blocking frame source.
//!
//! Frame requests arrive over a channel and are answered on a oneshot, so a
//! caller that stops waiting leaves nothing behind: the thread keeps sole
//! ownership of the device, and [`CaptureWorker::shutdown`] joins it.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

pub(crate) type FrameReply = oneshot::Sender<Result<Frame, CameraError>>;

/// Handle to a running capture thread. Dropping it shuts the thread down.
pub(crate) struct CaptureWorker {
    requests: Option<mpsc::Sender<FrameReply>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    /// Start `body` on a named thread. The body receives the stop flag and
    /// the request queue and is expected to [`serve`] until either ends.
    pub(crate) fn spawn<B>(name: &str, body: B) -> Result<Self, CameraError>
    where
        B: FnOnce(Arc<AtomicBool>, mpsc::Receiver<FrameReply>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag, rx))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to start capture thread: {e}")))?;

        Ok(Self {
            requests: Some(tx),
            stop,
            thread: Some(thread),
        })
    }

    /// Queue a frame request.
    pub(crate) fn request(&self) -> Result<oneshot::Receiver<Result<Frame, CameraError>>, CameraError> {
        let requests = self.requests.as_ref().ok_or(CameraError::StreamStopped)?;
        let (reply, receiver) = oneshot::channel();
        requests.send(reply).map_err(|_| CameraError::StreamStopped)?;
        Ok(receiver)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and join it. Blocks for at most one poll of the
    /// frame source. Calling it twice is a no-op.
    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Answer requests with frames from `poll` until the queue closes.
///
/// `poll` returns `Ok(None)` when no frame arrived within its own timeout;
/// the request then stays pending and the stop flag is checked again.
/// Requests still queued once `stop` is set fail with
/// [`CameraError::StreamStopped`].
pub(crate) fn serve<F>(mut poll: F, stop: &AtomicBool, requests: mpsc::Receiver<FrameReply>)
where
    F: FnMut() -> Result<Option<Frame>, CameraError>,
{
    while let Ok(reply) = requests.recv() {
        let result = loop {
            if stop.load(Ordering::Acquire) {
                break Err(CameraError::StreamStopped);
            }
            match poll() {
                Ok(Some(frame)) => break Ok(frame),
                Ok(None) => continue,
                Err(e) => break Err(e),
            }
        };
        // The requester may have given up waiting.
        let _ = reply.send(result);
    }
}
