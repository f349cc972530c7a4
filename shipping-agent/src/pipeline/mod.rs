//! Shipment pipeline: one local process, one object, two workers.
//!
//! A shipment runs a supervisor task that drains the process's output queue
//! and collects its exit status, plus a pump task that moves the data
//! (stdout into a multipart upload, or an object into stdin). Both report
//! into a [`Completion`], which fires the caller's callback exactly once.

pub mod command;
pub mod completion;
pub mod download;
pub mod events;
pub mod upload;

pub use completion::Completion;
pub use events::DaemonEvent;
pub use upload::part_size_for;

use crate::store::BackupStore;
use crate::utils::errors::{Result, ShipError};
use events::{forward_lines, StreamKind, EVENT_QUEUE_CAPACITY};
use futures_util::future::join_all;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub compress_cmd: String,
    pub decompress_cmd: String,
    /// Pause after the restore stream is closed before reporting success.
    pub restore_settle: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            compress_cmd: "zstd".to_string(),
            decompress_cmd: "zstd -d".to_string(),
            restore_settle: Duration::from_millis(500),
        }
    }
}

struct DaemonInner {
    key: String,
    cancel: CancellationToken,
    completion: Completion,
    pgid: Option<i32>,
    stopped: AtomicBool,
}

impl DaemonInner {
    fn finish(&self, worker: &str, result: Result<()>) {
        let success = match result {
            Ok(()) => true,
            Err(e) => {
                error!("{} of {} failed: {}", worker, self.key, e);
                false
            }
        };
        if let Some(fired) = self.completion.report(success) {
            debug!("Shipment {} finished (success: {})", self.key, fired);
        }
        if !success {
            self.stop();
        }
    }

    /// Cancel both workers and terminate the process group. Returns false if
    /// the daemon was already stopped.
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        if let Some(pgid) = self.pgid {
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
                debug!("Process group {} of {} already gone: {}", pgid, self.key, e);
            }
        }
        true
    }
}

/// Running shipment of one volume.
pub struct ShipmentDaemon {
    inner: Arc<DaemonInner>,
    upload_id: Option<String>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShipmentDaemon {
    /// Start shipping the output of `command` to `key`.
    ///
    /// The multipart upload is created before the process is launched. On
    /// failure the upload is aborted before `on_finished(false)` runs.
    pub async fn start_send<F>(
        store: BackupStore,
        key: impl Into<String>,
        command: &str,
        expected_size: u64,
        options: &PipelineOptions,
        on_finished: F,
    ) -> Result<Self>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.into();
        let part_size = part_size_for(expected_size)?;
        let upload_id = store.init_multipart(&key).await?;

        let script = command::send_wrapper(command, &options.compress_cmd);
        let mut child = match command::spawn(&script, false) {
            Ok(child) => child,
            Err(e) => {
                let err = ShipError::Daemon(format!("failed to launch '{script}': {e}"));
                return Err(abort_after_launch_failure(&store, &key, &upload_id, err).await);
            }
        };
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let err = ShipError::Daemon(format!("output of '{script}' not captured"));
            return Err(abort_after_launch_failure(&store, &key, &upload_id, err).await);
        };

        let callback = abort_on_failure(
            Handle::current(),
            store.clone(),
            key.clone(),
            upload_id.clone(),
            on_finished,
        );
        let daemon = Self::new(key.clone(), Some(upload_id.clone()), child.id(), callback);
        info!("Started shipping {} (upload {})", key, upload_id);

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        daemon.track(tokio::spawn(forward_lines(stderr, StreamKind::Stderr, tx)));
        daemon.spawn_supervisor(child, rx, 1, exit_tx);
        daemon.spawn_worker("upload", async move {
            upload::pump_send(&store, &key, &upload_id, stdout, part_size, exit_rx).await
        });
        Ok(daemon)
    }

    /// Start restoring `key` into the stdin of `command`.
    pub async fn start_restore<F>(
        store: BackupStore,
        key: impl Into<String>,
        command: &str,
        options: &PipelineOptions,
        on_finished: F,
    ) -> Result<Self>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = key.into();
        let script = command::receive_wrapper(command, &options.decompress_cmd);
        let mut child = command::spawn(&script, true)
            .map_err(|e| ShipError::Daemon(format!("failed to launch '{script}': {e}")))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ShipError::Daemon(format!("stdio of '{script}' not captured")));
        };

        let daemon = Self::new(key.clone(), None, child.id(), on_finished);
        info!("Started restoring {}", key);

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (exit_tx, _) = watch::channel(None);
        daemon.track(tokio::spawn(forward_lines(stdout, StreamKind::Stdout, tx.clone())));
        daemon.track(tokio::spawn(forward_lines(stderr, StreamKind::Stderr, tx)));
        daemon.spawn_supervisor(child, rx, 2, exit_tx);
        let settle = options.restore_settle;
        daemon.spawn_worker("download", async move {
            download::pump_restore(&store, &key, stdin, settle).await
        });
        Ok(daemon)
    }

    fn new<F>(key: String, upload_id: Option<String>, pid: Option<u32>, on_finished: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        Self {
            inner: Arc::new(DaemonInner {
                key,
                cancel: CancellationToken::new(),
                completion: Completion::new(on_finished),
                pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
                stopped: AtomicBool::new(false),
            }),
            upload_id,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.completion.is_fired()
    }

    /// Stop the shipment. Safe to call repeatedly and from any task, including
    /// from inside the completion callback.
    pub fn shutdown(&self) {
        if self.inner.stop() {
            info!("Shutting down shipment {}", self.inner.key);
        }
        self.inner.completion.report(false);
    }

    /// Wait for both workers, aborting whatever is still running after
    /// `timeout`.
    pub async fn await_shutdown(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!(
                "Workers of {} did not finish within {:?}, aborting them",
                self.inner.key, timeout
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn spawn_worker<W>(&self, name: &'static str, work: W)
    where
        W: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.track(tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return,
                result = work => result,
            };
            inner.finish(name, result);
        }));
    }

    fn spawn_supervisor(
        &self,
        child: Child,
        rx: mpsc::Receiver<DaemonEvent>,
        expected_eofs: usize,
        exit_tx: watch::Sender<Option<i32>>,
    ) {
        let inner = self.inner.clone();
        self.track(tokio::spawn(supervise(inner, child, rx, expected_eofs, exit_tx)));
    }
}

impl Drop for ShipmentDaemon {
    fn drop(&mut self) {
        if !self.inner.completion.is_fired() {
            self.shutdown();
        }
    }
}

async fn supervise(
    inner: Arc<DaemonInner>,
    mut child: Child,
    mut rx: mpsc::Receiver<DaemonEvent>,
    expected_eofs: usize,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let mut eofs = 0;
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                debug!("Supervisor of {} cancelled", inner.key);
                return;
            }
            event = rx.recv() => event,
        };
        match event {
            Some(DaemonEvent::Stdout(line)) => trace!("{}: {}", inner.key, line),
            Some(DaemonEvent::Stderr(line)) => warn!("{}: {}", inner.key, line),
            Some(DaemonEvent::Exception(msg)) => {
                inner.finish("supervisor", Err(ShipError::Daemon(msg)));
                return;
            }
            Some(DaemonEvent::Eof) => {
                eofs += 1;
                if eofs >= expected_eofs {
                    break;
                }
            }
            None => break,
        }
    }

    let result = match child.wait().await {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            let _ = exit_tx.send(Some(code));
            if status.success() {
                Ok(())
            } else {
                Err(ShipError::Daemon(format!("command exited with status {code}")))
            }
        }
        Err(e) => {
            let _ = exit_tx.send(Some(-1));
            Err(e.into())
        }
    };
    inner.finish("command", result);
}

/// Wrap the caller's callback so a failed send aborts its multipart upload
/// first. The abort runs on `runtime` because the callback may fire from
/// [`ShipmentDaemon::shutdown`] on a thread outside the runtime.
fn abort_on_failure<F>(
    runtime: Handle,
    store: BackupStore,
    key: String,
    upload_id: String,
    on_finished: F,
) -> impl FnOnce(bool) + Send + 'static
where
    F: FnOnce(bool) + Send + 'static,
{
    move |success| {
        if success {
            on_finished(true);
            return;
        }
        runtime.spawn(async move {
            match store.abort_multipart(&key, &upload_id).await {
                Ok(()) => info!("Aborted upload {} of {}", upload_id, key),
                Err(e) => error!("Failed to abort upload {} of {}: {}", upload_id, key, e),
            }
            on_finished(false);
        });
    }
}

/// Drop the upload created for a send that never got going. The launch
/// error is what the caller sees, whatever the abort does.
async fn abort_after_launch_failure(
    store: &BackupStore,
    key: &str,
    upload_id: &str,
    launch_error: ShipError,
) -> ShipError {
    if let Err(e) = store.abort_multipart(key, upload_id).await {
        warn!("Failed to abort upload {} of {}: {}", upload_id, key, e);
    }
    launch_error
}
