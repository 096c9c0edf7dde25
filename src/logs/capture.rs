use super::{LogBroadcaster, LogStream};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Reader tasks for one child process.
///
/// Readers end on their own at EOF. [`shutdown`](Self::shutdown) stops them
/// early; dropping the handle does the same.
pub struct CaptureHandle {
    shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signal readers to stop and abort any that are still running.
    pub fn shutdown(&mut self) {
        self.shutdown.notify_waiters();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Wait for readers to reach EOF.
    pub async fn finished(&mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Feed a child's stdout and stderr into `logs` under `service`.
pub fn spawn_capture(
    logs: Arc<LogBroadcaster>,
    service: &str,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> CaptureHandle {
    let shutdown = Arc::new(Notify::new());
    let mut tasks = Vec::with_capacity(2);
    if let Some(out) = stdout {
        tasks.push(spawn_reader(
            logs.clone(),
            service.to_string(),
            LogStream::Stdout,
            out,
            shutdown.clone(),
        ));
    }
    if let Some(err) = stderr {
        tasks.push(spawn_reader(
            logs,
            service.to_string(),
            LogStream::Stderr,
            err,
            shutdown.clone(),
        ));
    }
    CaptureHandle { shutdown, tasks }
}

/// Spawn a line reader over any async source.
pub fn spawn_reader<R>(
    logs: Arc<LogBroadcaster>,
    service: String,
    stream: LogStream,
    source: R,
    shutdown: Arc<Notify>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let span = tracing::debug_span!("log_reader", service.name = %service, %stream);
    tokio::spawn(
        async move {
            let mut lines = BufReader::new(source).lines();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => logs.publish(&service, stream, line).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::debug!(error = %e, "Log reader stopped on read error");
                            break;
                        }
                    }
                }
            }
        }
        .instrument(span),
    )
}
