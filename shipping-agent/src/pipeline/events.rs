//! Output of the wrapped process, funnelled into the supervisor queue.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Bounded so a chatty process is throttled by the supervisor.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    Stdout(String),
    Stderr(String),
    /// Reading one of the process streams failed.
    Exception(String),
    /// One of the process streams reached end of file.
    Eof,
}

#[derive(Debug, Clone, Copy)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Forward every line of `stream` into the queue, ending with [`DaemonEvent::Eof`].
pub async fn forward_lines<R>(stream: R, kind: StreamKind, tx: mpsc::Sender<DaemonEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let event = match line {
            Ok(line) => match kind {
                StreamKind::Stdout => DaemonEvent::Stdout(line),
                StreamKind::Stderr => DaemonEvent::Stderr(line),
            },
            Err(e) => DaemonEvent::Exception(format!("reading {kind:?}: {e}")),
        };
        let is_error = matches!(event, DaemonEvent::Exception(_));
        if tx.send(event).await.is_err() || is_error {
            break;
        }
    }
    let _ = tx.send(DaemonEvent::Eof).await;
}
