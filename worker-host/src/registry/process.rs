use std::{io, process::Stdio, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use super::{
    framing::{LineFramer, RecordTooLarge},
    Generation, LaunchCommand, LaunchParams, RawFailure, WorkerEvent, WorkerRegistry,
};

const READ_CHUNK: usize = 8 * 1024;

pub(super) struct SpawnedWorker {
    child: Child,
    pub(super) pid: Option<u32>,
    pub(super) stdin: Option<mpsc::UnboundedSender<String>>,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

pub(super) fn spawn(
    launcher: &LaunchCommand,
    params: &LaunchParams,
    with_stdin: bool,
) -> io::Result<SpawnedWorker> {
    let mut child = Command::new(&launcher.program)
        .args(&launcher.args)
        .args(params.to_args())
        .stdin(if with_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stderr not captured"))?;

    let stdin = child.stdin.take().map(|pipe| {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_input(pipe, rx));
        tx
    });

    Ok(SpawnedWorker {
        pid: child.id(),
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Feed queued records to the worker until the handle drops its sender.
async fn write_input(mut pipe: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(record) = rx.recv().await {
        if let Err(e) = pipe.write_all(record.as_bytes()).await {
            debug!(error = %e, "worker stdin write failed");
            return;
        }
        if let Err(e) = pipe.flush().await {
            debug!(error = %e, "worker stdin flush failed");
            return;
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    stream: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Pump one worker's output into registry events until it exits or is killed.
///
/// Per id, events keep the order the process produced them; `close` comes
/// after both pipes are drained.
pub(super) async fn supervise(
    registry: Arc<WorkerRegistry>,
    id: String,
    generation: Generation,
    worker: SpawnedWorker,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let SpawnedWorker {
        mut child,
        stdout,
        stderr,
        ..
    } = worker;
    let mut stdout = Some(stdout);
    let mut stderr = Some(stderr);
    let mut out_framer = LineFramer::new();
    let mut err_framer = LineFramer::new();
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut killed = false;

    while !killed && (stdout.is_some() || stderr.is_some()) {
        tokio::select! {
            // A dropped sender means the handle is gone as well.
            _ = &mut kill_rx => {
                killed = true;
            }
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) => stdout = None,
                Ok(n) => {
                    for framed in out_framer.push(&out_buf[..n]) {
                        let event = match framed {
                            Ok(record) => WorkerEvent::Data(record),
                            Err(e) => oversized(&id, "stdout", e),
                        };
                        registry.emit_from(&id, generation, event);
                    }
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "worker stdout read failed");
                    stdout = None;
                }
            },
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) => stderr = None,
                Ok(n) => {
                    for framed in err_framer.push(&err_buf[..n]) {
                        let event = match framed {
                            Ok(record) => WorkerEvent::Error(RawFailure::Stderr(record)),
                            Err(e) => oversized(&id, "stderr", e),
                        };
                        registry.emit_from(&id, generation, event);
                    }
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "worker stderr read failed");
                    stderr = None;
                }
            },
        }
    }

    if !killed {
        if let Some(partial) = out_framer.finish() {
            warn!(
                worker_id = %id,
                bytes = partial.len(),
                "discarding unterminated record at end of worker output"
            );
        }
        if let Some(rest) = err_framer.finish() {
            registry.emit_from(&id, generation, WorkerEvent::Error(RawFailure::Stderr(rest)));
        }
    }

    let status = if killed {
        kill_and_wait(&id, &mut child).await
    } else {
        tokio::select! {
            status = child.wait() => status,
            _ = &mut kill_rx => kill_and_wait(&id, &mut child).await,
        }
    };

    let code = match status {
        Ok(status) => {
            if !status.success() {
                registry.emit_from(
                    &id,
                    generation,
                    WorkerEvent::Error(RawFailure::Exit(status.code())),
                );
            }
            status.code()
        }
        Err(e) => {
            warn!(worker_id = %id, error = %e, "failed to wait for worker");
            None
        }
    };

    registry.finish(&id, generation, code);
}

fn oversized(id: &str, stream: &'static str, e: RecordTooLarge) -> WorkerEvent {
    warn!(worker_id = id, stream, limit = e.limit, "discarding oversized worker record");
    WorkerEvent::Error(RawFailure::RecordTooLarge { limit: e.limit })
}

async fn kill_and_wait(id: &str, child: &mut Child) -> io::Result<std::process::ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!(worker_id = id, error = %e, "worker already gone");
    }
    child.wait().await
}
