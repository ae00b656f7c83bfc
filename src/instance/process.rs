use std::{io, path::Path, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    process::{self, Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{error::ServerError, log::LogSource};

use super::{InstanceId, ResolvedLaunch};

/// Output still buffered in the pipes is read for at most this long after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages a running process reports to the supervisor loop.
#[derive(Debug)]
pub(crate) enum ProcessMessage {
    Line {
        id: InstanceId,
        generation: u64,
        source: LogSource,
        text: String,
    },
    Exited {
        id: InstanceId,
        generation: u64,
        code: Option<i32>,
    },
}

pub(crate) type StdinRequest = (String, oneshot::Sender<io::Result<()>>);

/// Supervisor-side handles of a spawned process. The `Child` itself lives in the pump task.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pub pid: Option<u32>,
    pub stdin_tx: mpsc::Sender<StdinRequest>,
    pub kill: CancellationToken,
}

fn build_command(launch: &ResolvedLaunch, working_dir: &Path) -> process::Command {
    let mut command = process::Command::new(&launch.program);
    command
        .args(&launch.args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Spawns the process and its pump tasks.
pub(crate) fn spawn(
    id: InstanceId,
    generation: u64,
    launch: &ResolvedLaunch,
    working_dir: &Path,
    events: mpsc::UnboundedSender<ProcessMessage>,
) -> Result<ProcessHandle, ServerError> {
    let mut child = build_command(launch, working_dir)
        .spawn()
        .map_err(ServerError::SpawnFailed)?;

    let stdout = child.stdout.take().ok_or(ServerError::NoStdoutPipe)?;
    let stderr = child.stderr.take().ok_or(ServerError::NoStderrPipe)?;
    let stdin = child.stdin.take().ok_or(ServerError::NoStdinPipe)?;
    let pid = child.id();

    let kill = CancellationToken::new();
    let closed = CancellationToken::new();
    let (stdin_tx, stdin_rx) = mpsc::channel(64);

    tokio::spawn(write_stdin(stdin, stdin_rx, closed.clone()));
    tokio::spawn(pump(
        id,
        generation,
        child,
        stdout,
        stderr,
        kill.clone(),
        closed,
        events,
    ));

    Ok(ProcessHandle {
        pid,
        stdin_tx,
        kill,
    })
}

async fn write_stdin(
    stdin: ChildStdin,
    mut stdin_rx: mpsc::Receiver<StdinRequest>,
    closed: CancellationToken,
) {
    let mut writer = BufWriter::new(stdin);

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                break;
            }
            maybe_cmd = stdin_rx.recv() => {
                let Some((cmd, ack)) = maybe_cmd else {
                    break;
                };
                let write = async {
                    writer.write_all(cmd.as_bytes()).await?;
                    writer.flush().await
                };
                // A process that stopped reading keeps the write pending until it exits.
                let res = tokio::select! {
                    res = write => res,
                    _ = closed.cancelled() => break,
                };
                _ = ack.send(res);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump(
    id: InstanceId,
    generation: u64,
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    kill: CancellationToken,
    closed: CancellationToken,
    events: mpsc::UnboundedSender<ProcessMessage>,
) {
    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut kill_sent = false;

    let forward = |source: LogSource, text: String| {
        trace!(instance = %id, ?source, "{}", text);
        _ = events.send(ProcessMessage::Line {
            id: id.clone(),
            generation,
            source,
            text,
        });
    };

    let status = loop {
        tokio::select! {
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(text)) => forward(LogSource::Stdout, text),
                _ => stdout_open = false,
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(text)) => forward(LogSource::Stderr, text),
                _ => stderr_open = false,
            },
            _ = kill.cancelled(), if !kill_sent => {
                kill_sent = true;
                if let Err(err) = child.start_kill() {
                    warn!(instance = %id, error = %err, "could not kill process");
                }
            }
            status = child.wait() => break status,
        }
    };

    // Lines written just before exit may still sit in the pipes.
    let drained = timeout(DRAIN_TIMEOUT, async {
        while stdout_open {
            match stdout.next_line().await {
                Ok(Some(text)) => forward(LogSource::Stdout, text),
                _ => stdout_open = false,
            }
        }
        while stderr_open {
            match stderr.next_line().await {
                Ok(Some(text)) => forward(LogSource::Stderr, text),
                _ => stderr_open = false,
            }
        }
    })
    .await;
    if drained.is_err() {
        debug!(instance = %id, "output pipes still open after exit, abandoning");
    }

    closed.cancel();

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(instance = %id, error = %err, "failed to reap process");
            None
        }
    };

    _ = events.send(ProcessMessage::Exited {
        id,
        generation,
        code,
    });
}

/// Writes one newline-terminated command through the stdin task and waits for the flush.
///
/// Gives up after `bound` when the process stops draining its input. The line
/// may still be written later if the pipe frees up.
pub(crate) async fn send_line(
    stdin_tx: &mpsc::Sender<StdinRequest>,
    id: &InstanceId,
    cmd: &str,
    bound: Duration,
) -> Result<(), ServerError> {
    let mut command = cmd.to_string();
    if !command.ends_with('\n') {
        command.push('\n');
    }

    let (ack_tx, ack_rx) = oneshot::channel();
    let closed = || {
        ServerError::StdinWriteFailed(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "process input closed",
        ))
    };

    let delivered = timeout(bound, async {
        stdin_tx
            .send((command, ack_tx))
            .await
            .map_err(|_| closed())?;

        ack_rx
            .await
            .map_err(|_| closed())?
            .map_err(ServerError::StdinWriteFailed)
    })
    .await;

    match delivered {
        Ok(res) => res,
        Err(_) => {
            warn!(instance = %id, bound_ms = bound.as_millis() as u64, "process input not draining");
            Err(ServerError::InputStalled(id.clone()))
        }
    }
}
