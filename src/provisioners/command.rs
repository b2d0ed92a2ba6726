//! Command provisioners.
//!
//! The configured binary runs with its fixed arguments plus a trailing mode
//! token. The request envelope is written to stdin; stdout is the response.
//! stderr is captured so a failing provisioner's diagnostics reach the error.
//!
//! On unix the child leads its own process group. When a deadline passes the
//! whole group is killed, so helpers a script started cannot hold the pipes
//! open past the deadline.
use super::{Mode, MODE_ENV};
use crate::util::truncate_bytes;
use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long pipe readers may take to drain after a timed-out child is killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

pub(super) fn run(
    binary: &str,
    args: &[String],
    mode: Mode,
    input: &[u8],
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    let program = resolve_binary(binary)?;
    let start = Instant::now();
    let mut command = Command::new(&program);
    command
        .args(args)
        .arg(mode.as_str())
        .env(MODE_ENV, mode.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("spawn {}", program.display()))?;

    // stdin, stdout and stderr each get their own thread.
    let writer = {
        let stdin = child.stdin.take();
        let input = input.to_vec();
        thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input)?;
            }
            Ok(())
        })
    };
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let status = wait_with_deadline(&mut child, timeout)
        .with_context(|| format!("wait for {}", program.display()))?;
    let Some(status) = status else {
        let stderr = drain_within(stderr, KILL_GRACE);
        tracing::warn!(
            binary = %program.display(),
            mode = mode.as_str(),
            elapsed_ms = start.elapsed().as_millis(),
            "cmd provisioner killed at deadline"
        );
        return Err(anyhow!(
            "{} {} timed out after {}s: {}",
            program.display(),
            mode.as_str(),
            timeout.map(|t| t.as_secs()).unwrap_or_default(),
            truncate_bytes(&stderr, MAX_DIAGNOSTIC_BYTES).trim()
        ));
    };
    let stdout = join_reader(stdout).context("read provisioner stdout")?;
    let stderr = join_reader(stderr).context("read provisioner stderr")?;
    if let Ok(Err(err)) = writer.join() {
        tracing::debug!(error = %err, "provisioner did not read all of stdin");
    }

    tracing::info!(
        binary = %program.display(),
        mode = mode.as_str(),
        elapsed_ms = start.elapsed().as_millis(),
        response_bytes = stdout.len(),
        "cmd provisioner complete"
    );

    if !status.success() {
        return Err(anyhow!(
            "{} {} failed with status {}: {}",
            program.display(),
            mode.as_str(),
            status,
            truncate_bytes(&stderr, MAX_DIAGNOSTIC_BYTES).trim()
        ));
    }
    Ok(stdout)
}

/// Absolute paths are used as-is; anything else is looked up on `PATH`.
pub(crate) fn resolve_binary(binary: &str) -> Result<PathBuf> {
    let path = PathBuf::from(binary);
    if path.is_absolute() {
        return Ok(path);
    }
    if binary.contains('/') {
        return std::path::absolute(&path)
            .with_context(|| format!("resolve {binary} as an absolute path"));
    }
    which::which(binary).map_err(|_| anyhow!("failed to find '{binary}' on PATH"))
}

/// Wait for exit; `None` means the deadline passed and the child was killed.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait().context("wait for exit")?));
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().context("check exit status")? {
            return Ok(Some(status));
        }
        if start.elapsed() > timeout {
            kill_process_group(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal; the group was created at spawn.
            let _ = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        }
    }
    let _ = child.kill();
}

fn spawn_reader<R>(source: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            source.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_reader(handle: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe reader thread panicked"))?
        .map_err(Into::into)
}

/// Collect a reader's output if it finishes within `grace`, else give up on it.
fn drain_within(handle: JoinHandle<std::io::Result<Vec<u8>>>, grace: Duration) -> Vec<u8> {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() > grace {
            return Vec::new();
        }
        thread::sleep(POLL_INTERVAL);
    }
    handle.join().ok().and_then(Result::ok).unwrap_or_default()
}
