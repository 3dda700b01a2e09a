//! Helpers for running child processes with timeouts, cooperative abort, and
//! streamed output capture.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// How often the supervisor re-checks the abort flag and deadline while the
/// child runs.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a supervised child process.
#[derive(Debug)]
pub struct SupervisedOutput {
    pub status: ExitStatus,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub timed_out: bool,
    pub aborted: bool,
}

impl SupervisedOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.aborted
    }

    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Run a command, draining stdout/stderr to files without risking pipe
/// deadlocks.
///
/// Output is read concurrently while the child runs, on one helper thread per
/// stream. When `echo` is set each line is also mirrored to the parent's
/// stdout/stderr. The wait loop polls in `POLL_INTERVAL` steps so a global
/// abort or the deadline is honored promptly; on expiry the child is killed
/// and reaped.
pub fn run_supervised(
    mut cmd: Command,
    stdout_path: &Path,
    stderr_path: &Path,
    echo: bool,
    deadline: Option<Instant>,
    abort: &AtomicBool,
) -> Result<SupervisedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().context("spawn action script")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_file = File::create(stdout_path)
        .with_context(|| format!("create {}", stdout_path.display()))?;
    let stderr_file = File::create(stderr_path)
        .with_context(|| format!("create {}", stderr_path.display()))?;

    let stdout_handle =
        thread::spawn(move || drain_stream(stdout, stdout_file, echo, false));
    let stderr_handle =
        thread::spawn(move || drain_stream(stderr, stderr_file, echo, true));

    let mut timed_out = false;
    let mut aborted = false;
    let status = loop {
        if abort.load(Ordering::SeqCst) {
            aborted = true;
            child.kill().context("kill action script")?;
            break child.wait().context("wait after kill")?;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                child.kill().context("kill action script")?;
                break child.wait().context("wait after kill")?;
            }
        }
        match child
            .wait_timeout(POLL_INTERVAL)
            .context("wait for action script")?
        {
            Some(status) => break status,
            None => continue,
        }
    };

    let stdout_bytes = join_drain(stdout_handle).context("join stdout drain")?;
    let stderr_bytes = join_drain(stderr_handle).context("join stderr drain")?;

    Ok(SupervisedOutput {
        status,
        stdout_bytes,
        stderr_bytes,
        timed_out,
        aborted,
    })
}

fn join_drain(handle: thread::JoinHandle<Result<u64>>) -> Result<u64> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output drain thread panicked")),
    }
}

/// Drain a stream to a file (and optionally the console) until EOF.
///
/// Per-stream byte order is preserved; console interleaving across streams is
/// whatever the terminal makes of it.
fn drain_stream<R: Read>(
    mut reader: R,
    mut file: File,
    echo: bool,
    is_stderr: bool,
) -> Result<u64> {
    let mut total = 0u64;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read child output")?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n]).context("write capture file")?;
        if echo {
            if is_stderr {
                let mut console = std::io::stderr().lock();
                let _ = console.write_all(&chunk[..n]);
                let _ = console.flush();
            } else {
                let mut console = std::io::stdout().lock();
                let _ = console.write_all(&chunk[..n]);
                let _ = console.flush();
            }
        }
        total += n as u64;
    }

    file.flush().context("flush capture file")?;
    Ok(total)
}
