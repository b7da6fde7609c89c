use log::warn;
use std::ffi::OsString;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Minimum time granted to the output readers once the target has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// What the target left behind when it finished within the timeout.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Everything the target wrote to standard output.
    pub stdout: Vec<u8>,
    /// Everything the target wrote to standard error.
    pub stderr: Vec<u8>,
    /// The exit code, `None` if the target was terminated by a signal.
    pub exit_code: Option<i32>,
    /// The terminating signal on unix, `None` elsewhere or on a normal exit.
    pub signal: Option<i32>,
}

impl ProcessOutput {
    fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            stdout,
            stderr,
            exit_code: status.code(),
            signal,
        }
    }

    /// The exit code, or the negated signal number when the target was killed
    /// by a signal.
    pub fn status_code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => -signal,
            (None, None) => -1,
        }
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Result of a bounded wait on the target. On `TimedOut` the target's process
/// tree has already been killed and reaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(ProcessOutput),
    TimedOut,
}

/// A target program invocation with a hard time limit.
///
/// The target gets a null stdin and piped stdout and stderr. On unix it leads
/// its own process group so that it can be killed together with its children.
#[derive(Debug, Clone)]
pub struct TargetCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl TargetCommand {
    /// # Arguments
    /// * `program`: path to the executable, or a name looked up in `PATH`.
    /// * `timeout`: how long [`TargetCommand::run`] waits before killing it.
    pub fn new<P: Into<PathBuf>>(program: P, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Appends one argument, passed to the target verbatim.
    pub fn arg<S: Into<OsString>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawns the target, drains its output and waits at most `timeout`.
    ///
    /// Processes the target leaves behind in its process group are killed once
    /// it exits, and output collection is bounded by the same deadline, so a
    /// backgrounded grandchild holding the pipes cannot stall the caller.
    ///
    /// # Returns
    /// * `Ok(ProcessOutcome::Completed(_))` if the target exited in time, with
    ///   whatever it wrote to stdout and stderr.
    /// * `Ok(ProcessOutcome::TimedOut)` if the deadline passed; the target's
    ///   process tree has been killed and reaped.
    /// * `Err(_)` only if the target could not be spawned or waited on. What
    ///   the target itself does is never an error.
    pub fn run(&self) -> std::io::Result<ProcessOutcome> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let deadline = Instant::now() + self.timeout;
        let mut child = cmd.spawn()?;
        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        match wait_until(&mut child, deadline)? {
            Some(status) => {
                kill_leftovers(&child);
                let stdout = collect(stdout_reader, deadline);
                let stderr = collect(stderr_reader, deadline);
                Ok(ProcessOutcome::Completed(ProcessOutput::from_status(
                    status, stdout, stderr,
                )))
            }
            None => {
                kill_process_tree(&mut child);
                if let Err(e) = child.wait() {
                    warn!("Failed to reap timed-out target {:?}: {e}", self.program);
                }
                Ok(ProcessOutcome::TimedOut)
            }
        }
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    // The target leads its own process group, see `process_group(0)`.
    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        warn!("Failed to kill process group {}: {e}", child.id());
        if let Err(e) = child.kill() {
            warn!("Failed to kill timed-out target {}: {e}", child.id());
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill timed-out target {}: {e}", child.id());
    }
}

/// Kills whatever is still running in the group of a target that has exited.
#[cfg(unix)]
fn kill_leftovers(child: &Child) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        // No member left: the usual case.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill leftovers of process group {}: {e}", child.id()),
    }
}

#[cfg(not(unix))]
fn kill_leftovers(_child: &Child) {}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Waits for a reader until `deadline`, or at least [`DRAIN_GRACE`]. A reader
/// that misses it is abandoned and its output dropped.
fn collect(reader: Option<Receiver<Vec<u8>>>, deadline: Instant) -> Vec<u8> {
    let Some(rx) = reader else {
        return Vec::new();
    };
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(DRAIN_GRACE);
    match rx.recv_timeout(wait) {
        Ok(buf) => buf,
        Err(_) => {
            warn!("Target output was still open after it exited, dropping it");
            Vec::new()
        }
    }
}
