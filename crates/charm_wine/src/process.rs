//! Subprocesses that can be cancelled as a whole: every child is the leader of its own
//! process group, so cancelling reaches everything it spawned.

use std::{
    fs::{self, OpenOptions},
    io::{self, Read},
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::Reporter;

/// How often running children are polled for exit and cancellation.
pub const POLL: Duration = Duration::from_millis(100);
/// Time a process group gets between SIGTERM and SIGKILL.
pub const GRACE: Duration = Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to start `{0}`. {1}")]
    Spawn(String, #[source] io::Error),
    #[error("`{program}` failed with {status}. {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("`{0}` did not finish within {1:?}")]
    Timeout(String, Duration),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
}

impl Error {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[derive(Debug, Default)]
struct State {
    stop: AtomicBool,
    busy: AtomicBool,
    current: Mutex<Option<libc::pid_t>>,
}

/// Shared cancellation token for long-running operations.
///
/// Holds the stop flag polled between steps and the process group of the subprocess that
/// is currently running, if any.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    state: Arc<State>,
}

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        info!("Cancellation requested");
        self.state.stop.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.stop.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The raw flag, for loops that only understand an `AtomicBool`.
    #[must_use]
    pub fn stop_flag(&self) -> &AtomicBool {
        &self.state.stop
    }

    /// Process group of the subprocess currently running under this token.
    #[must_use]
    pub fn current_group(&self) -> Option<libc::pid_t> {
        *self
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the start of a user-visible operation. Returns `None` while another one is
    /// still running. The stop flag is cleared for the new operation.
    #[must_use]
    pub fn begin(&self) -> Option<Operation> {
        self.state
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.state.stop.store(false, Ordering::SeqCst);
        Some(Operation(self.clone()))
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state.busy.load(Ordering::SeqCst)
    }

    fn occupy(&self, pgid: libc::pid_t) -> Slot<'_> {
        *self
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pgid);
        Slot(self)
    }
}

/// Held for the duration of an operation started with [`Cancellation::begin`].
#[derive(Debug)]
pub struct Operation(Cancellation);

impl Drop for Operation {
    fn drop(&mut self) {
        self.0.state.busy.store(false, Ordering::SeqCst);
    }
}

struct Slot<'a>(&'a Cancellation);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        *self
            .0
            .state
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Runs `command` to completion, capturing both output streams.
///
/// Fails with [`Error::Failed`] on a non-zero exit and with [`Error::Cancelled`] once
/// `cancel` fires, after the whole process group has been terminated.
pub fn run(
    command: &mut Command,
    cancel: &Cancellation,
    reporter: &Reporter,
) -> Result<Output, Error> {
    run_until(command, cancel, reporter, None)
}

/// Like [`run`] but gives up after `timeout`.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<Output, Error> {
    run_until(
        command,
        &Cancellation::new(),
        &Reporter::silent(),
        Some(timeout),
    )
}

fn run_until(
    command: &mut Command,
    cancel: &Cancellation,
    reporter: &Reporter,
    timeout: Option<Duration>,
) -> Result<Output, Error> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = program_name(command);
    let mut child = spawn(command, cancel, &program)?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = wait(&mut child, cancel, reporter, timeout, &program)?;
    let output = Output {
        stdout: collect(stdout),
        stderr: collect(stderr),
    };

    if status.success() {
        Ok(output)
    } else {
        Err(Error::Failed {
            program,
            status,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// Runs `command` with both streams appended to `log`.
///
/// Used for wine tools: the wineserver they start inherits the streams and outlives them,
/// so pipes would never reach EOF.
pub fn run_logged(
    command: &mut Command,
    cancel: &Cancellation,
    reporter: &Reporter,
    log: &Path,
) -> Result<(), Error> {
    let file = OpenOptions::new().create(true).append(true).open(log)?;
    command.stdout(file.try_clone()?).stderr(file);

    let program = program_name(command);
    let mut child = spawn(command, cancel, &program)?;
    let status = wait(&mut child, cancel, reporter, None, &program)?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::Failed {
            program,
            status,
            stderr: log_tail(log, 20),
        })
    }
}

fn spawn(command: &mut Command, cancel: &Cancellation, program: &str) -> Result<Child, Error> {
    cancel.check()?;
    command.stdin(Stdio::null()).process_group(0);

    debug!("Running command: {command:?}");
    command
        .spawn()
        .map_err(|e| Error::Spawn(program.to_owned(), e))
}

fn wait(
    child: &mut Child,
    cancel: &Cancellation,
    reporter: &Reporter,
    timeout: Option<Duration>,
    program: &str,
) -> Result<ExitStatus, Error> {
    let deadline = timeout.map(|t| (t, Instant::now() + t));
    let _slot = libc::pid_t::try_from(child.id())
        .ok()
        .map(|pgid| cancel.occupy(pgid));

    loop {
        if let Some(status) = child.try_wait()? {
            debug!("`{program}` exited with {status}");
            return Ok(status);
        }

        if cancel.is_cancelled() {
            info!("Stopping `{program}`");
            terminate_child(child, GRACE);
            return Err(Error::Cancelled);
        }

        if let Some((timeout, deadline)) = deadline {
            if Instant::now() >= deadline {
                warn!("`{program}` timed out");
                terminate_child(child, GRACE);
                return Err(Error::Timeout(program.to_owned(), timeout));
            }
        }

        reporter.pulse();
        thread::sleep(POLL);
    }
}

fn drain(mut stream: impl Read + Send + 'static) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// SIGTERM to the child's whole group, then SIGKILL if anything is left after `grace`.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        let _ = child.wait();
        return;
    };

    signal_group(pgid, libc::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        let leader_done = matches!(child.try_wait(), Ok(Some(_)));
        if leader_done && !signal_group(pgid, 0) {
            return;
        }
        thread::sleep(POLL);
    }

    warn!("Process group {pgid} is still alive, sending SIGKILL");
    signal_group(pgid, libc::SIGKILL);
    let _ = child.wait();
}

/// SIGTERM to a single process that is not our child, then SIGKILL after `grace`.
pub fn terminate_pid(pid: libc::pid_t, grace: Duration) {
    if !signal(pid, libc::SIGTERM) {
        return;
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !alive(pid) {
            return;
        }
        thread::sleep(POLL);
    }

    warn!("Process {pid} is still alive, sending SIGKILL");
    signal(pid, libc::SIGKILL);
}

/// Sends `sig` to a process group. Signal 0 only checks that it exists.
pub fn signal_group(pgid: libc::pid_t, sig: libc::c_int) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: killpg has no memory safety preconditions.
    unsafe { libc::killpg(pgid, sig) == 0 }
}

pub fn signal(pid: libc::pid_t, sig: libc::c_int) -> bool {
    if pid <= 1 {
        return false;
    }
    // SAFETY: kill has no memory safety preconditions.
    unsafe { libc::kill(pid, sig) == 0 }
}

#[must_use]
pub fn alive(pid: libc::pid_t) -> bool {
    signal(pid, 0) || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Last `lines` lines of a log file, lossily decoded.
#[must_use]
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let all = text.lines().collect::<Vec<_>>();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        process::Command,
        thread,
        time::{Duration, Instant},
    };

    use pretty_assertions::assert_eq;

    use super::{log_tail, run, run_logged, run_with_timeout, Cancellation, Error};
    use crate::Reporter;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[test]
    fn captures_output() {
        let output = run(
            &mut sh("echo hello; echo oops >&2"),
            &Cancellation::new(),
            &Reporter::silent(),
        )
        .unwrap();

        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "oops\n");
    }

    #[test]
    fn failure_carries_stderr() {
        let err = run(
            &mut sh("echo boom >&2; exit 3"),
            &Cancellation::new(),
            &Reporter::silent(),
        )
        .unwrap_err();

        match err {
            Error::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cancel_stops_whole_group() {
        let cancel = Cancellation::new();
        let canceller = cancel.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            assert!(canceller.current_group().is_some());
            canceller.cancel();
        });

        let started = Instant::now();
        let result = run(
            &mut sh("sleep 30 & sleep 30; wait"),
            &cancel,
            &Reporter::silent(),
        );
        handle.join().unwrap();

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(cancel.current_group(), None);
    }

    #[test]
    fn cancelled_token_refuses_to_start() {
        let cancel = Cancellation::new();
        cancel.cancel();

        let result = run(&mut sh("true"), &cancel, &Reporter::silent());
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn times_out() {
        let result = run_with_timeout(&mut sh("sleep 10"), Duration::from_millis(200));
        assert!(matches!(result, Err(Error::Timeout(..))));
    }

    #[test]
    fn one_operation_at_a_time() {
        let cancel = Cancellation::new();
        cancel.cancel();

        let op = cancel.begin().unwrap();
        assert!(!cancel.is_cancelled());
        assert!(cancel.is_busy());
        assert!(cancel.begin().is_none());

        drop(op);
        assert!(!cancel.is_busy());
        assert!(cancel.begin().is_some());
    }

    #[test]
    fn logged_failure_reports_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("tool.log");

        let err = run_logged(
            &mut sh("for i in 1 2 3; do echo line$i; done; exit 1"),
            &Cancellation::new(),
            &Reporter::silent(),
            &log,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Failed { ref stderr, .. } if stderr.ends_with("line3")));
        assert_eq!(log_tail(&log, 2), "line2\nline3");
        assert_eq!(fs::read_to_string(&log).unwrap(), "line1\nline2\nline3\n");
    }
}
