//! ProcessRunner – launches one child with piped standard streams, feeds it
//! an optional payload, captures everything it prints and waits for it to
//! exit.
//!
//! Arguments are passed to the OS as an argv vector; no shell is involved
//! and no command line is assembled by hand.
//!
//! Stdout and stderr are drained by their own worker threads, started before
//! any input is written, and stdin is fed from a third worker. The calling
//! thread only waits for the child. A child may therefore fill either output
//! pipe at any point without stalling the parent, and a child that never
//! reads its input cannot block the wait or its timeout.
//!
//! All OS handles live in [`ChildHandles`] and the per-stream workers; every
//! return path, including early errors, closes each pipe end exactly once and
//! reaps the child.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crate::error::{LaunchError, StdStream};

/// Interval between exit checks while a timeout is armed.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single launch request. Built once, then handed to [`ProcessRunner::run`].
#[derive(Debug, Clone)]
pub struct ChildInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    input: Option<Vec<u8>>,
}

impl ChildInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            input: None,
        }
    }

    /// Append one opaque argument token.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Payload written to the child's stdin before it is closed.
    pub fn input(mut self, bytes: Vec<u8>) -> Self {
        self.input = Some(bytes);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.input.as_deref()
    }
}

/// Everything a finished child left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildResult {
    /// The child's exit code. On Unix a child killed by signal `n` reports
    /// `128 + n`.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    /// Captured stderr, decoded lossily as UTF-8.
    pub stderr: String,
}

impl ChildResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Launches children according to a fixed policy.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    /// A runner that waits for the child indefinitely.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the child and fail with [`LaunchError::Timeout`] if it is still
    /// running after `timeout`. `None` waits forever.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `invocation` to completion.
    pub fn run(&self, invocation: &ChildInvocation) -> Result<ChildResult, LaunchError> {
        log::debug!(
            "Launching {} {:?} ({} input bytes)",
            invocation.program().display(),
            invocation.arguments(),
            invocation.payload().map_or(0, <[u8]>::len)
        );

        let child = Command::new(invocation.program())
            .args(invocation.arguments())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                log::error!("Failed to spawn {}: {source}", invocation.program().display());
                LaunchError::Spawn {
                    program: invocation.program().to_path_buf(),
                    source,
                }
            })?;

        let mut handles = ChildHandles::new(child);
        let pipes = handles.take_pipes()?;
        let input = invocation.payload().unwrap_or_default();
        let timeout = self.timeout;

        // Workers still blocked on a pipe are joined when the scope ends, so
        // the child must be gone before an error leaves the closure.
        let result = thread::scope(|scope| {
            let result = supervise(scope, &mut handles, pipes, input, timeout);
            if result.is_err() {
                handles.terminate();
            }
            result
        });

        if let Ok(res) = &result {
            log::debug!(
                "Child {} exited with {} ({} stdout bytes, {} stderr bytes)",
                handles.pid,
                res.exit_code,
                res.stdout.len(),
                res.stderr.len()
            );
        }
        result
    }
}

/// The parent's ends of the three standard channels.
struct Pipes {
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// Owns the child process. Dropping it kills and reaps a child that has not
/// been waited for yet.
struct ChildHandles {
    child: Child,
    pid: u32,
    reaped: bool,
}

impl ChildHandles {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            reaped: false,
        }
    }

    fn take_pipes(&mut self) -> Result<Pipes, LaunchError> {
        let stdin = self
            .child
            .stdin
            .take()
            .ok_or(LaunchError::PipeUnavailable(StdStream::Stdin))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or(LaunchError::PipeUnavailable(StdStream::Stdout))?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or(LaunchError::PipeUnavailable(StdStream::Stderr))?;
        Ok(Pipes {
            stdin,
            stdout,
            stderr,
        })
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, LaunchError> {
        let status = match timeout {
            None => self.child.wait().map_err(LaunchError::Wait)?,
            Some(limit) => self.wait_until(Instant::now() + limit, limit)?,
        };
        self.reaped = true;
        Ok(status)
    }

    fn wait_until(&mut self, deadline: Instant, limit: Duration) -> Result<ExitStatus, LaunchError> {
        loop {
            if let Some(status) = self.child.try_wait().map_err(LaunchError::Wait)? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Child {} did not exit within {:?}, killing it",
                    self.pid,
                    limit
                );
                self.terminate();
                return Err(LaunchError::Timeout(limit));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Kill and reap the child. Safe to call more than once.
    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        // kill() fails only if the child already exited; wait() reaps either way.
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildHandles {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn supervise<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    handles: &mut ChildHandles,
    pipes: Pipes,
    input: &'env [u8],
    timeout: Option<Duration>,
) -> Result<ChildResult, LaunchError> {
    let Pipes {
        stdin,
        stdout,
        stderr,
    } = pipes;

    let stdout_worker = spawn_worker(scope, StdStream::Stdout, move || {
        drain(stdout, StdStream::Stdout)
    })?;
    let stderr_worker = spawn_worker(scope, StdStream::Stderr, move || {
        drain(stderr, StdStream::Stderr)
    })?;

    // Without a payload the child sees end-of-input right away.
    let writer = if input.is_empty() {
        drop(stdin);
        None
    } else {
        Some(spawn_worker(scope, StdStream::Stdin, move || {
            feed_stdin(stdin, input)
        })?)
    };

    let status = handles.wait(timeout)?;
    let exit_code = exit_code(status);

    let written = writer.map_or(Ok(()), join);
    let stdout = join(stdout_worker)?;
    let stderr = join(stderr_worker)?;

    if let Err(err) = written {
        // A child that bails out before reading all input and says why on
        // stderr is reported as a failed child, not as a broken pipe.
        let closed_early = matches!(
            err,
            LaunchError::StdinWrite {
                stdin_closed_early: true,
                ..
            }
        );
        if !(closed_early && exit_code != 0) {
            return Err(err);
        }
        log::debug!("Child {} closed stdin early and exited with {exit_code}", handles.pid);
    }

    Ok(ChildResult {
        exit_code,
        stdout,
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn spawn_worker<'scope, 'env, T, F>(
    scope: &'scope Scope<'scope, 'env>,
    stream: StdStream,
    work: F,
) -> Result<ScopedJoinHandle<'scope, Result<T, LaunchError>>, LaunchError>
where
    T: Send + 'scope,
    F: FnOnce() -> Result<T, LaunchError> + Send + 'scope,
{
    thread::Builder::new()
        .name(format!("ksef-{stream}"))
        .spawn_scoped(scope, work)
        .map_err(|source| LaunchError::Worker { stream, source })
}

fn join<T>(worker: ScopedJoinHandle<'_, Result<T, LaunchError>>) -> Result<T, LaunchError> {
    worker
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// Write the whole payload, then close stdin by dropping it.
fn feed_stdin(mut stdin: ChildStdin, input: &[u8]) -> Result<(), LaunchError> {
    #[cfg(unix)]
    let _sigpipe = sigpipe::Blocked::for_this_thread();

    let mut written = 0;
    while written < input.len() {
        match stdin.write(&input[written..]) {
            Ok(0) => {
                return Err(LaunchError::StdinWrite {
                    written,
                    total: input.len(),
                    stdin_closed_early: true,
                    source: io::Error::from(io::ErrorKind::WriteZero),
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(LaunchError::StdinWrite {
                    written,
                    total: input.len(),
                    stdin_closed_early: source.kind() == io::ErrorKind::BrokenPipe,
                    source,
                })
            }
        }
    }
    stdin.flush().map_err(|source| LaunchError::StdinWrite {
        written,
        total: input.len(),
        stdin_closed_early: source.kind() == io::ErrorKind::BrokenPipe,
        source,
    })
}

/// Keeps a write to a pipe whose reader has gone from raising `SIGPIPE` in a
/// host process that never ignored it; the write fails with `EPIPE` instead.
#[cfg(unix)]
mod sigpipe {
    use std::{mem, ptr};

    /// `SIGPIPE` blocked for the current thread until dropped.
    pub(super) struct Blocked {
        previous: libc::sigset_t,
        already_blocked: bool,
    }

    impl Blocked {
        pub(super) fn for_this_thread() -> Option<Self> {
            let set = sigpipe_set();
            let mut previous: libc::sigset_t = unsafe { mem::zeroed() };
            let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous) };
            if rc != 0 {
                log::warn!("Could not block SIGPIPE for the stdin writer (error {rc})");
                return None;
            }
            let already_blocked = unsafe { libc::sigismember(&previous, libc::SIGPIPE) } == 1;
            Some(Self {
                previous,
                already_blocked,
            })
        }
    }

    impl Drop for Blocked {
        fn drop(&mut self) {
            if self.already_blocked {
                return;
            }
            // A failed write may have left SIGPIPE pending on this thread;
            // consume it so unblocking does not deliver it.
            let set = sigpipe_set();
            unsafe {
                let mut pending: libc::sigset_t = mem::zeroed();
                if libc::sigpending(&mut pending) == 0
                    && libc::sigismember(&pending, libc::SIGPIPE) == 1
                {
                    let mut signal = 0;
                    libc::sigwait(&set, &mut signal);
                }
                libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
            }
        }
    }

    fn sigpipe_set() -> libc::sigset_t {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGPIPE);
            set
        }
    }
}

fn drain(mut pipe: impl Read, stream: StdStream) -> Result<Vec<u8>, LaunchError> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .map_err(|source| LaunchError::StreamRead { stream, source })?;
    Ok(buf)
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ChildInvocation {
        ChildInvocation::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn captures_both_streams_and_exit_code() {
        let res = ProcessRunner::new()
            .run(&sh("printf out; printf err >&2; exit 3"))
            .unwrap();
        assert_eq!(res.exit_code, 3);
        assert_eq!(res.stdout, b"out");
        assert_eq!(res.stderr, "err");
        assert!(!res.success());
    }

    #[test]
    fn payload_reaches_stdin() {
        let inv = ChildInvocation::new("/bin/cat").input(b"<Faktura/>".to_vec());
        let res = ProcessRunner::new().run(&inv).unwrap();
        assert!(res.success());
        assert_eq!(res.stdout, b"<Faktura/>");
    }

    #[test]
    fn stdin_closed_without_payload() {
        // cat would block forever if stdin stayed open.
        let res = ProcessRunner::with_timeout(Some(Duration::from_secs(10)))
            .run(&ChildInvocation::new("/bin/cat"))
            .unwrap();
        assert!(res.success());
        assert!(res.stdout.is_empty());
    }

    #[test]
    fn arguments_are_not_split_or_interpreted() {
        let inv = sh("printf '%s|' \"$@\"")
            .arg("sh")
            .args(["two words", "$HOME", "a\"quote", ""]);
        let res = ProcessRunner::new().run(&inv).unwrap();
        assert_eq!(res.stdout, b"two words|$HOME|a\"quote||");
    }

    #[test]
    fn ten_megabytes_through_stdin_do_not_deadlock() {
        let payload: Vec<u8> = (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let inv = ChildInvocation::new("/bin/cat").input(payload.clone());
        let res = ProcessRunner::with_timeout(Some(Duration::from_secs(60)))
            .run(&inv)
            .unwrap();
        assert_eq!(res.stdout.len(), payload.len());
        assert!(res.stdout == payload);
    }

    #[test]
    fn flooding_stderr_while_input_is_written_does_not_deadlock() {
        // The child fills stderr well past the pipe buffer before it reads any
        // input, then echoes a multi-megabyte payload back on stdout.
        let inv = sh("head -c 2000000 /dev/zero >&2; cat").input(vec![b'x'; 4 * 1024 * 1024]);
        let res = ProcessRunner::with_timeout(Some(Duration::from_secs(60)))
            .run(&inv)
            .unwrap();
        assert!(res.success());
        assert_eq!(res.stdout.len(), 4 * 1024 * 1024);
        assert_eq!(res.stderr.len(), 2_000_000);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = ProcessRunner::new()
            .run(&ChildInvocation::new("/nonexistent/ksef-pdf-generator"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }), "got {err:?}");
    }

    #[test]
    fn hung_child_is_killed_after_timeout() {
        let started = Instant::now();
        let err = ProcessRunner::with_timeout(Some(Duration::from_millis(200)))
            .run(&sh("exec sleep 30"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::Timeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn child_closing_stdin_early_is_reported_distinctly() {
        let inv = sh("exec 0<&-; exit 0").input(vec![0u8; 4 * 1024 * 1024]);
        let err = ProcessRunner::new().run(&inv).unwrap_err();
        assert!(
            matches!(
                err,
                LaunchError::StdinWrite {
                    stdin_closed_early: true,
                    ..
                }
            ),
            "got {err:?}"
        );
    }

    #[test]
    fn failing_child_that_ignores_input_reports_its_own_error() {
        let inv = sh("exec 0<&-; echo 'not an invoice' >&2; exit 4").input(vec![0u8; 4 * 1024 * 1024]);
        let res = ProcessRunner::new().run(&inv).unwrap();
        assert_eq!(res.exit_code, 4);
        assert_eq!(res.stderr.trim(), "not an invoice");
    }

    #[test]
    fn signal_termination_maps_to_shell_convention() {
        let res = ProcessRunner::new().run(&sh("kill -9 $$")).unwrap();
        assert_eq!(res.exit_code, 128 + 9);
    }
}
