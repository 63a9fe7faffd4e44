//! Child-process supervision: launch, stream, timeout, cancel, escalate.
//!
//! One child at a time. Output is read line-grouped on dedicated threads and
//! funneled back to the supervising loop, which owns capture, logging, and
//! event emission so ordering stays deterministic.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::events::{Event, EventSink, OutputSource};
use crate::io::run_store::OutputLog;

/// Wall-clock budget for a single supervised child.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace between the soft-terminate signal and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-line prefixes applied to a child's output before logging/emission.
#[derive(Debug, Clone)]
pub struct OutputPrefix {
    pub stdout: String,
    pub stderr: String,
}

impl OutputPrefix {
    /// The executor-tool prefixes.
    pub fn executor() -> Self {
        Self {
            stdout: "[executor] ".to_string(),
            stderr: "[executor][stderr] ".to_string(),
        }
    }
}

/// What to launch and how.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// Launch the child as a process-group leader so descendants can be
    /// killed together. Used for executor steps.
    pub detached: bool,
    pub prefix: Option<OutputPrefix>,
}

/// Resolution of one supervised child.
#[derive(Debug, Clone, Default)]
pub struct ChildOutcome {
    pub exit_code: i32,
    pub cancelled: bool,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    /// Set when the child could not be spawned.
    pub error: Option<String>,
}

/// Launch and supervise one child to completion.
///
/// Streams each output line to `log` and `sink` as it arrives, enforces the
/// wall-clock `timeout`, and honors `cancel` cooperatively. Termination
/// escalates soft signal, [`KILL_GRACE`], hard kill. Never panics on child
/// failure; spawn errors resolve to `exit_code = -1` with `error` set.
#[instrument(skip_all, fields(program = %spec.program, detached = spec.detached))]
pub fn supervise(
    spec: &SpawnSpec,
    run_id: &str,
    timeout: Duration,
    cancel: &AtomicBool,
    sink: &dyn EventSink,
    log: &OutputLog,
) -> ChildOutcome {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    if spec.detached {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let message = spawn_error_message(&spec.program, &err);
            emit_system(sink, log, run_id, &format!("{message}\n"));
            return ChildOutcome {
                exit_code: -1,
                error: Some(message),
                ..ChildOutcome::default()
            };
        }
    };
    debug!(pid = child.id(), "child spawned");

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let (tx, rx) = mpsc::channel::<(OutputSource, String)>();
    let tx_err = tx.clone();
    let stdout_reader =
        std::thread::spawn(move || forward_lines(stdout, OutputSource::Stdout, tx));
    let stderr_reader =
        std::thread::spawn(move || forward_lines(stderr, OutputSource::Stderr, tx_err));

    let deadline = Instant::now() + timeout;
    let mut outcome = ChildOutcome::default();
    let mut forced_status: Option<ExitStatus> = None;

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((source, text)) => {
                match source {
                    OutputSource::Stdout => outcome.stdout.push_str(&text),
                    OutputSource::Stderr => outcome.stderr.push_str(&text),
                    OutputSource::System => {}
                }
                let shown = apply_prefix(spec.prefix.as_ref(), source, &text);
                log.append(&shown);
                sink.emit(Event::RunOutput {
                    run_id: run_id.to_string(),
                    source,
                    text: shown,
                });
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if !outcome.cancelled && !outcome.timed_out {
            if cancel.load(Ordering::Relaxed) {
                outcome.cancelled = true;
                forced_status = terminate(&mut child, spec.detached);
            } else if Instant::now() >= deadline {
                outcome.timed_out = true;
                emit_system(sink, log, run_id, "[Timeout exceeded]\n");
                forced_status = terminate(&mut child, spec.detached);
            }
        }
    }

    let _ = stdout_reader.join();
    let _ = stderr_reader.join();

    let status = match forced_status {
        Some(status) => Ok(status),
        None => child.wait(),
    };
    outcome.exit_code = match status {
        Ok(status) => status.code().unwrap_or(-1),
        Err(err) => {
            warn!(error = %err, "wait for child failed");
            -1
        }
    };
    if outcome.cancelled || outcome.timed_out {
        outcome.exit_code = -1;
    }
    outcome
}

/// Write a system line to the log and emit it as a `run:output` event.
pub fn emit_system(sink: &dyn EventSink, log: &OutputLog, run_id: &str, text: &str) {
    log.append(text);
    sink.emit(Event::RunOutput {
        run_id: run_id.to_string(),
        source: OutputSource::System,
        text: text.to_string(),
    });
}

fn forward_lines<R: Read>(reader: R, source: OutputSource, tx: mpsc::Sender<(OutputSource, String)>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send((source, text)).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "output read failed");
                break;
            }
        }
    }
}

fn apply_prefix(prefix: Option<&OutputPrefix>, source: OutputSource, text: &str) -> String {
    let Some(prefix) = prefix else {
        return text.to_string();
    };
    let tag = match source {
        OutputSource::Stdout => &prefix.stdout,
        OutputSource::Stderr => &prefix.stderr,
        OutputSource::System => return text.to_string(),
    };
    format!("{tag}{text}")
}

fn spawn_error_message(program: &str, err: &std::io::Error) -> String {
    if err.kind() == std::io::ErrorKind::NotFound {
        format!("{program}: command not found")
    } else {
        format!("failed to start {program}: {err}")
    }
}

/// Soft-terminate, wait out the grace period, then hard-kill.
fn terminate(child: &mut Child, detached: bool) -> Option<ExitStatus> {
    soft_kill(child, detached);
    match child.wait_timeout(KILL_GRACE) {
        Ok(Some(status)) => Some(status),
        Ok(None) => {
            hard_kill(child, detached);
            child.wait().ok()
        }
        Err(err) => {
            warn!(error = %err, "grace wait failed");
            None
        }
    }
}

#[cfg(unix)]
fn soft_kill(child: &Child, detached: bool) {
    use nix::sys::signal::{Signal, kill, killpg};
    use nix::unistd::Pid;
    let pid = Pid::from_raw(child.id() as i32);
    let result = if detached {
        killpg(pid, Signal::SIGTERM)
    } else {
        kill(pid, Signal::SIGTERM)
    };
    if let Err(err) = result {
        debug!(error = %err, "soft kill failed");
    }
}

#[cfg(unix)]
fn hard_kill(child: &mut Child, detached: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;
    if detached {
        if let Err(err) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
            debug!(error = %err, "group hard kill failed");
        }
    } else if let Err(err) = child.kill() {
        debug!(error = %err, "hard kill failed");
    }
}

// Without process groups only the direct child can be signalled; descendants
// may be orphaned. Known regression on non-unix platforms.
#[cfg(not(unix))]
fn soft_kill(child: &Child, _detached: bool) {
    let _ = child;
}

#[cfg(not(unix))]
fn hard_kill(child: &mut Child, _detached: bool) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "hard kill failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CollectingSink;

    fn spec(program: &str, args: &[&str], workdir: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            workdir: workdir.to_path_buf(),
            detached: false,
            prefix: None,
        }
    }

    fn harness() -> (tempfile::TempDir, OutputLog, CollectingSink, AtomicBool) {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = OutputLog::create(temp.path()).expect("log");
        (temp, log, CollectingSink::default(), AtomicBool::new(false))
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let (temp, log, sink, cancel) = harness();
        let outcome = supervise(
            &spec("echo", &["hello"], temp.path()),
            "run-1",
            Duration::from_secs(5),
            &cancel,
            &sink,
            &log,
        );
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
        assert!(!outcome.cancelled && !outcome.timed_out);
        assert!(sink.events().iter().any(|event| matches!(
            event,
            Event::RunOutput { source: OutputSource::Stdout, text, .. } if text.contains("hello")
        )));
    }

    #[test]
    fn reports_nonzero_exit() {
        let (temp, log, sink, cancel) = harness();
        let outcome = supervise(
            &spec("false", &[], temp.path()),
            "run-1",
            Duration::from_secs(5),
            &cancel,
            &sink,
            &log,
        );
        assert_eq!(outcome.exit_code, 1);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn spawn_failure_is_exit_minus_one_with_message() {
        let (temp, log, sink, cancel) = harness();
        let outcome = supervise(
            &spec("no-such-binary-zzz", &[], temp.path()),
            "run-1",
            Duration::from_secs(5),
            &cancel,
            &sink,
            &log,
        );
        assert_eq!(outcome.exit_code, -1);
        let message = outcome.error.expect("spawn error");
        assert!(message.contains("command not found"), "got {message}");
        assert!(sink.events().iter().any(|event| matches!(
            event,
            Event::RunOutput { source: OutputSource::System, text, .. }
                if text.contains("command not found")
        )));
    }

    #[test]
    fn timeout_terminates_and_flags() {
        let (temp, log, sink, cancel) = harness();
        let started = Instant::now();
        let outcome = supervise(
            &spec("sleep", &["30"], temp.path()),
            "run-1",
            Duration::from_millis(100),
            &cancel,
            &sink,
            &log,
        );
        assert!(outcome.timed_out);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.exit_code, -1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sink.events().iter().any(|event| matches!(
            event,
            Event::RunOutput { source: OutputSource::System, text, .. }
                if text.contains("[Timeout exceeded]")
        )));
    }

    #[test]
    fn cancel_flag_terminates_child() {
        let (temp, log, sink, cancel) = harness();
        cancel.store(true, Ordering::Relaxed);
        let outcome = supervise(
            &spec("sleep", &["30"], temp.path()),
            "run-1",
            Duration::from_secs(30),
            &cancel,
            &sink,
            &log,
        );
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
    }

    #[cfg(unix)]
    #[test]
    fn detached_child_is_killed_as_a_group() {
        let (temp, log, sink, cancel) = harness();
        let mut detached = spec("sleep", &["30"], temp.path());
        detached.detached = true;
        cancel.store(true, Ordering::Relaxed);
        let outcome = supervise(
            &detached,
            "run-1",
            Duration::from_secs(30),
            &cancel,
            &sink,
            &log,
        );
        assert!(outcome.cancelled);
        assert_eq!(outcome.exit_code, -1);
    }

    #[test]
    fn executor_prefix_applies_per_line() {
        let (temp, log, sink, cancel) = harness();
        let mut prefixed = spec("printf", &["a\\nb\\n"], temp.path());
        prefixed.prefix = Some(OutputPrefix::executor());
        let outcome = supervise(
            &prefixed,
            "run-1",
            Duration::from_secs(5),
            &cancel,
            &sink,
            &log,
        );
        assert_eq!(outcome.exit_code, 0);
        // Capture stays raw; log and events carry the prefix.
        assert_eq!(outcome.stdout, "a\nb\n");
        let texts: Vec<String> = sink
            .events()
            .iter()
            .filter_map(|event| match event {
                Event::RunOutput { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert!(texts.iter().any(|t| t == "[executor] a\n"), "{texts:?}");
        assert!(texts.iter().any(|t| t == "[executor] b\n"), "{texts:?}");
    }
}
