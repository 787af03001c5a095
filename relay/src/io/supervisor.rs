//! Agent process supervision.
//!
//! The agent runs in its own process group so signals reach every
//! descendant and a stop request never leaves a pipe writer alive. Output is
//! read line by line on the caller's thread while [`ProcessSupervisor::await_exit`]
//! runs on another; whichever side finishes first, any group member left
//! once the leader exits is killed so the reader sees EOF.

use std::fmt;
use std::io::{BufRead, BufReader};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::Coordinator;
use crate::core::events::{Decoded, decode_line};
use crate::error::RelayError;
use crate::io::process::read_stream_limited;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to launch for one task.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: String,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// How an agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    NonZero(i32),
    Signaled(i32),
    Timeout,
    Cancelled,
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Success => f.write_str("exit code 0"),
            ExitOutcome::NonZero(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signaled(signal) => write!(f, "killed by signal {signal}"),
            ExitOutcome::Timeout => f.write_str("timed out"),
            ExitOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

type StderrReader = JoinHandle<Result<(Vec<u8>, usize)>>;

/// A running (or finished) agent process. Shared between the stream reader,
/// the exit waiter and the coordinator's registry.
#[derive(Debug)]
pub struct AgentHandle {
    task_id: String,
    pgid: Pid,
    child: Mutex<Child>,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: Mutex<Option<StderrReader>>,
    exited: AtomicBool,
    cancelled: AtomicBool,
}

impl AgentHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn pid(&self) -> i32 {
        self.pgid.as_raw()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = child.try_wait().context("poll agent process")?;
        if status.is_some() {
            self.exited.store(true, Ordering::SeqCst);
        }
        Ok(status)
    }

    /// Whether any process in the agent's group can still be signalled.
    fn group_alive(&self) -> bool {
        killpg(self.pgid, None).is_ok()
    }

    fn signal_group(&self, signal: Signal) -> Result<()> {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(anyhow!("signal {signal} to group {}: {errno}", self.pgid)),
        }
    }

    /// Bounded stderr of the run. Call after the process exited.
    pub fn stderr_output(&self) -> String {
        let reader = self
            .stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            return String::new();
        };
        match reader.join() {
            Ok(Ok((bytes, truncated))) => {
                let mut text = String::from_utf8_lossy(&bytes).into_owned();
                if truncated > 0 {
                    text.push_str(&format!("\n[agent stderr truncated {truncated} bytes]\n"));
                }
                text
            }
            Ok(Err(err)) => format!("[failed to read agent stderr: {err:#}]"),
            Err(_) => "[agent stderr reader panicked]".to_string(),
        }
    }
}

/// Lazy, finite, non-restartable sequence of decoded stdout lines.
pub struct EventStream {
    reader: BufReader<ChildStdout>,
    line_no: usize,
    task_id: String,
}

impl Iterator for EventStream {
    type Item = Decoded;

    fn next(&mut self) -> Option<Decoded> {
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => {
                self.line_no += 1;
                let line = String::from_utf8_lossy(&buf);
                Some(decode_line(self.line_no, &line))
            }
            Err(err) => {
                warn!(
                    task_id = %self.task_id,
                    err = %err,
                    "agent stdout read failed, ending stream"
                );
                None
            }
        }
    }
}

/// Capability interface over agent process control.
pub trait ProcessSupervisor: Send + Sync {
    /// Launch the agent in its own process group and register it.
    fn spawn(&self, request: SpawnRequest) -> Result<Arc<AgentHandle>>;

    /// Take the stdout stream. A second call for the same handle fails.
    fn stream_events(&self, handle: &AgentHandle) -> Result<EventStream>;

    /// Block until exit, timeout or cancellation, then unregister the handle.
    fn await_exit(&self, handle: &AgentHandle, timeout: Duration) -> Result<ExitOutcome>;

    /// Graceful stop of the whole group, forced after the grace period.
    fn terminate(&self, handle: &AgentHandle) -> Result<()>;

    /// Stop every registered process; used on shutdown.
    fn terminate_all(&self);
}

/// Unix implementation using process groups and `killpg`.
pub struct GroupSupervisor {
    coordinator: Arc<Coordinator>,
    grace_period: Duration,
    stderr_limit_bytes: usize,
}

impl GroupSupervisor {
    pub fn new(
        coordinator: Arc<Coordinator>,
        grace_period: Duration,
        stderr_limit_bytes: usize,
    ) -> Self {
        Self {
            coordinator,
            grace_period,
            stderr_limit_bytes,
        }
    }

    fn launch(&self, request: &SpawnRequest) -> Result<Arc<AgentHandle>> {
        let (program, args) = request
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|err| RelayError::ProcessCrash {
            outcome: format!("spawn {program} failed"),
            stderr: err.to_string(),
        })?;
        let pid = i32::try_from(child.id()).context("agent pid out of range")?;
        let stdout = child.stdout.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let limit = self.stderr_limit_bytes;
        let stderr_reader = thread::spawn(move || read_stream_limited(stderr, limit));

        info!(pid, program = %program, "agent spawned");
        Ok(Arc::new(AgentHandle {
            task_id: request.task_id.clone(),
            pgid: Pid::from_raw(pid),
            child: Mutex::new(child),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(Some(stderr_reader)),
            exited: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }))
    }

    /// Register a launched agent. A shutdown that began after the caller's
    /// check but before registration missed this handle in `terminate_all`,
    /// so the agent is cancelled here instead.
    fn admit(&self, handle: &Arc<AgentHandle>) {
        self.coordinator.register(Arc::clone(handle));
        if !self.coordinator.is_shutting_down() {
            return;
        }
        handle.cancelled.store(true, Ordering::SeqCst);
        if let Err(err) = self.terminate(handle) {
            warn!(
                task_id = %handle.task_id,
                err = %format!("{err:#}"),
                "terminate after late shutdown failed"
            );
        }
    }
}

impl ProcessSupervisor for GroupSupervisor {
    #[instrument(skip_all, fields(task_id = %request.task_id))]
    fn spawn(&self, request: SpawnRequest) -> Result<Arc<AgentHandle>> {
        if self.coordinator.is_shutting_down() {
            return Err(RelayError::Cancelled.into());
        }
        let handle = self.launch(&request)?;
        self.admit(&handle);
        Ok(handle)
    }

    fn stream_events(&self, handle: &AgentHandle) -> Result<EventStream> {
        let stdout = handle
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("agent stdout for {} already consumed", handle.task_id))?;
        Ok(EventStream {
            reader: BufReader::new(stdout),
            line_no: 0,
            task_id: handle.task_id.clone(),
        })
    }

    #[instrument(skip_all, fields(task_id = %handle.task_id, timeout_secs = timeout.as_secs()))]
    fn await_exit(&self, handle: &AgentHandle, timeout: Duration) -> Result<ExitOutcome> {
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        let waited = loop {
            match handle.try_wait() {
                Ok(Some(status)) => break Ok(status),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            if !timed_out && Instant::now() >= deadline {
                warn!("agent timed out, terminating group");
                timed_out = true;
                if let Err(err) = self.terminate(handle) {
                    break Err(err);
                }
                continue;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };

        // Descendants may still hold stdout open after the leader is gone.
        if !handle.group_alive() {
            debug!("agent group already gone");
        } else if let Err(err) = handle.signal_group(Signal::SIGKILL) {
            debug!(err = %format!("{err:#}"), "post-exit group kill failed");
        }
        self.coordinator.unregister(&handle.task_id);

        let status = waited?;
        let outcome = if timed_out {
            ExitOutcome::Timeout
        } else if handle.cancelled.load(Ordering::SeqCst) {
            ExitOutcome::Cancelled
        } else if status.success() {
            ExitOutcome::Success
        } else if let Some(code) = status.code() {
            ExitOutcome::NonZero(code)
        } else {
            ExitOutcome::Signaled(status.signal().unwrap_or_default())
        };
        info!(outcome = %outcome, "agent exited");
        Ok(outcome)
    }

    #[instrument(skip_all, fields(task_id = %handle.task_id, pgid = handle.pid()))]
    fn terminate(&self, handle: &AgentHandle) -> Result<()> {
        if handle.has_exited() {
            return Ok(());
        }
        debug!("sending SIGTERM to group");
        handle.signal_group(Signal::SIGTERM)?;

        let deadline = Instant::now() + self.grace_period;
        while Instant::now() < deadline {
            if handle.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(
            grace_ms = self.grace_period.as_millis() as u64,
            "grace period elapsed, sending SIGKILL"
        );
        handle.signal_group(Signal::SIGKILL)?;
        let mut child = handle.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.wait().context("reap agent after SIGKILL")?;
        handle.exited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn terminate_all(&self) {
        self.coordinator.request_shutdown();
        let handles = self.coordinator.active_processes();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "terminating all agent processes");
        thread::scope(|scope| {
            for handle in &handles {
                handle.cancelled.store(true, Ordering::SeqCst);
                scope.spawn(move || {
                    if let Err(err) = self.terminate(handle) {
                        warn!(
                            task_id = %handle.task_id,
                            err = %format!("{err:#}"),
                            "terminate failed"
                        );
                    }
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::RelayConfig;
    use crate::io::session_log::SessionLog;

    fn supervisor(grace: Duration) -> (Arc<Coordinator>, Arc<GroupSupervisor>) {
        let coordinator = Arc::new(Coordinator::new(&RelayConfig::default()));
        let supervisor = Arc::new(GroupSupervisor::new(
            Arc::clone(&coordinator),
            grace,
            4096,
        ));
        (coordinator, supervisor)
    }

    fn sh(task_id: &str, script: &str) -> SpawnRequest {
        SpawnRequest {
            task_id: task_id.to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            workdir: std::env::temp_dir(),
            env: vec![("RELAY_TASK_ID".to_string(), task_id.to_string())],
        }
    }

    /// Runs the stream on this thread and the waiter on another, the way
    /// the worker pipeline composes them.
    fn run(
        supervisor: &Arc<GroupSupervisor>,
        request: SpawnRequest,
        timeout: Duration,
    ) -> (SessionLog, ExitOutcome, String) {
        let handle = supervisor.spawn(request).expect("spawn");
        let waiter = {
            let supervisor = Arc::clone(supervisor);
            let handle = Arc::clone(&handle);
            thread::spawn(move || supervisor.await_exit(&handle, timeout))
        };
        let mut log = SessionLog::default();
        for decoded in supervisor.stream_events(&handle).expect("stream") {
            log.record(decoded);
        }
        let outcome = waiter.join().expect("join").expect("await");
        (log, outcome, handle.stderr_output())
    }

    #[test]
    fn collects_events_and_env() {
        let (coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let script = r#"echo '{"type":"assistant","message":"hi"}'; echo 'garbage'; echo "{\"type\":\"result\",\"result\":\"$RELAY_TASK_ID\"}""#;
        let (log, outcome, _) = run(&supervisor, sh("t1", script), Duration::from_secs(10));
        assert_eq!(outcome, ExitOutcome::Success);
        assert_eq!(log.summary.total_events, 2);
        assert_eq!(log.summary.skipped, 1);
        assert_eq!(log.plan_text().as_deref(), Some("hi\n\nt1"));
        assert!(coordinator.active_processes().is_empty());
    }

    #[test]
    fn classifies_nonzero_exit_with_stderr() {
        let (_coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let (_, outcome, stderr) = run(
            &supervisor,
            sh("t2", "echo boom >&2; exit 4"),
            Duration::from_secs(10),
        );
        assert_eq!(outcome, ExitOutcome::NonZero(4));
        assert_eq!(stderr, "boom\n");
    }

    /// Verifies a timeout kills the group, including a background child that
    /// inherited stdout, so the stream ends.
    #[test]
    fn timeout_kills_group_and_unblocks_reader() {
        let (_coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let started = Instant::now();
        let (_, outcome, _) = run(
            &supervisor,
            sh("t3", "sleep 30 & sleep 30"),
            Duration::from_millis(300),
        );
        assert_eq!(outcome, ExitOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// Verifies a SIGTERM-ignoring agent is force-killed after the grace period.
    #[test]
    fn ignored_sigterm_falls_back_to_sigkill() {
        let (_coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let (_, outcome, _) = run(
            &supervisor,
            sh("t4", "trap '' TERM; sleep 30"),
            Duration::from_millis(300),
        );
        assert_eq!(outcome, ExitOutcome::Timeout);
    }

    /// Verifies terminate_all cancels a running agent and blocks new spawns.
    #[test]
    fn terminate_all_cancels_running_agents() {
        let (coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let handle = supervisor.spawn(sh("t5", "sleep 30")).expect("spawn");
        let waiter = {
            let supervisor = Arc::clone(&supervisor);
            let handle = Arc::clone(&handle);
            thread::spawn(move || supervisor.await_exit(&handle, Duration::from_secs(60)))
        };
        let stream = supervisor.stream_events(&handle).expect("stream");

        supervisor.terminate_all();
        assert_eq!(stream.count(), 0);
        assert_eq!(
            waiter.join().expect("join").expect("await"),
            ExitOutcome::Cancelled
        );
        assert!(coordinator.is_shutting_down());

        let err = supervisor.spawn(sh("t6", "true")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::Cancelled)
        ));
    }

    /// Verifies a shutdown that lands between the spawn check and
    /// registration still cancels the agent.
    #[test]
    fn shutdown_racing_registration_cancels_the_agent() {
        let (coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let handle = supervisor.launch(&sh("t8", "sleep 30")).expect("launch");
        coordinator.request_shutdown();
        supervisor.admit(&handle);

        let started = Instant::now();
        let outcome = supervisor
            .await_exit(&handle, Duration::from_secs(60))
            .expect("await");
        assert_eq!(outcome, ExitOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(coordinator.active_processes().is_empty());
    }

    /// Verifies a background child holding stdout past the leader's exit is
    /// killed so the stream ends, and nothing in the group survives.
    #[test]
    fn descendants_outliving_the_leader_are_killed() {
        let (_coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let started = Instant::now();
        let script = r#"sleep 30 & echo '{"type":"result","result":"ok"}'"#;
        let handle = supervisor.spawn(sh("t9", script)).expect("spawn");
        let waiter = {
            let supervisor = Arc::clone(&supervisor);
            let handle = Arc::clone(&handle);
            thread::spawn(move || supervisor.await_exit(&handle, Duration::from_secs(60)))
        };
        let events = supervisor.stream_events(&handle).expect("stream").count();
        assert_eq!(events, 1);
        assert_eq!(
            waiter.join().expect("join").expect("await"),
            ExitOutcome::Success
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// Verifies no group member is left once a lone leader is reaped.
    #[test]
    fn reaped_leader_leaves_no_group() {
        let (_coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let handle = supervisor.spawn(sh("t10", "exit 0")).expect("spawn");
        drop(supervisor.stream_events(&handle).expect("stream"));
        let outcome = supervisor
            .await_exit(&handle, Duration::from_secs(10))
            .expect("await");
        assert_eq!(outcome, ExitOutcome::Success);
        assert!(!handle.group_alive());
    }

    #[test]
    fn stream_is_not_restartable() {
        let (_coordinator, supervisor) = supervisor(Duration::from_millis(200));
        let handle = supervisor.spawn(sh("t7", "true")).expect("spawn");
        let first = supervisor.stream_events(&handle).expect("first");
        assert!(supervisor.stream_events(&handle).is_err());
        drop(first);
        supervisor
            .await_exit(&handle, Duration::from_secs(10))
            .expect("await");
    }
}
