//! A single supervised OS child process
//!
//! A [`Process`] owns one child from spawn to reap. Starting it launches
//! three tasks: one chunk reader per output pipe and a waiter that reaps the
//! child. The waiter emits the terminal event after both readers have
//! drained, so STOPPED is always the last event a process produces.
//! [`Process::stop`] cancels the process and returns only after all three
//! tasks are gone.

use crate::error::{Error, Result};
use crate::event::{LogSource, ProcessEvent, ProcessEventType, ProcessRecord, ProcessState};
use async_channel::{Receiver, Sender};
use async_process::unix::CommandExt;
use async_process::{Command as AsyncCommand, Stdio};
use chrono::Utc;
use futures_lite::future;
use futures_lite::io::{AsyncRead, AsyncReadExt};
use nix::unistd::{Gid, Uid, getgid, getuid};
use smol::Timer;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Size of a single output read
pub const CHUNK_SIZE: usize = 4096;

/// How long readers may keep draining after the child has been reaped
///
/// A grandchild that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to spawn the child, resolved ahead of time
#[derive(Debug, Clone)]
pub struct Launch {
    /// Canonical executable path
    pub program: PathBuf,
    /// Arguments after the program name
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Working directory
    pub cwd: PathBuf,
    /// User to run as
    pub uid: Uid,
    /// Group to run as
    pub gid: Gid,
}

impl Launch {
    /// Build the async command with piped output and a closed stdin
    pub fn prepare(&self) -> AsyncCommand {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Changing identity needs privileges; only ask for it when it differs
        if self.gid != getgid() {
            cmd.gid(self.gid.as_raw());
        }
        if self.uid != getuid() {
            cmd.uid(self.uid.as_raw());
        }
        cmd
    }
}

struct Inner {
    state: ProcessState,
    pid: Option<u32>,
    started_at: Option<chrono::DateTime<Utc>>,
    stopped_at: Option<chrono::DateTime<Utc>>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    error: Option<String>,
    /// Held by the task set while it runs; `None` once start has begun
    done_tx: Option<Sender<()>>,
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// One OS child process with a cancellable deadline
pub struct Process {
    id: u32,
    sid: u32,
    name: String,
    launch: Launch,
    timeout: Option<Duration>,
    events: Sender<ProcessEvent>,
    inner: Mutex<Inner>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    done_rx: Receiver<()>,
}

impl Process {
    /// Create a process in the NEW state; events go to `events`
    pub fn new(
        id: u32,
        sid: u32,
        name: impl Into<String>,
        launch: Launch,
        timeout: Option<Duration>,
        events: Sender<ProcessEvent>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);
        Self {
            id,
            sid,
            name: name.into(),
            launch,
            timeout,
            events,
            inner: Mutex::new(Inner {
                state: ProcessState::New,
                pid: None,
                started_at: None,
                stopped_at: None,
                exit_code: None,
                signal: None,
                error: None,
                done_tx: Some(done_tx),
            }),
            cancel_tx,
            cancel_rx,
            done_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Kernel-assigned id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Owning service id
    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.lock().state
    }

    /// OS pid once spawned
    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    /// Exit code; `None` until STOPPED or when a signal ended the process
    pub fn exit_code(&self) -> Option<i32> {
        let inner = self.lock();
        if inner.state == ProcessState::Stopped {
            inner.exit_code
        } else {
            None
        }
    }

    /// Returns true once cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_closed()
    }

    /// Point-in-time snapshot
    pub fn record(&self) -> ProcessRecord {
        let inner = self.lock();
        ProcessRecord {
            id: self.id,
            sid: self.sid,
            name: self.name.clone(),
            path: self.launch.program.clone(),
            pid: inner.pid,
            state: inner.state,
            started_at: inner.started_at,
            stopped_at: inner.stopped_at,
            exit_code: inner.exit_code,
            signal: inner.signal,
            error: inner.error.clone(),
        }
    }

    /// Spawn the child and its reader and waiter tasks
    ///
    /// Only a NEW process can start. A spawn failure moves the process to
    /// STOPPED, emits the terminal event carrying the error, and is also
    /// returned to the caller.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let done_tx = {
            let mut inner = self.lock();
            if inner.state != ProcessState::New {
                return Err(Error::bad_parameter(format!(
                    "process {} is {}, not NEW",
                    self.id, inner.state
                )));
            }
            match inner.done_tx.take() {
                Some(tx) => tx,
                None => {
                    return Err(Error::bad_parameter(format!(
                        "process {} is already starting",
                        self.id
                    )));
                }
            }
        };

        if self.is_cancelled() {
            self.abandon(Some("cancelled before start".to_string()), done_tx);
            return Ok(());
        }

        let mut child = match self.launch.prepare().spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = Error::spawn_failed(format!("{}: {e}", self.launch.program.display()));
                warn!(id = self.id, error = %err, "process failed to start");
                self.abandon(Some(err.to_string()), done_tx);
                return Err(err);
            }
        };

        let pid = child.id();
        let record = {
            let mut inner = self.lock();
            inner.state = ProcessState::Running;
            inner.pid = Some(pid);
            inner.started_at = Some(Utc::now());
            drop(inner);
            self.record()
        };
        debug!(id = self.id, pid, name = %self.name, "process started");
        let _ = self
            .events
            .try_send(ProcessEvent::new(ProcessEventType::Started { pid }, record));

        let stdout = child
            .stdout
            .take()
            .map(|pipe| smol::spawn(self.clone().read_output(LogSource::Stdout, pipe)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| smol::spawn(self.clone().read_output(LogSource::Stderr, pipe)));

        let this = self.clone();
        smol::spawn(async move {
            let result = match this.wait(&mut child).await {
                Outcome::Exited(status) => status,
                Outcome::Cancelled => this.kill_and_reap(&mut child).await,
                Outcome::TimedOut => {
                    debug!(id = this.id, "process deadline elapsed");
                    this.kill_and_reap(&mut child).await
                }
            };

            let readers = async {
                if let Some(task) = stdout {
                    task.await;
                }
                if let Some(task) = stderr {
                    task.await;
                }
            };
            let drained = future::or(async { readers.await; true }, async {
                Timer::after(DRAIN_GRACE).await;
                false
            })
            .await;
            if !drained {
                warn!(id = this.id, "output readers did not drain, dropping them");
            }

            let record = this.finish(result);
            let error = record.error.clone();
            let _ = this.events.try_send(ProcessEvent::stopped(record, error));
            drop(done_tx);
        })
        .detach();

        Ok(())
    }

    /// Race child exit against cancellation and the deadline
    async fn wait(&self, child: &mut async_process::Child) -> Outcome {
        let exited = async { Outcome::Exited(child.status().await) };
        let cancelled = async {
            let _ = self.cancel_rx.recv().await;
            Outcome::Cancelled
        };
        let deadline = async {
            match self.timeout {
                Some(timeout) => {
                    Timer::after(timeout).await;
                    Outcome::TimedOut
                }
                None => future::pending::<Outcome>().await,
            }
        };
        future::or(exited, future::or(cancelled, deadline)).await
    }

    async fn kill_and_reap(&self, child: &mut async_process::Child) -> io::Result<ExitStatus> {
        self.mark_stopping();
        if let Err(e) = child.kill() {
            debug!(id = self.id, error = %e, "kill failed");
        }
        child.status().await
    }

    async fn read_output<R>(self: Arc<Self>, source: LogSource, mut pipe: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let event = ProcessEvent::output(source, self.record(), buf[..n].to_vec());
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(id = self.id, ?source, error = %e, "output read failed");
                    break;
                }
            }
        }
    }

    fn mark_stopping(&self) {
        let mut inner = self.lock();
        if inner.state == ProcessState::Running {
            inner.state = ProcessState::Stopping;
        }
    }

    fn finish(&self, result: io::Result<ExitStatus>) -> ProcessRecord {
        {
            let mut inner = self.lock();
            inner.state = ProcessState::Stopped;
            inner.stopped_at = Some(Utc::now());
            match result {
                Ok(status) => {
                    inner.exit_code = status.code();
                    inner.signal = status.signal();
                    inner.error = describe_failure(&status);
                }
                Err(e) => inner.error = Some(format!("wait failed: {e}")),
            }
        }
        self.record()
    }

    /// Move a process that never ran straight to STOPPED and emit the
    /// terminal event
    fn abandon(&self, error: Option<String>, done_tx: Sender<()>) {
        {
            let mut inner = self.lock();
            inner.state = ProcessState::Stopped;
            inner.stopped_at = Some(Utc::now());
            inner.error = error.clone();
        }
        let _ = self
            .events
            .try_send(ProcessEvent::stopped(self.record(), error));
        drop(done_tx);
    }

    /// Cancel the process and wait until every task it started has finished
    ///
    /// Stopping a NEW process moves it to STOPPED without spawning. No event
    /// for this process is emitted after `stop` returns.
    pub async fn stop(&self) {
        let never_started = {
            let mut inner = self.lock();
            if inner.state == ProcessState::Running {
                inner.state = ProcessState::Stopping;
            }
            if inner.state == ProcessState::New {
                inner.done_tx.take()
            } else {
                None
            }
        };
        self.cancel_tx.close();

        if let Some(done_tx) = never_started {
            self.abandon(Some("stopped before start".to_string()), done_tx);
        }
        // Resolves once every clone of the done sender has been dropped
        let _ = self.done_rx.recv().await;
    }
}

fn describe_failure(status: &ExitStatus) -> Option<String> {
    if status.success() {
        None
    } else if let Some(code) = status.code() {
        Some(format!("exit status {code}"))
    } else if let Some(signal) = status.signal() {
        Some(format!("terminated by signal {signal}"))
    } else {
        Some(status.to_string())
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("sid", &self.sid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(script: &str) -> Launch {
        Launch {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("GREETING".to_string(), "hello".to_string())],
            cwd: std::env::temp_dir(),
            uid: getuid(),
            gid: getgid(),
        }
    }

    fn process(script: &str, timeout: Option<Duration>) -> (Arc<Process>, Receiver<ProcessEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Arc::new(Process::new(1, 2, "sh", launch(script), timeout, tx)), rx)
    }

    async fn collect(rx: Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv().await {
            let last = event.is_terminal();
            events.push(event);
            if last {
                break;
            }
        }
        events
    }

    #[smol_potat::test]
    async fn test_clean_exit_streams_output() {
        let (p, rx) = process("echo $GREETING; echo oops >&2", None);
        p.start().unwrap();
        let events = collect(rx).await;

        assert!(matches!(events[0].event_type, ProcessEventType::Started { .. }));
        let stdout: String = events
            .iter()
            .filter(|e| e.event_type == ProcessEventType::Stdout)
            .filter_map(|e| e.text())
            .collect();
        assert_eq!(stdout, "hello\n");
        assert!(events.iter().any(|e| e.event_type == ProcessEventType::Stderr));

        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.error, None);
        assert_eq!(p.state(), ProcessState::Stopped);
        assert_eq!(p.exit_code(), Some(0));
    }

    #[smol_potat::test]
    async fn test_nonzero_exit_carries_error() {
        let (p, rx) = process("exit 3", None);
        p.start().unwrap();
        let events = collect(rx).await;
        let last = events.last().unwrap();
        assert_eq!(last.error.as_deref(), Some("exit status 3"));
        assert_eq!(p.exit_code(), Some(3));
    }

    #[smol_potat::test]
    async fn test_stop_waits_for_tasks() {
        let (p, rx) = process("sleep 30", None);
        p.start().unwrap();
        assert_eq!(p.state(), ProcessState::Running);
        assert_eq!(p.exit_code(), None);

        p.stop().await;
        assert_eq!(p.state(), ProcessState::Stopped);
        assert!(p.is_cancelled());

        let events = collect(rx.clone()).await;
        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.record.signal, Some(9));
        assert!(rx.try_recv().is_err());
    }

    #[smol_potat::test]
    async fn test_timeout_kills_process() {
        let (p, rx) = process("sleep 30", Some(Duration::from_millis(100)));
        p.start().unwrap();
        let events = collect(rx).await;
        let last = events.last().unwrap();
        assert_eq!(last.error.as_deref(), Some("terminated by signal 9"));
        assert_eq!(p.exit_code(), None);
    }

    #[smol_potat::test]
    async fn test_stop_before_start() {
        let (p, rx) = process("true", None);
        p.stop().await;
        assert_eq!(p.state(), ProcessState::Stopped);
        assert!(p.start().unwrap_err().is_bad_parameter());
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_terminal());
    }

    #[smol_potat::test]
    async fn test_spawn_failure() {
        let (tx, rx) = async_channel::unbounded();
        let mut bad = launch("true");
        bad.program = PathBuf::from("/nonexistent/program");
        let p = Arc::new(Process::new(5, 0, "bad", bad, None, tx));
        assert!(matches!(p.start(), Err(Error::SpawnFailed { .. })));
        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].error.is_some());
        p.stop().await;
    }
}
