//! Process table, background run loop and event fan-out

use crate::allocator::IdAllocator;
use crate::definition::ProcessDefinition;
use crate::error::{Error, Result};
use crate::event::{EventFilter, ProcessEvent, ProcessRecord, ProcessState};
use crate::process::{Launch, Process};
use crate::sandbox;
use async_channel::{Receiver, Sender};
use futures::future::join_all;
use futures::lock::Mutex;
use futures_lite::future;
use smol::Task;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use tracing::{debug, info, warn};

/// Receiving end of an event subscription
pub type EventReceiver = Receiver<ProcessEvent>;

type Subscribers = std::sync::Mutex<Vec<(EventFilter, Sender<ProcessEvent>)>>;

struct Shared {
    root: PathBuf,
    processes: Mutex<HashMap<u32, Arc<Process>>>,
    allocator: std::sync::Mutex<IdAllocator>,
    subscribers: Subscribers,
    run_tx: Sender<u32>,
    end_tx: Sender<u32>,
    closed: AtomicBool,
}

enum Signal {
    Stop,
    Run(u32),
    End(u32),
}

/// Local process manager rooted at one directory
///
/// Every executable the kernel runs must resolve to a regular file under the
/// root. Creation is synchronous and returns the new id at once; the process
/// is started by the background loop and reports everything after spawn
/// through the event stream.
pub struct Kernel {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
    loop_task: Mutex<Option<Task<()>>>,
}

impl Kernel {
    /// Create a kernel for `root`, which must be an existing directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_allocator(root, IdAllocator::new())
    }

    /// Create a kernel drawing process ids from `allocator`
    pub fn with_allocator(root: impl AsRef<Path>, allocator: IdAllocator) -> Result<Self> {
        let root = sandbox::resolve_root(root.as_ref())?;
        let (run_tx, run_rx) = async_channel::unbounded();
        let (end_tx, end_rx) = async_channel::unbounded();
        let (stop_tx, stop_rx) = async_channel::bounded(1);

        let shared = Arc::new(Shared {
            root,
            processes: Mutex::new(HashMap::new()),
            allocator: std::sync::Mutex::new(allocator),
            subscribers: std::sync::Mutex::new(Vec::new()),
            run_tx,
            end_tx,
            closed: AtomicBool::new(false),
        });

        let task = smol::spawn(run_loop(shared.clone(), run_rx, end_rx, stop_rx));
        info!(root = %shared.root.display(), "kernel started");

        Ok(Self {
            shared,
            stop_tx,
            loop_task: Mutex::new(Some(task)),
        })
    }

    /// Canonical root directory
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(Error::unavailable("kernel is closed"))
        } else {
            Ok(())
        }
    }

    /// Liveness check
    pub fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    /// Validate a definition, register a NEW process and queue it to run
    pub async fn create_process(&self, def: &ProcessDefinition) -> Result<u32> {
        self.ensure_open()?;
        let root = &self.shared.root;
        let program = sandbox::resolve_executable(root, &def.path)?;
        let cwd = sandbox::resolve_cwd(root, &def.cwd)?;
        let uid = sandbox::resolve_user(&def.user)?;
        let gid = sandbox::resolve_group(&def.group)?;

        let launch = Launch {
            program,
            args: def.argv(),
            env: def
                .env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            cwd,
            uid,
            gid,
        };

        let (events_tx, events_rx) = async_channel::unbounded();
        let id = {
            let mut table = self.shared.processes.lock().await;
            let id = self
                .shared
                .allocator
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .allocate_with(|id| table.contains_key(&id));
            if id == 0 {
                return Err(Error::internal("process id space exhausted"));
            }
            let process = Process::new(id, def.sid, &def.name, launch, def.deadline(), events_tx);
            table.insert(id, Arc::new(process));
            id
        };

        smol::spawn(forward_events(Arc::downgrade(&self.shared), events_rx)).detach();
        let _ = self.shared.run_tx.try_send(id);
        info!(id, sid = def.sid, path = %def.path, "process created");
        Ok(id)
    }

    async fn lookup(&self, id: u32) -> Result<Arc<Process>> {
        self.shared
            .processes
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("process {id}")))
    }

    /// Start a NEW process now; a process that already left NEW is left alone
    pub async fn run_process(&self, id: u32) -> Result<()> {
        self.ensure_open()?;
        let process = self.lookup(id).await?;
        start(&process);
        Ok(())
    }

    /// Stop a process and wait for its tasks to finish
    pub async fn stop_process(&self, id: u32) -> Result<()> {
        let process = self.lookup(id).await?;
        debug!(id, "stopping process");
        process.stop().await;
        Ok(())
    }

    /// Drop a STOPPED process from the table
    pub async fn forget_process(&self, id: u32) -> Result<()> {
        let mut table = self.shared.processes.lock().await;
        let process = table
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("process {id}")))?;
        if process.state() != ProcessState::Stopped {
            return Err(Error::bad_parameter(format!(
                "process {id} is {}",
                process.state()
            )));
        }
        table.remove(&id);
        debug!(id, "process forgotten");
        Ok(())
    }

    /// Snapshot of processes matching `id` and `sid` (0 matches any), by id
    pub async fn processes(&self, id: u32, sid: u32) -> Vec<ProcessRecord> {
        let table = self.shared.processes.lock().await;
        let mut records: Vec<_> = table
            .values()
            .filter(|p| (id == 0 || p.id() == id) && (sid == 0 || p.sid() == sid))
            .map(|p| p.record())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Root-relative paths of executable files under the root
    pub async fn executables(&self, recursive: bool) -> Result<Vec<String>> {
        self.ensure_open()?;
        let root = self.shared.root.clone();
        smol::unblock(move || sandbox::find_executables(&root, recursive)).await
    }

    /// Subscribe to process events
    pub fn stream_events(&self, filter: EventFilter) -> Result<EventReceiver> {
        self.ensure_open()?;
        let (tx, rx) = async_channel::unbounded();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((filter, tx));
        Ok(rx)
    }

    /// Stop every process, stop the loop, release the table
    ///
    /// Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let live: Vec<Arc<Process>> = self.shared.processes.lock().await.values().cloned().collect();
        info!(count = live.len(), "kernel closing");
        join_all(live.iter().map(|p| p.stop())).await;

        self.stop_tx.close();
        if let Some(task) = self.loop_task.lock().await.take() {
            task.await;
        }

        self.shared.processes.lock().await.clear();
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

fn start(process: &Arc<Process>) {
    if process.state() != ProcessState::New {
        return;
    }
    // The process already emitted its terminal event on failure
    if let Err(e) = process.start() {
        warn!(id = process.id(), error = %e, "process start failed");
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    run_rx: Receiver<u32>,
    end_rx: Receiver<u32>,
    stop_rx: Receiver<()>,
) {
    loop {
        let stop = async {
            let _ = stop_rx.recv().await;
            Signal::Stop
        };
        let run = async { run_rx.recv().await.map_or(Signal::Stop, Signal::Run) };
        let end = async { end_rx.recv().await.map_or(Signal::Stop, Signal::End) };

        match future::or(stop, future::or(run, end)).await {
            Signal::Stop => break,
            Signal::Run(id) => {
                let process = shared.processes.lock().await.get(&id).cloned();
                match process {
                    Some(process) => start(&process),
                    None => debug!(id, "process vanished before run"),
                }
            }
            Signal::End(id) => {
                let record = shared.processes.lock().await.get(&id).map(|p| p.record());
                if let Some(record) = record {
                    info!(
                        id,
                        exit_code = ?record.exit_code,
                        signal = ?record.signal,
                        error = ?record.error,
                        "process ended"
                    );
                }
            }
        }
    }
    debug!("kernel loop stopped");
}

/// Publish one process's events to subscribers until its terminal event
async fn forward_events(shared: Weak<Shared>, events: Receiver<ProcessEvent>) {
    while let Ok(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let terminal = event.is_terminal();
        let id = event.id();
        publish(&shared.subscribers, &event);
        if terminal {
            let _ = shared.end_tx.try_send(id);
            break;
        }
    }
}

fn publish(subscribers: &Subscribers, event: &ProcessEvent) {
    let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
    subscribers.retain(|(filter, tx)| {
        if tx.is_closed() {
            return false;
        }
        !filter.matches(event) || tx.try_send(event.clone()).is_ok()
    });
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("root", &self.shared.root)
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
