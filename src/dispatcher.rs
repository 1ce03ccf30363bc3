//! Dispatcher process and worker pool
//!
//! The dispatcher owns the public listener. Accepted connections are not
//! read; each is handed, still untouched, to the next worker in
//! round-robin order. Worker exit is observed through the child's exit
//! status, and a dead worker is replaced by a freshly launched one
//! appended to the pool. Connections already handed to a worker that dies
//! are lost with it.

use crate::config::Config;
use crate::console::{self, AdminCommand};
use crate::error::{Error, Result};
use crate::handoff::{ControlMessage, SendError, Sender};
use crate::logging;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const RELAUNCH_RETRY: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves with a description of the exit status once a worker is gone.
/// Dropping it must stop the worker; the process launcher kills the child.
pub type ExitFuture = Pin<Box<dyn Future<Output = String> + Send>>;

/// A worker as seen right after launch.
pub struct LaunchedWorker {
    pub pid: Option<u32>,
    pub sender: Sender,
    pub exited: ExitFuture,
}

/// Starts workers. The process launcher is the production one; tests
/// launch in-process workers.
pub trait Launcher: Send {
    fn launch(&mut self, slot: usize) -> Result<LaunchedWorker>;
}

/// Launches the current executable in worker mode with the control
/// channel as its stdin.
pub struct ProcessLauncher {
    exe: PathBuf,
    config: Config,
}

impl ProcessLauncher {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            config,
        })
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, slot: usize) -> Result<LaunchedWorker> {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair()?;
        let mut child = Command::new(&self.exe)
            .args(self.config.worker_args(slot))
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        let sender = Sender::from_std(ours)?;
        let exited: ExitFuture = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            }
        });
        Ok(LaunchedWorker {
            pid,
            sender,
            exited,
        })
    }
}

/// Exit notice delivered to the dispatcher loop.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub id: u64,
    pub status: String,
}

struct WorkerRecord {
    id: u64,
    slot: usize,
    pid: Option<u32>,
    sender: Sender,
    alive: bool,
    stop: Option<oneshot::Sender<()>>,
}

impl WorkerRecord {
    /// Stop routing to this worker and have its watcher drop it. The exit
    /// notice that follows launches the replacement.
    fn retire(&mut self, reason: &dyn std::fmt::Display) {
        warn!("Worker {} unreachable, retiring: {}", self.id, reason);
        self.alive = false;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub struct WorkerPool<L: Launcher> {
    launcher: L,
    size: usize,
    workers: Vec<WorkerRecord>,
    cursor: usize,
    next_id: u64,
    exits: mpsc::UnboundedSender<WorkerExit>,
    watchers: FxHashMap<u64, JoinHandle<()>>,
}

impl<L: Launcher> WorkerPool<L> {
    /// Launch `size` workers. Exit notices go to `exits`.
    pub fn start(launcher: L, size: usize, exits: mpsc::UnboundedSender<WorkerExit>) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }
        let mut pool = Self {
            launcher,
            size,
            workers: Vec::with_capacity(size),
            cursor: 0,
            next_id: 0,
            exits,
            watchers: FxHashMap::default(),
        };
        for slot in 0..size {
            pool.launch(slot)?;
        }
        Ok(pool)
    }

    fn launch(&mut self, slot: usize) -> Result<u64> {
        let launched = self.launcher.launch(slot)?;
        let id = self.next_id;
        self.next_id += 1;

        let exits = self.exits.clone();
        let exited = launched.exited;
        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(async move {
            let status = tokio::select! {
                status = exited => status,
                // A dropped stop handle (pool shutdown) leaves the worker be.
                Ok(()) = stop_rx => "retired by dispatcher".to_string(),
            };
            let _ = exits.send(WorkerExit { id, status });
        });
        self.watchers.insert(id, watcher);

        info!("Worker {} started in slot {} (pid {:?})", id, slot, launched.pid);
        self.workers.push(WorkerRecord {
            id,
            slot,
            pid: launched.pid,
            sender: launched.sender,
            alive: true,
            stop: Some(stop_tx),
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Worker ids in dispatch order.
    pub fn worker_ids(&self) -> Vec<u64> {
        self.workers.iter().map(|w| w.id).collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Hand `conn` to the next live worker. A worker whose channel refuses
    /// the frame, or stays full past `SEND_TIMEOUT`, is retired and the
    /// next one is tried; the connection is only dropped when no worker
    /// accepts it.
    pub async fn dispatch(&mut self, conn: std::net::TcpStream) -> Result<u64> {
        let mut message = ControlMessage::Connection(conn);
        for _ in 0..self.workers.len() {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % self.workers.len();

            let worker = &mut self.workers[index];
            if !worker.alive {
                continue;
            }
            match worker.sender.send_within(message, SEND_TIMEOUT).await {
                Ok(()) => {
                    debug!("Connection handed to worker {}", worker.id);
                    return Ok(worker.id);
                }
                Err(SendError { error, message: returned }) => {
                    worker.retire(&error);
                    message = returned;
                }
            }
        }
        Err(Error::Handoff("no live worker accepted the connection".into()))
    }

    /// Send a console command to every live worker.
    pub async fn broadcast(&mut self, make: impl Fn() -> ControlMessage) {
        for worker in self.workers.iter_mut().filter(|w| w.alive) {
            if let Err(e) = worker.sender.send_within(make(), SEND_TIMEOUT).await {
                worker.retire(&e.error);
            }
        }
    }

    /// Drop the record of an exited worker and launch its replacement at
    /// the end of the pool.
    pub fn handle_exit(&mut self, exit: WorkerExit) {
        self.watchers.remove(&exit.id);
        let Some(index) = self.workers.iter().position(|w| w.id == exit.id) else {
            return;
        };
        let dead = self.workers.remove(index);
        warn!(
            "Worker {} (pid {:?}) died: {}",
            dead.id, dead.pid, exit.status
        );

        if index < self.cursor {
            self.cursor -= 1;
        }
        if let Err(e) = self.launch(dead.slot) {
            error!("Failed to replace worker in slot {}: {}", dead.slot, e);
        }
        self.cursor = if self.workers.is_empty() {
            0
        } else {
            self.cursor % self.workers.len()
        };
    }

    /// Relaunch workers for slots whose replacement failed earlier.
    pub fn fill(&mut self) {
        while self.workers.len() < self.size {
            let mut slot = 0;
            while self.workers.iter().any(|w| w.slot == slot) {
                slot += 1;
            }
            if let Err(e) = self.launch(slot) {
                error!("Failed to launch worker in slot {}: {}", slot, e);
                return;
            }
        }
    }

    /// Close every channel, wait briefly for workers to exit on their own,
    /// then stop watching (which kills stragglers).
    pub async fn shutdown(mut self, exits: &mut mpsc::UnboundedReceiver<WorkerExit>) {
        let mut remaining = self.workers.len();
        self.workers.clear();

        let waited = timeout(SHUTDOWN_GRACE, async {
            while remaining > 0 {
                match exits.recv().await {
                    Some(exit) => {
                        debug!("Worker {} exited: {}", exit.id, exit.status);
                        remaining -= 1;
                    }
                    None => break,
                }
            }
        })
        .await;
        if waited.is_err() {
            warn!("{} workers did not exit in time, killing", remaining);
        }
        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
    }
}

/// Accept loop. Runs until `shutdown` resolves or the console says stop.
pub async fn serve<L, S>(
    listener: TcpListener,
    launcher: L,
    workers: usize,
    mut commands: mpsc::Receiver<AdminCommand>,
    shutdown: S,
) -> Result<()>
where
    L: Launcher,
    S: Future<Output = ()>,
{
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
    let mut pool = WorkerPool::start(launcher, workers, exit_tx)?;
    let mut retry = interval(RELAUNCH_RETRY);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                debug!("Dispatcher received a connection from {}", peer);
                match stream.into_std() {
                    Ok(conn) => {
                        if let Err(e) = pool.dispatch(conn).await {
                            error!("Dropping connection from {}: {}", peer, e);
                        }
                    }
                    Err(e) => warn!("Could not detach connection from {}: {}", peer, e),
                }
            }
            Some(exit) = exit_rx.recv() => pool.handle_exit(exit),
            Some(command) = commands.recv() => {
                if !apply_command(&mut pool, command).await {
                    info!("Stop requested from console");
                    break;
                }
            }
            _ = retry.tick() => pool.fill(),
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping dispatcher...");
                break;
            }
        }
    }

    drop(listener);
    pool.shutdown(&mut exit_rx).await;
    info!("Dispatcher shutdown complete");
    Ok(())
}

/// Returns false when the dispatcher should stop.
async fn apply_command<L: Launcher>(pool: &mut WorkerPool<L>, command: AdminCommand) -> bool {
    match command {
        AdminCommand::Stop => return false,
        AdminCommand::Verbose(on) => {
            logging::set_verbose(on);
            pool.broadcast(|| ControlMessage::Verbose(on)).await;
            info!("Verbose logging {}", if on { "on" } else { "off" });
        }
        AdminCommand::CacheClear => pool.broadcast(|| ControlMessage::ClearCache).await,
        AdminCommand::CacheList => pool.broadcast(|| ControlMessage::ListCache).await,
        AdminCommand::Help => println!("{}", console::HELP),
    }
    true
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Entry point of the dispatcher process.
pub async fn run(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    info!(
        "Dispatcher {} listening on {} with {} workers",
        std::process::id(),
        listener.local_addr()?,
        config.workers
    );
    let workers = config.workers;
    let launcher = ProcessLauncher::new(config)?;
    serve(listener, launcher, workers, console::spawn_stdin(), shutdown_signal()).await
}
