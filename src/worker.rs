//! Worker process run-loop
//!
//! A worker owns one request handler and one cache. It takes connections
//! and console commands from the dispatcher over its control channel and
//! runs the staleness sweep as an ordinary task on the same run-loop.

use crate::cache::{self, SharedCache};
use crate::config::Config;
use crate::error::Result;
use crate::handler::{serve_connection, RequestHandler};
use crate::handoff::{ControlMessage, Receiver};
use crate::logging;
use std::io;
use std::os::fd::AsFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Worker {
    slot: usize,
    handler: Arc<RequestHandler>,
    keepalive: Duration,
    sweep_interval: Duration,
}

impl Worker {
    pub fn new(slot: usize, handler: Arc<RequestHandler>, keepalive: Duration, sweep_interval: Duration) -> Self {
        Self {
            slot,
            handler,
            keepalive,
            sweep_interval,
        }
    }

    pub fn from_config(config: &Config, slot: usize) -> Result<Self> {
        let handler = Arc::new(RequestHandler::from_config(config)?);
        Ok(Self::new(slot, handler, config.keepalive, config.sweep_interval))
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }

    /// Serve until the dispatcher hangs up.
    pub async fn run(self, receiver: Receiver) -> Result<()> {
        info!("Worker {} ({}) started", self.slot, std::process::id());
        let sweeper = spawn_sweeper(Arc::clone(self.handler.cache()), self.sweep_interval);

        loop {
            match receiver.recv().await {
                Ok(Some(message)) => self.on_message(message),
                Ok(None) => {
                    info!("Worker {}: dispatcher closed the channel, exiting", self.slot);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("Worker {}: ignoring bad control frame: {}", self.slot, e);
                }
                Err(e) => {
                    sweeper.abort();
                    return Err(e.into());
                }
            }
        }

        sweeper.abort();
        Ok(())
    }

    fn on_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::Connection(conn) => match adopt(conn) {
                Ok(stream) => {
                    debug!("Worker {} received a connection", self.slot);
                    tokio::spawn(serve_connection(
                        Arc::clone(&self.handler),
                        stream,
                        self.keepalive,
                    ));
                }
                Err(e) => warn!("Worker {}: could not adopt connection: {}", self.slot, e),
            },
            ControlMessage::ClearCache => {
                self.handler.cache().lock().clear();
                info!("Worker {}: cache cleared", self.slot);
            }
            ControlMessage::ListCache => {
                let (entries, stats) = {
                    let cache = self.handler.cache().lock();
                    (cache.list(), cache.stats())
                };
                info!(
                    "Worker {}: {} entries, {}/{} bytes, {} hits, {} misses, {} evictions",
                    self.slot,
                    stats.entries,
                    stats.total_size,
                    stats.max_size,
                    stats.hits,
                    stats.misses,
                    stats.evictions
                );
                for (key, size) in entries {
                    info!("Worker {}:   {} ({} bytes)", self.slot, key, size);
                }
            }
            ControlMessage::Verbose(on) => logging::set_verbose(on),
        }
    }
}

/// Take ownership of a handed-off socket on this run-loop.
fn adopt(conn: std::net::TcpStream) -> io::Result<TcpStream> {
    conn.set_nonblocking(true)?;
    let _ = conn.set_nodelay(true);
    TcpStream::from_std(conn)
}

/// Periodic staleness sweep. The first sweep runs one interval after start.
pub fn spawn_sweeper(cache: SharedCache, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = cache::sweep(&cache).await;
            if report.stale > 0 || report.expired > 0 {
                debug!(
                    "Sweep checked {} entries: {} stale, {} expired",
                    report.checked, report.stale, report.expired
                );
            }
        }
    })
}

/// Entry point of a worker process: the control channel is stdin.
pub async fn run_process(config: &Config, slot: usize) -> Result<()> {
    let channel = io::stdin().as_fd().try_clone_to_owned()?;
    let receiver = Receiver::from_std(std::os::unix::net::UnixStream::from(channel))?;
    Worker::from_config(config, slot)?.run(receiver).await
}
