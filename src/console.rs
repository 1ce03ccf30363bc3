//! Line-oriented administrative console on the dispatcher's stdin

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const HELP: &str = "\
Commands:
  stop            stop the dispatcher and all workers
  verbose on|off  toggle debug logging
  cache clear     empty every worker's cache
  cache list      log every worker's cached keys
  help            show this help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Stop,
    Verbose(bool),
    CacheClear,
    CacheList,
    Help,
}

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["stop"] => Ok(AdminCommand::Stop),
            ["verbose", "on"] => Ok(AdminCommand::Verbose(true)),
            ["verbose", "off"] => Ok(AdminCommand::Verbose(false)),
            ["cache", "clear"] => Ok(AdminCommand::CacheClear),
            ["cache", "list"] => Ok(AdminCommand::CacheList),
            ["help"] => Ok(AdminCommand::Help),
            _ => Err(format!("Unknown command: {}", line.trim())),
        }
    }
}

/// Read commands from stdin on a separate task so request dispatch never
/// waits on the console.
pub fn spawn_stdin() -> mpsc::Receiver<AdminCommand> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match AdminCommand::parse(&line) {
                    Ok(command) => {
                        if tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => println!("{}\nType 'help' for a list of commands.", e),
                },
                Ok(None) => {
                    debug!("Console input closed");
                    break;
                }
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
