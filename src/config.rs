//! Command-line and environment configuration

use crate::error::{Error, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6060;
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 64 * 1024 * 1024; // 64MB
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 5;
pub const MAX_REQUEST_SIZE: usize = 8192;

/// Static content server with a compressed in-memory cache and a
/// multi-process worker pool
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory served as the sandbox root
    #[arg(long, env = "CACHET_ROOT", default_value = "public")]
    pub root: PathBuf,

    /// Listen address
    #[arg(long, env = "CACHET_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Listen port
    #[arg(long, env = "CACHET_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Worker processes (defaults to available CPU cores)
    #[arg(long, env = "CACHET_WORKERS")]
    pub workers: Option<usize>,

    /// Upper bound for the per-worker cache, in bytes
    #[arg(long, env = "CACHET_MAX_CACHE_SIZE", default_value_t = DEFAULT_MAX_CACHE_SIZE)]
    pub max_cache_size: u64,

    /// Cache entry time-to-live in seconds (0 disables expiry)
    #[arg(long, env = "CACHET_CACHE_TTL_SECS", default_value_t = DEFAULT_CACHE_TTL_SECS)]
    pub cache_ttl_secs: u64,

    /// Seconds between staleness sweeps
    #[arg(long, env = "CACHET_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    /// Gzip compression level (0-9)
    #[arg(long, env = "CACHET_GZIP_LEVEL", default_value_t = 6)]
    pub gzip_level: u32,

    /// Index document served in place of a directory listing
    #[arg(long, env = "CACHET_INDEX")]
    pub index: Option<String>,

    /// HTML template for directory listings
    #[arg(long, env = "CACHET_LISTING_TEMPLATE")]
    pub listing_template: Option<PathBuf>,

    /// Idle seconds allowed between keep-alive requests
    #[arg(long, env = "CACHET_KEEPALIVE_SECS", default_value_t = DEFAULT_KEEPALIVE_SECS)]
    pub keepalive_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CACHET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "CACHET_LOG_JSON")]
    pub log_json: bool,

    /// Run as a pool worker in the given slot; the control channel is stdin
    #[arg(long, hide = true)]
    pub worker_slot: Option<usize>,
}

/// Validated server configuration shared by the dispatcher and workers.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub addr: SocketAddr,
    pub workers: usize,
    pub max_cache_size: u64,
    pub cache_ttl: Option<Duration>,
    pub sweep_interval: Duration,
    pub gzip_level: u32,
    pub index: Option<String>,
    pub listing_template: Option<PathBuf>,
    pub keepalive: Duration,
    pub log_level: String,
    pub log_json: bool,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        let ip: IpAddr = args
            .bind
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address {}: {}", args.bind, e)))?;
        let addr = SocketAddr::new(ip, args.port);

        let workers = match args.workers {
            Some(0) => return Err(Error::Config("workers must be at least 1".into())),
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };

        if args.gzip_level > 9 {
            return Err(Error::Config(format!(
                "gzip level {} out of range 0-9",
                args.gzip_level
            )));
        }
        if args.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep interval must be positive".into()));
        }

        Ok(Self {
            root: args.root.clone(),
            addr,
            workers,
            max_cache_size: args.max_cache_size,
            cache_ttl: (args.cache_ttl_secs > 0).then(|| Duration::from_secs(args.cache_ttl_secs)),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            gzip_level: args.gzip_level,
            index: args.index.clone(),
            listing_template: args.listing_template.clone(),
            keepalive: Duration::from_secs(args.keepalive_secs),
            log_level: args.log_level.clone(),
            log_json: args.log_json,
        })
    }

    /// Command-line arguments that reproduce this configuration in a
    /// worker process occupying `slot`.
    pub fn worker_args(&self, slot: usize) -> Vec<String> {
        let mut args = vec![
            "--root".to_string(),
            self.root.display().to_string(),
            "--bind".to_string(),
            self.addr.ip().to_string(),
            "--port".to_string(),
            self.addr.port().to_string(),
            "--workers".to_string(),
            self.workers.to_string(),
            "--max-cache-size".to_string(),
            self.max_cache_size.to_string(),
            "--cache-ttl-secs".to_string(),
            self.cache_ttl.map_or(0, |ttl| ttl.as_secs()).to_string(),
            "--sweep-interval-secs".to_string(),
            self.sweep_interval.as_secs().to_string(),
            "--gzip-level".to_string(),
            self.gzip_level.to_string(),
            "--keepalive-secs".to_string(),
            self.keepalive.as_secs().to_string(),
            "--log-level".to_string(),
            self.log_level.clone(),
        ];
        if let Some(index) = &self.index {
            args.push("--index".to_string());
            args.push(index.clone());
        }
        if let Some(template) = &self.listing_template {
            args.push("--listing-template".to_string());
            args.push(template.display().to_string());
        }
        if self.log_json {
            args.push("--log-json".to_string());
        }
        args.push("--worker-slot".to_string());
        args.push(slot.to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["cachet"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(&parse(&[])).unwrap();
        assert_eq!(config.addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_cache_size, DEFAULT_MAX_CACHE_SIZE);
        assert_eq!(config.cache_ttl, Some(Duration::from_secs(300)));
        assert!(config.workers >= 1);
        assert!(config.index.is_none());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(Config::from_args(&parse(&["--workers", "0"])).is_err());
    }

    #[test]
    fn test_ttl_zero_disables_expiry() {
        let config = Config::from_args(&parse(&["--cache-ttl-secs", "0"])).unwrap();
        assert!(config.cache_ttl.is_none());
    }

    #[test]
    fn test_worker_args_round_trip() {
        let config = Config::from_args(&parse(&[
            "--root",
            "/srv/www",
            "--port",
            "7070",
            "--workers",
            "3",
            "--index",
            "index.html",
            "--log-json",
        ]))
        .unwrap();

        let mut argv = vec!["cachet".to_string()];
        argv.extend(config.worker_args(2));
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.worker_slot, Some(2));

        let relaunched = Config::from_args(&args).unwrap();
        assert_eq!(relaunched.root, PathBuf::from("/srv/www"));
        assert_eq!(relaunched.addr, config.addr);
        assert_eq!(relaunched.workers, 3);
        assert_eq!(relaunched.index.as_deref(), Some("index.html"));
        assert!(relaunched.log_json);
    }
}
