use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use hoard::config::{self, Bootstrap};
use hoard::logging;
use hoard::server;

#[derive(Parser, Debug)]
#[command(name = "hoard", about = "Distributed caching reverse proxy", version)]
struct Cli {
    /// Config file path; built-in defaults when omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Listen address, overrides server.addr
    #[arg(long)]
    addr: Option<String>,

    /// Origin host, overrides origin.host
    #[arg(long)]
    origin: Option<String>,

    /// Comma separated peer addresses, overrides peers.addresses
    #[arg(long, value_delimiter = ',')]
    peers: Option<Vec<String>>,

    /// This process's peer address, overrides peers.self_addr
    #[arg(long = "self")]
    self_addr: Option<String>,

    /// Local store capacity in bytes, overrides cache.capacity_bytes
    #[arg(long)]
    capacity: Option<u64>,
}

impl Cli {
    fn apply(&self, cfg: &mut Bootstrap) {
        if let Some(addr) = &self.addr {
            cfg.server.addr = addr.clone();
        }
        if let Some(origin) = &self.origin {
            cfg.origin.host = origin.clone();
        }
        if let Some(peers) = &self.peers {
            cfg.peers.addresses = peers.clone();
        }
        if let Some(self_addr) = &self.self_addr {
            cfg.peers.self_addr = self_addr.clone();
        }
        if let Some(capacity) = self.capacity {
            cfg.cache.capacity_bytes = capacity;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = match &cli.config {
        Some(path) => config::load(path)?,
        None => (Bootstrap::default(), Vec::new()),
    };
    cli.apply(&mut cfg);

    logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }
    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    cfg.validate()?;

    if let Some(pidfile) = &cfg.pidfile {
        write_pid(pidfile)?;
    }

    match &cli.config {
        Some(path) => log::info!("hoard starting with config {}", path.display()),
        None => log::info!("hoard starting with default config"),
    }
    server::run(Arc::new(cfg)).await
}

fn write_pid(path: &str) -> Result<()> {
    let path = PathBuf::from(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create pid dir {}", parent.display()))?;
    }
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("write pid file {}", path.display()))
}
