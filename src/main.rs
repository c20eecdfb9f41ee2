//! slinkd: interaction server for editor clients.
//!
//! Serves the built-in calculator runtime over the framed s-expression protocol.
use anyhow::Context;
use clap::Parser;
use log::info;
use slink::config::Config;
use slink::runtime::calc::Calc;
use slink::server::Server;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.config/slink/config.toml if it exists)
    #[clap(long, env = "SLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file.
    #[clap(long)]
    listen: Option<String>,

    /// Write the bound port into this file once listening.
    #[clap(long)]
    port_file: Option<PathBuf>,

    /// Stream output through a separate socket.
    #[clap(long)]
    dedicated_output: bool,

    /// Close connections silent for longer than this many seconds.
    #[clap(long)]
    idle_timeout: Option<u64>,

    /// Exit after the first connection ends (single-client mode).
    #[clap(long)]
    oneshot: bool,

    /// Write logs into this file instead of stderr.
    #[clap(long)]
    log_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(port_file) = args.port_file {
        config.port_file = Some(port_file);
    }
    if args.dedicated_output {
        config.dedicated_output = true;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = Some(secs);
    }
    slink::log::init(&config.log_level, args.log_file.as_deref())?;

    let port_file = config.port_file.clone();
    let server = Server::bind(config, Arc::new(Calc::new()))?;
    let addr = server.local_addr()?;
    if let Some(path) = port_file {
        std::fs::write(&path, addr.port().to_string())
            .with_context(|| format!("write port file {}", path.display()))?;
        info!(target: "dispatch", "port {} written to {}", addr.port(), path.display());
    }

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!(target: "dispatch", "interrupted, closing connections");
        shutdown.shutdown();
        std::process::exit(0);
    })
    .context("install ctrl-c handler")?;

    server.run(args.oneshot)
}
