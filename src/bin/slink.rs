//! Console client for slinkd.
use anyhow::Context;
use clap::Parser;
use slink::client::console::Console;
use std::net::{SocketAddr, ToSocketAddrs};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address.
    #[clap(long, default_value = "127.0.0.1:4005")]
    connect: String,

    /// Package forms are evaluated in.
    #[clap(long, default_value = "USER")]
    package: String,

    /// Keep logging while the console owns the terminal.
    #[clap(long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    slink::log::init("warn", None)?;
    if !args.verbose {
        slink::log::disable();
    }

    let addr: SocketAddr = args
        .connect
        .to_socket_addrs()
        .with_context(|| format!("resolve {}", args.connect))?
        .next()
        .with_context(|| format!("no address for {}", args.connect))?;

    let result = Console::run(addr, &args.package);
    slink::log::enable();
    result
}
