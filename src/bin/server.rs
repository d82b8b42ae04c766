//! TFTP server: `tftp-server [PORT]`, serving the current directory.

use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use trivial_tftp::server::Dispatcher;
use trivial_tftp::session::RetryPolicy;

fn parse_port() -> Result<u16> {
    match std::env::args().nth(1) {
        Some(raw) => raw.parse().with_context(|| format!("invalid port '{raw}'")),
        None => Ok(69),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let port = parse_port()?;
    let root = std::env::current_dir().context("couldn't determine the working directory")?;
    let dispatcher = Dispatcher::bind(
        (Ipv4Addr::UNSPECIFIED, port).into(),
        root,
        RetryPolicy::default(),
    )
    .context("couldn't bind the request socket")?;

    tokio::select! {
        result = dispatcher.serve() => {
            result.context("request loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            // In-flight sessions are abandoned; partial files stay put.
            log::info!("Shutting down");
        }
    }

    Ok(())
}
