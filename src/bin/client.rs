//! Interactive TFTP client: `tftp-client HOST [PORT]`.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::io::{AsyncBufReadExt, BufReader};
use trivial_tftp::client;
use trivial_tftp::session::RetryPolicy;

fn parse_args() -> Result<SocketAddr> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let host = match args.first() {
        Some(host) => host.as_str(),
        None => bail!("usage: tftp-client HOST [PORT]"),
    };
    let port: u16 = match args.get(1) {
        Some(raw) => raw.parse().with_context(|| format!("invalid port '{raw}'"))?,
        None => 69,
    };

    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("couldn't resolve '{host}'"))?
        .next()
        .with_context(|| format!("'{host}' resolved to no addresses"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let server = parse_args()?;
    println!("Fetching from {server}. Enter a file name, or \"quit\" to end.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("get> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let file_name = line.trim();
        if file_name == "quit" {
            break;
        }
        if file_name.is_empty() {
            continue;
        }

        let outcome = client::fetch(file_name, server, RetryPolicy::default()).await;
        println!("{outcome}");
    }

    Ok(())
}
