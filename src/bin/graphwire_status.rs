//! graphwire-status - liveness/status probe for a graphd pool
//!
//! Connects to the given addresses and issues one status request, printing
//! the parsed reply body and the cost of obtaining it.
//!
//! Usage:
//!   graphwire-status host:port [host:port ...] [--name statistics] [--verbose]

use anyhow::{bail, Context, Result};

use graphwire::{Address, ConnectorConfig, GraphConnector, TcpConnector, Varenv};

struct Args {
    addresses: Vec<Address>,
    name: String,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let mut addresses = Vec::new();
    let mut name = "statistics".to_string();
    let mut verbose = false;

    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--name" => {
                name = argv.next().context("--name requires a value")?;
            }
            "--verbose" => verbose = true,
            "--help" | "-h" => {
                eprintln!("usage: graphwire-status host:port [host:port ...] [--name NAME] [--verbose]");
                std::process::exit(0);
            }
            other => {
                let (host, port) = other
                    .rsplit_once(':')
                    .with_context(|| format!("address '{}' is not host:port", other))?;
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("bad port in '{}'", other))?;
                addresses.push(Address::new(host, port));
            }
        }
    }

    if addresses.is_empty() {
        bail!("no graphd addresses given; try --help");
    }
    Ok(Args {
        addresses,
        name,
        verbose,
    })
}

fn main() -> Result<()> {
    let args = parse_args()?;

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let config = ConnectorConfig::new(args.addresses);
    let mut conn = TcpConnector::new(config)?;
    let mut env = Varenv::new();

    let reply = conn
        .status(&mut env, &args.name)
        .with_context(|| format!("status({}) failed", args.name))?;

    println!("{}", reply.body);
    if !reply.dateline.is_empty() {
        println!("dateline: {}", reply.dateline);
    }

    let mut cost: Vec<(String, f64)> = conn.get_cost().into_iter().collect();
    cost.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in cost {
        println!("cost {} = {}", key, value);
    }

    Ok(())
}
