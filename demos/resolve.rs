//! Resolve names given on the command line.
//!
//! ```text
//! cargo run --example resolve -- example.com example.org --ipv6
//! ```

use clap::Parser;
use netloop::{BackendKind, Error, EventLoop, NetInit, RecordType, Resolver};

#[derive(Parser)]
struct Args {
    /// Names to resolve.
    #[arg(required = true)]
    names: Vec<String>,
    /// Query AAAA records instead of A.
    #[arg(long)]
    ipv6: bool,
    /// Backend: select|poll|epoll|kqueue|uring|iocp.
    #[arg(long)]
    method: Option<String>,
    /// Verbose trace output.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(
            (if args.debug { "netloop=trace" } else { "netloop=info" })
                .parse()
                .expect("directive"),
        ))
        .init();

    let _net = NetInit::new()?;
    let kind = match &args.method {
        Some(m) => m.parse::<BackendKind>()?,
        None => BackendKind::default_for_host(),
    };
    let mut el = EventLoop::with_backend(kind)?;

    let record = if args.ipv6 { RecordType::Aaaa } else { RecordType::A };
    let names = args.names;

    el.block_on(async move {
        let resolver = Resolver::new();
        for name in &names {
            match resolver.resolve(name, record).await {
                Ok(addrs) => {
                    let ips: Vec<String> = addrs.iter().map(|a| a.ip().to_string()).collect();
                    println!("{name}: {}", ips.join(", "));
                }
                Err(e) => println!("{name}: {e}"),
            }
        }
    })?;
    Ok(())
}
