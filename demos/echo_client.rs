//! Send one line to an echo server and print the reply.
//!
//! ```text
//! cargo run --example echo_client -- --port 8888 hello
//! ```

use clap::Parser;
use netloop::{
    BackendKind, ByteReader, ByteWriter, Error, EventLoop, NetInit, TcpStream, parse_addr,
};

#[derive(Parser)]
struct Args {
    /// Message to send (a newline is appended).
    message: String,
    /// Server host (IP literal).
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server port.
    #[arg(long, default_value_t = 8888)]
    port: u16,
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

    let addr = parse_addr(&args.host, args.port)?;
    let mut line = args.message.into_bytes();
    line.push(b'\n');

    let reply = el.block_on(async move {
        let conn = TcpStream::connect(addr).await?;
        ByteWriter::new(&conn).write_all(&line).await?;
        ByteReader::new(&conn).read_until(b"\n").await
    })??;

    print!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
