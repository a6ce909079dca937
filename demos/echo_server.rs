//! Line echo server.
//!
//! ```text
//! cargo run --example echo_server -- --port 8888 --method epoll
//! ```

use clap::Parser;
use netloop::{BackendKind, Error, EventLoop, NetInit, TcpListener, TcpStream, parse_addr};

#[derive(Parser)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8888)]
    port: u16,
    /// Backend: select|poll|epoll|kqueue|uring|iocp. Defaults to the
    /// host's preferred backend.
    #[arg(long)]
    method: Option<String>,
    /// Verbose trace output.
    #[arg(long)]
    debug: bool,
}

async fn echo(conn: TcpStream) {
    let peer = conn.peer_addr().ok();
    let mut buf = [0u8; 4096];
    loop {
        match conn.read_some(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut sent = 0;
                while sent < n {
                    match conn.write_some(&buf[sent..n]).await {
                        Ok(m) => sent += m,
                        Err(e) => {
                            eprintln!("write error from {peer:?}: {e}");
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                eprintln!("read error from {peer:?}: {e}");
                break;
            }
        }
    }
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

    let listener = TcpListener::bind(parse_addr("0.0.0.0", args.port)?)?;
    listener.listen(1024)?;
    eprintln!("echo server on port {} ({kind})", args.port);

    let accept_loop = el.spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => netloop::spawn(echo(conn)).detach(),
                Err(e) => {
                    eprintln!("accept error: {e}");
                    netloop::shutdown();
                    break;
                }
            }
        }
    });

    el.run()?;
    drop(accept_loop);
    Ok(())
}
