//! Socket end-to-end tests over loopback, run per backend.

mod common;

use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{for_each_backend, local_listener, run_all};
use netloop::{
    ByteReader, ByteWriter, Error, EventLoop, LineReader, TcpListener, TcpStream, parse_addr,
    sleep,
};

/// The 1 MiB test pattern: `'a' + i % 26`.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (b'a' + (i % 26) as u8)).collect()
}

#[test]
fn bind_and_listen() {
    for_each_backend(|kind| {
        let _el = EventLoop::with_backend(kind).unwrap();
        let listener = TcpListener::bind(parse_addr("127.0.0.1", 0).unwrap()).unwrap();
        listener.listen(128).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    });
}

#[test]
fn accept_agrees_on_addresses() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();

        let h1 = el.spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let h2 = el.spawn(async move { listener.accept().await.unwrap() });

        while !(h1.done() && h2.done()) {
            el.step().unwrap();
        }
        let client = h1.try_take().unwrap().unwrap();
        let served = h2.try_take().unwrap().unwrap();
        assert_eq!(
            client.local_addr().unwrap(),
            served.peer_addr().unwrap()
        );
        assert_eq!(client.peer_addr().unwrap(), addr);
    });
}

#[test]
fn write_after_connect() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();
        let msg = b"Hello".to_vec();

        let sent = msg.clone();
        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            ByteWriter::new(&client).write_all(&sent).await.unwrap();
            // Keep the stream open until the reader is done with it.
            sleep(Duration::from_millis(50)).await;
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 5];
            ByteReader::new(&conn).read_exact(&mut buf).await.unwrap();
            buf
        });

        run_all(&mut el, &[&h2]);
        assert_eq!(h2.try_take().unwrap().unwrap(), msg);
        run_all(&mut el, &[&h1]);
    });
}

#[test]
fn write_after_accept() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();
        let msg = b"Hello from server".to_vec();

        let sent = msg.clone();
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            ByteWriter::new(&conn).write_all(&sent).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        });
        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            let mut buf = vec![0u8; 17];
            ByteReader::new(&client).read_exact(&mut buf).await.unwrap();
            buf
        });

        run_all(&mut el, &[&h1]);
        assert_eq!(h1.try_take().unwrap().unwrap(), msg);
        run_all(&mut el, &[&h2]);
    });
}

#[test]
fn two_tasks_share_one_socket() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();

        let connect_h = el.spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let server_h = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            conn.write_some_yield(b"Hello from server").await.unwrap();
            let mut buf = [0u8; 128];
            let n = conn.read_some_yield(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        el.run_until(&connect_h).unwrap();
        let client = Rc::new(connect_h.try_take().unwrap().unwrap());

        let writer = client.clone();
        let write_h = el.spawn(async move {
            writer.write_some_yield(b"Hello from client").await.unwrap();
        });
        let reader = client.clone();
        let read_h = el.spawn(async move {
            let mut buf = [0u8; 128];
            let n = reader.read_some_yield(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        while !(server_h.done() && write_h.done() && read_h.done()) {
            el.step().unwrap();
        }
        assert_eq!(server_h.try_take().unwrap().unwrap(), b"Hello from client");
        assert_eq!(read_h.try_take().unwrap().unwrap(), b"Hello from server");
    });
}

#[test]
fn connect_deadline_on_unroutable_address_times_out() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        // RFC 1918 space with no route from here: the SYN goes nowhere.
        let addr = parse_addr("10.0.0.1", 19999).unwrap();

        let h = el.spawn(async move {
            let deadline = Instant::now() + Duration::from_millis(100);
            TcpStream::connect_deadline(addr, deadline).await
        });
        el.run_until(&h).unwrap();
        match h.try_take().unwrap().unwrap() {
            Err(Error::TimedOut) => {}
            Err(other) => panic!("expected TimedOut, got {other:?}"),
            Ok(_) => panic!("connect to an unroutable address succeeded"),
        }
    });
}

#[test]
fn fast_connect_beats_its_deadline_and_leaves_no_wakeup() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();

        let h = el.spawn(async move {
            let _listener = listener; // keep the backlog alive
            let deadline = Instant::now() + Duration::from_millis(10);
            let conn = TcpStream::connect_deadline(addr, deadline).await?;
            // If the expired deadline left anything armed, this sleep is
            // where a stray wakeup would surface.
            sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(conn)
        });
        el.run_until(&h).unwrap();
        assert!(h.try_take().unwrap().unwrap().is_ok());
    });
}

#[test]
fn refused_connection_errors_on_write() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        // Grab a loopback port with no listener behind it.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let addr = parse_addr("127.0.0.1", port).unwrap();

        let h = el.spawn(async move {
            let deadline = Instant::now() + Duration::from_millis(100);
            let client = TcpStream::connect_deadline(addr, deadline).await?;
            client.write_some(b"test").await?;
            Ok::<_, Error>(())
        });
        el.run_until(&h).unwrap();
        match h.try_take().unwrap().unwrap() {
            Err(Error::ConnectionRefused)
            | Err(Error::Disconnected { .. })
            | Err(Error::TimedOut) => {}
            other => panic!("expected a refusal, got {other:?}"),
        }
    });
}

#[test]
fn refused_connection_errors_on_read() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let addr = parse_addr("127.0.0.1", port).unwrap();

        let h = el.spawn(async move {
            let deadline = Instant::now() + Duration::from_millis(100);
            let client = TcpStream::connect_deadline(addr, deadline).await?;
            let mut buf = [0u8; 4];
            client.read_some(&mut buf).await?;
            Ok::<_, Error>(())
        });
        el.run_until(&h).unwrap();
        match h.try_take().unwrap().unwrap() {
            Err(Error::ConnectionRefused) | Err(Error::TimedOut) => {}
            other => panic!("expected a refusal, got {other:?}"),
        }
    });
}

#[test]
fn megabyte_round_trip_is_byte_identical() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();
        let data = pattern(1024 * 1024);

        let sent = data.clone();
        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            ByteWriter::new(&client).write_all(&sent).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut received = vec![0u8; 1024 * 1024];
            ByteReader::new(&conn)
                .read_exact(&mut received)
                .await
                .unwrap();
            received
        });

        run_all(&mut el, &[&h2]);
        assert_eq!(h2.try_take().unwrap().unwrap(), data);
        run_all(&mut el, &[&h1]);
    });
}

#[test]
fn read_until_interleaved_with_exact_reads() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();
        let data = b"line1\nline2\nline3\nline4\nline9\n".to_vec();

        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            ByteWriter::new(&client).write_all(&data).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut reader = ByteReader::new(&conn);
            let line1 = reader.read_until(b"\n").await.unwrap();
            let line2 = reader.read_until(b"\n").await.unwrap();
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).await.unwrap();
            let line3 = reader.read_until(b"\n").await.unwrap();
            (line1, line2, line3)
        });

        run_all(&mut el, &[&h2]);
        let (line1, line2, line3) = h2.try_take().unwrap().unwrap();
        assert_eq!(line1, b"line1\n");
        assert_eq!(line2, b"line2\n");
        // The one-byte read consumed the 'l' from the buffered tail.
        assert_eq!(line3, b"ine3\n");
        run_all(&mut el, &[&h1]);
    });
}

#[test]
fn struct_round_trip() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();
        let block: [u8; 1024] = {
            let mut b = [0u8; 1024];
            b.copy_from_slice(&pattern(1024));
            b
        };

        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            ByteWriter::new(&client).write_all(&block).await.unwrap();
            sleep(Duration::from_millis(50)).await;
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            ByteReader::new(&conn)
                .read_struct::<[u8; 1024]>()
                .await
                .unwrap()
        });

        run_all(&mut el, &[&h2]);
        assert_eq!(h2.try_take().unwrap().unwrap(), block);
        run_all(&mut el, &[&h1]);
    });
}

#[test]
fn short_peer_close_is_a_short_read() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();

        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            ByteWriter::new(&client).write_all(b"abc").await.unwrap();
            // Dropping the stream closes it with only 3 bytes sent.
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            ByteReader::new(&conn).read_exact(&mut buf).await
        });

        while !(h1.done() && h2.done()) {
            el.step().unwrap();
        }
        match h2.try_take().unwrap().unwrap() {
            Err(Error::ShortRead { expected: 16, got }) => assert!(got <= 3),
            other => panic!("expected ShortRead, got {other:?}"),
        }
    });
}

#[test]
fn line_reader_frames_random_lines() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();

        let mut seed = 31337u32;
        let mut xorshift = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        let lines: Vec<Vec<u8>> = (0..10)
            .map(|i| {
                let len = (xorshift() as usize % 16) + 1;
                let mut line = vec![b'a' + (i % 26) as u8; len];
                *line.last_mut().unwrap() = b'\n';
                line
            })
            .collect();

        let sent = lines.clone();
        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            let writer = ByteWriter::new(&client);
            for line in &sent {
                writer.write_all(line).await.unwrap();
            }
            sleep(Duration::from_millis(50)).await;
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut reader = LineReader::new(&conn, 16);
            let mut received = Vec::new();
            while let Some(line) = reader.read_line().await.unwrap() {
                received.push(line.to_vec());
            }
            received
        });

        run_all(&mut el, &[&h2]);
        assert_eq!(h2.try_take().unwrap().unwrap(), lines);
        run_all(&mut el, &[&h1]);
    });
}

#[test]
fn monitor_resolves_on_remote_disconnect() {
    for_each_backend(|kind| {
        let mut el = EventLoop::with_backend(kind).unwrap();
        let (listener, addr) = local_listener();

        let h1 = el.spawn(async move {
            let client = TcpStream::connect(addr).await.unwrap();
            client.monitor().await.unwrap();
            true
        });
        let h2 = el.spawn(async move {
            let conn = listener.accept().await.unwrap();
            conn.close();
        });

        while !(h1.done() && h2.done()) {
            el.step().unwrap();
        }
        assert!(h1.try_take().unwrap().unwrap());
    });
}
