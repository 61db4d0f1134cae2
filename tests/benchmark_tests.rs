//! Performance benchmarks for the wire codec and the connection path

use client::Client;
use karfunkel::config::Config;
use karfunkel::Karfunkel;
use protocol::{kinds, Command, FrameBuffer, Notification, Request, Response, Status, Transformer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

fn sample_command(id: u64) -> Command {
    let request = Request::new(id, "OpenProject").with_param("file", "/srv/projects/castle");
    let answered = Request::new(id + 1, kinds::PING);
    Command::from_sender(3)
        .with_request(request)
        .with_response(Response::to(&answered, id + 2, Status::Ok))
        .with_notification(
            Notification::new("LoadingProject")
                .with_param("name", "castle")
                .with_param("percent_done", "42.0"),
        )
}

/// Benchmarks encoding commands into frames
#[test]
fn benchmark_encode() {
    let mut transformer = Transformer::default();
    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let _ = transformer.encode(&sample_command(i * 3)).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Encode: {} commands in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks decoding frames, including response correlation
#[test]
fn benchmark_decode() {
    let iterations = 10_000;
    let mut sender = Transformer::default();
    let mut receiver = Transformer::default();
    let frames: Vec<Vec<u8>> = (0..iterations)
        .map(|i| sender.encode(&sample_command(i * 3)).unwrap())
        .collect();

    let start = Instant::now();
    for frame in &frames {
        let command = receiver.decode(frame).unwrap();
        assert_eq!(command.requests.len(), 1);
    }

    let duration = start.elapsed();
    println!(
        "Decode: {} frames in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks frame reassembly from small reads
#[test]
fn benchmark_frame_reassembly() {
    let mut transformer = Transformer::default();
    let frame = transformer.encode(&sample_command(1)).unwrap();
    let stream: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 5_000).collect();

    let start = Instant::now();
    let mut frames = FrameBuffer::default();
    let mut count = 0;
    for chunk in stream.chunks(61) {
        frames.extend(chunk);
        while frames.next_frame().unwrap().is_some() {
            count += 1;
        }
    }

    let duration = start.elapsed();
    println!("Reassembly: {} frames in {:?}", count, duration);

    assert_eq!(count, 5_000);
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks many clients completing the handshake at once
#[tokio::test]
async fn benchmark_concurrent_handshakes() {
    let clients = 50;
    let config = Config {
        max_clients: clients,
        ..Config::default()
    };
    let server = Arc::new(Karfunkel::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).run(listener));

    let start = Instant::now();
    let handles: Vec<_> = (0..clients)
        .map(|_| tokio::spawn(Client::connect(addr, "linux")))
        .collect();
    let mut connected = Vec::with_capacity(clients);
    for handle in handles {
        connected.push(handle.await.unwrap().unwrap());
    }

    let duration = start.elapsed();
    println!("Handshakes: {} clients in {:?}", clients, duration);

    assert_eq!(server.client_count(), clients);
    assert!(duration < Duration::from_secs(5));
    server.stop_immediately();
}
