use crate::*;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use hopline_core::wire::{read_frame, write_frame};
use hopline_services::{MediumSpec, Relay, Source, TransferSpec};

fn seq(frame: &[u8]) -> u32 {
    u32::from_be_bytes(frame[..4].try_into().expect("4-byte frame"))
}

/// Destination that rejects every write.
struct BrokenSink;

impl AsyncWrite for BrokenSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Relay from an in-memory feed to `Outbound("127.0.0.1")` on `port`,
/// starting with a destination that always fails.
fn broken_destination_relay(
    name: &str,
    port: u16,
    shutdown_tx: &broadcast::Sender<()>,
) -> (tokio::io::DuplexStream, Relay, Source) {
    let factory = Arc::new(loopback_factory(port));
    let spec = TransferSpec {
        from: MediumSpec::Pipe(scratch_dir(name).join("unused")),
        to: MediumSpec::Outbound("127.0.0.1".into()),
    };
    let (feed, source) = tokio::io::duplex(64 * 1024);
    let relay = Relay::new(name, spec, factory, 16, shutdown_tx);
    (feed, relay, Box::new(source))
}

/// A frame whose write fails is sent again, first, on the recreated
/// destination.
#[tokio::test]
async fn failed_frame_is_resent_on_recreated_destination() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let (mut feed, relay, source) = broken_destination_relay("resend", port, &shutdown_tx);
    let stats = relay.stats();
    let handle = tokio::spawn(relay.run(source, Box::new(BrokenSink)));

    write_frame(&mut feed, b"first").await.unwrap();
    write_frame(&mut feed, b"second").await.unwrap();

    let (mut recreated, _) = timeout(STEP, listener.accept())
        .await
        .expect("destination never recreated")
        .unwrap();
    let frame = timeout(STEP, read_frame(&mut recreated)).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"first");
    let frame = timeout(STEP, read_frame(&mut recreated)).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"second");

    let _ = shutdown_tx.send(());
    timeout(STEP, handle).await.unwrap().unwrap().unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.forwarded, 2);
    assert_eq!(snap.dropped, 0);
    assert_eq!(snap.recreated, 1);
}

/// A frame that also fails on the recreated destination is dropped and
/// counted; the relay recreates the destination again and keeps going.
#[tokio::test]
async fn frame_failing_twice_is_dropped_and_relay_continues() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let (mut feed, relay, source) = broken_destination_relay("drop", port, &shutdown_tx);
    let stats = relay.stats();
    let handle = tokio::spawn(relay.run(source, Box::new(BrokenSink)));

    // Far larger than any loopback send buffer, so the write cannot
    // complete against a peer that closed without reading.
    let feeder = tokio::spawn(async move {
        write_frame(&mut feed, &vec![7u8; 32 << 20]).await.unwrap();
        write_frame(&mut feed, b"after").await.unwrap();
        feed
    });

    let (closed, _) = timeout(STEP, listener.accept())
        .await
        .expect("destination never recreated")
        .unwrap();
    drop(closed);

    let (mut kept, _) = timeout(STEP, listener.accept())
        .await
        .expect("destination not recreated after the drop")
        .unwrap();
    let frame = timeout(STEP, read_frame(&mut kept)).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"after");

    let _feed = timeout(STEP, feeder).await.unwrap().unwrap();
    let _ = shutdown_tx.send(());
    timeout(STEP, handle).await.unwrap().unwrap().unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.dropped, 1);
    assert_eq!(snap.forwarded, 1);
    assert_eq!(snap.recreated, 2);
}

/// Losing the upstream of an inbound source: the relay listens again, the
/// new upstream is accepted and its frames keep flowing.
#[tokio::test]
async fn relay_survives_source_loss() {
    let port = free_port();
    let factory = Arc::new(loopback_factory(port));

    let first_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut upstream = TcpStream::connect(first_listener.local_addr().unwrap()).await.unwrap();
    let (source, _) = first_listener.accept().await.unwrap();
    drop(first_listener);

    let (sink, mut downstream) = tokio::io::duplex(64 * 1024);
    let (shutdown_tx, _) = broadcast::channel(1);
    let relay = Relay::new(
        "source-loss",
        TransferSpec {
            from: MediumSpec::Inbound,
            to: MediumSpec::Pipe(scratch_dir("source-loss").join("unused")),
        },
        factory,
        16,
        &shutdown_tx,
    );
    let stats = relay.stats();
    let handle = tokio::spawn(relay.run(Box::new(source), Box::new(sink)));

    write_frame(&mut upstream, b"one").await.unwrap();
    let frame = timeout(STEP, read_frame(&mut downstream)).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"one");

    drop(upstream);

    let mut upstream = timeout(STEP, async {
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("relay never listened for a new upstream");

    write_frame(&mut upstream, b"two").await.unwrap();
    let frame = timeout(STEP, read_frame(&mut downstream)).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"two");

    let _ = shutdown_tx.send(());
    timeout(STEP, handle).await.unwrap().unwrap().unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.received, 2);
    assert_eq!(snap.forwarded, 2);
    assert_eq!(snap.recreated, 1);
}

/// Killing the destination socket mid-stream: the relay reconnects and
/// later frames arrive, in order, on the new connection.
#[tokio::test]
async fn relay_survives_destination_loss() {
    let port = free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let factory = Arc::new(loopback_factory(port));

    let spec = TransferSpec {
        from: MediumSpec::Pipe(scratch_dir("loss").join("unused")),
        to: MediumSpec::Outbound("127.0.0.1".into()),
    };
    let sink = factory.open_sink(&spec.to).await.unwrap();
    let (mut first, _) = listener.accept().await.unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let (mut feed, source) = tokio::io::duplex(64 * 1024);
    let relay = Relay::new("loss", spec, factory, 1024, &shutdown_tx);
    let stats = relay.stats();
    let handle = tokio::spawn(relay.run(Box::new(source), Box::new(sink)));

    write_frame(&mut feed, &0u32.to_be_bytes()).await.unwrap();
    let frame = timeout(STEP, read_frame(&mut first)).await.unwrap().unwrap();
    assert_eq!(seq(&frame), 0);

    drop(first);

    let feeder = tokio::spawn(async move {
        for i in 1u32.. {
            if write_frame(&mut feed, &i.to_be_bytes()).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let (mut second, _) = timeout(STEP, listener.accept())
        .await
        .expect("relay never reconnected")
        .unwrap();
    let a = seq(&timeout(STEP, read_frame(&mut second)).await.unwrap().unwrap());
    let b = seq(&timeout(STEP, read_frame(&mut second)).await.unwrap().unwrap());
    assert!(a >= 1, "frame {a} was sent before the loss");
    assert!(b > a, "frames out of order: {a} then {b}");

    let _ = shutdown_tx.send(());
    timeout(STEP, handle).await.unwrap().unwrap().unwrap();
    feeder.abort();

    let snap = stats.snapshot();
    assert!(snap.recreated >= 1);
    assert!(snap.forwarded >= 3);
}

/// Cancellation closes both mediums: the upstream sees its connection
/// dropped and the downstream sees end of stream.
#[tokio::test]
async fn cancellation_closes_both_mediums() {
    let port = free_port();
    let factory = Arc::new(loopback_factory(port));

    let downstream_listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let mut upstream = TcpStream::connect(upstream_addr).await.unwrap();
    let (source, _) = upstream_listener.accept().await.unwrap();
    let sink = factory.dial("127.0.0.1").await.unwrap();
    let (mut downstream, _) = downstream_listener.accept().await.unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let relay = Relay::new(
        "cancel",
        TransferSpec {
            from: MediumSpec::Inbound,
            to: MediumSpec::Outbound("127.0.0.1".into()),
        },
        factory,
        16,
        &shutdown_tx,
    );
    let handle = tokio::spawn(relay.run(Box::new(source), Box::new(sink)));

    write_frame(&mut upstream, b"ping").await.unwrap();
    let frame = timeout(STEP, read_frame(&mut downstream)).await.unwrap().unwrap();
    assert_eq!(&frame[..], b"ping");

    let _ = shutdown_tx.send(());
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("relay did not stop within bound")
        .unwrap()
        .unwrap();

    let mut buf = [0u8; 8];
    let n = timeout(STEP, downstream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "destination still open");
    let n = timeout(STEP, upstream.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "source still open");
}

/// One hop from socket into the compute pipe: the compute side sees the
/// exact framed bytes.
#[tokio::test]
async fn socket_to_pipe_delivers_framed_bytes() {
    let dir = scratch_dir("hop");
    let send_pipe = dir.join("to_inference");
    let factory = Arc::new(loopback_factory(free_port()));

    // Compute side reads the FIFO; the relay's sender opens once it exists.
    let mut compute = factory.open_pipe_receiver(&send_pipe).unwrap();
    let to_compute = factory.open_pipe_sender(&send_pipe).await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut previous = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (inbound, _) = listener.accept().await.unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let relay = Relay::new(
        "hop",
        TransferSpec {
            from: MediumSpec::Inbound,
            to: MediumSpec::Pipe(send_pipe.clone()),
        },
        factory,
        16,
        &shutdown_tx,
    );
    let handle = tokio::spawn(relay.run(Box::new(inbound), Box::new(to_compute)));

    write_frame(&mut previous, b"hello").await.unwrap();
    previous.flush().await.unwrap();

    let mut raw = [0u8; 9];
    timeout(STEP, compute.read_exact(&mut raw)).await.unwrap().unwrap();
    assert_eq!(raw, [0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);

    let _ = shutdown_tx.send(());
    timeout(STEP, handle).await.unwrap().unwrap().unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
