//! Many streams carrying many messages at once

use bytes::Bytes;
use mplex_connection::{Connection, Stream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);
const MESSAGE: &str = "simple msg";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Send `messages` chunks, close, then wait for the remote to close
async fn send_and_finish(stream: Stream, messages: usize) -> usize {
    for _ in 0..messages {
        stream.write(MESSAGE).await.unwrap();
    }
    stream.close().await.unwrap();
    stream.read_to_end().await.unwrap().len()
}

/// Count chunks until end of stream, then close our side
async fn count_and_finish(stream: Stream, received: Arc<AtomicUsize>) {
    while let Some(chunk) = stream.read().await.unwrap() {
        assert_eq!(chunk, Bytes::from(MESSAGE));
        received.fetch_add(1, Ordering::Relaxed);
    }
    stream.close().await.unwrap();
}

/// Open `streams` streams from the dialer, write `messages` on each and check
/// that every message arrived exactly once
async fn spawn_load(streams: usize, messages: usize) {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let dialer = Connection::dial(a);
    let listener = Connection::listen(b);

    let received = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    {
        let received = received.clone();
        listener.on_stream(move |stream| {
            let received = received.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                count_and_finish(stream, received).await;
                let _ = done_tx.send(());
            });
        });
    }

    let mut senders = Vec::new();
    for _ in 0..streams {
        let stream = dialer.new_stream().await.unwrap();
        senders.push(tokio::spawn(send_and_finish(stream, messages)));
    }

    for sender in senders {
        let echoed = timeout(WAIT, sender).await.unwrap().unwrap();
        assert_eq!(echoed, 0);
    }
    for _ in 0..streams {
        timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
    }

    assert_eq!(received.load(Ordering::Relaxed), streams * messages);
    assert_eq!(dialer.stats().active_streams, 0);
    assert_eq!(listener.stats().active_streams, 0);

    timeout(WAIT, dialer.close()).await.unwrap();
}

#[tokio::test]
async fn test_one_stream_one_message() {
    spawn_load(1, 1).await;
}

#[tokio::test]
async fn test_one_stream_many_messages() {
    spawn_load(1, 10_000).await;
}

#[tokio::test]
async fn test_many_streams_one_message() {
    spawn_load(1_000, 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_streams_many_messages() {
    spawn_load(100, 100).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_both_sides_open_streams() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let peers = [Connection::dial(a), Connection::listen(b)];
    let received = Arc::new(AtomicUsize::new(0));

    for peer in &peers {
        let received = received.clone();
        peer.on_stream(move |stream| {
            tokio::spawn(count_and_finish(stream, received.clone()));
        });
    }

    let mut senders = Vec::new();
    for peer in &peers {
        for _ in 0..20 {
            let stream = peer.new_stream().await.unwrap();
            senders.push(tokio::spawn(send_and_finish(stream, 50)));
        }
    }
    for sender in senders {
        timeout(WAIT, sender).await.unwrap().unwrap();
    }

    assert_eq!(received.load(Ordering::Relaxed), 2 * 20 * 50);
}
