//! Feed end-to-end tests
//!
//! Runs real servers and clients over loopback websockets:
//! - ordered, duplicate-free delivery to several followers
//! - gap detection and resume
//! - reconnect after the server restarts
//! - resync demands for resume points outside the retained tail
//! - eviction of silent subscribers

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};

use crate::{
    BroadcastClient, BroadcastClientConfig, BroadcastServer, BroadcasterConfig, ClientFrame,
    ClientState, FeedCodec, FeedError, FeedSigner, SequenceNumber, SequencerNode,
    SequencerNodeBuilder, ServerFrame,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server config on an ephemeral port with short timers
fn server_config() -> BroadcasterConfig {
    BroadcasterConfig {
        port: 0,
        io_timeout_ms: 1_000,
        ping_interval_ms: 200,
        client_timeout_ms: 1_000,
        queue: 256,
        workers: 16,
        ..Default::default()
    }
}

fn client_config(addr: SocketAddr) -> BroadcastClientConfig {
    BroadcastClientConfig {
        url: format!("ws://{}/feed", addr),
        timeout_ms: 2_000,
        io_timeout_ms: 1_000,
        server_timeout_ms: 2_000,
        initial_backoff_ms: 20,
        max_backoff_ms: 100,
        ..Default::default()
    }
}

async fn start_sequencer(config: BroadcasterConfig) -> (SequencerNode, SocketAddr) {
    let node = SequencerNodeBuilder::new()
        .config(config)
        .first_sequence(1)
        .build();
    let addr = node.start().await.unwrap();
    (node, addr)
}

/// Receive `count` messages, failing the test if any takes too long
async fn collect(client: &mut BroadcastClient, count: usize) -> Vec<SequenceNumber> {
    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        let message = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for feed message")
            .expect("feed closed")
            .expect("feed error");
        received.push(message.sequence_number);
    }
    received
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Reserve a loopback port that can be re-bound after a restart
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_followers_receive_published_order() {
    init_tracing();
    let (node, addr) = start_sequencer(server_config()).await;

    let mut a = BroadcastClient::connect(client_config(addr), None, node.codec())
        .await
        .unwrap();
    let mut b = BroadcastClient::connect(client_config(addr), None, node.codec())
        .await
        .unwrap();
    assert_eq!(a.state(), ClientState::Streaming);
    assert!(wait_until(|| node.connected_followers() == 2, Duration::from_secs(2)).await);

    for i in 0..50u8 {
        node.sequence(vec![i; 32]).unwrap();
    }

    let expected: Vec<SequenceNumber> = (1..=50).collect();
    assert_eq!(collect(&mut a, 50).await, expected);
    assert_eq!(collect(&mut b, 50).await, expected);
    assert_eq!(a.stats().duplicates_discarded, 0);

    a.close().await;
    assert!(wait_until(|| node.connected_followers() == 1, Duration::from_secs(2)).await);
    node.stop().unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let server = BroadcastServer::new(server_config());
    server.start().await.unwrap();

    assert!(matches!(server.start().await, Err(FeedError::AlreadyRunning)));

    server.stop().unwrap();
    assert!(matches!(server.stop(), Err(FeedError::NotRunning)));
}

#[tokio::test]
async fn test_late_follower_resumes_from_retained_tail() {
    let (node, addr) = start_sequencer(server_config()).await;
    for i in 0..10u8 {
        node.sequence(vec![i]).unwrap();
    }

    let mut client = BroadcastClient::connect(client_config(addr), Some(4), node.codec())
        .await
        .unwrap();
    assert_eq!(collect(&mut client, 7).await, (4..=10).collect::<Vec<_>>());

    node.sequence(vec![11]).unwrap();
    assert_eq!(collect(&mut client, 1).await, vec![11]);
}

#[tokio::test]
async fn test_resume_outside_tail_requires_resync() {
    let config = BroadcasterConfig {
        max_retained: 4,
        ..server_config()
    };
    let (node, addr) = start_sequencer(config).await;
    for i in 0..10u8 {
        node.sequence(vec![i]).unwrap();
    }
    assert_eq!(node.server().oldest_retained(), Some(7));

    let err = BroadcastClient::connect(client_config(addr), Some(2), node.codec())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        FeedError::ResyncRequired {
            requested: 2,
            oldest_available: Some(7)
        }
    ));
    assert_eq!(node.server().stats().resync_replies, 1);
}

/// Serve one scripted connection per entry, recording each resume request
async fn serve_scripted(
    listener: TcpListener,
    signer: FeedSigner,
    script: Vec<Vec<SequenceNumber>>,
) -> (Vec<Option<SequenceNumber>>, Vec<WebSocketStream<TcpStream>>) {
    let mut requested = Vec::new();
    let mut open = Vec::new();

    for frames in script {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let resume_from = loop {
            if let Message::Binary(data) = ws.next().await.unwrap().unwrap() {
                if let ClientFrame::Subscribe { resume_from } =
                    FeedCodec::decode_client_frame(&data).unwrap()
                {
                    break resume_from;
                }
            }
        };
        requested.push(resume_from);

        let subscribed = ServerFrame::Subscribed {
            next_sequence_number: resume_from,
        };
        ws.send(Message::Binary(subscribed.to_bytes())).await.unwrap();
        for seq in frames {
            let frame = ServerFrame::Message(signer.sign(seq, vec![seq as u8]));
            ws.send(Message::Binary(frame.to_bytes())).await.unwrap();
        }
        open.push(ws);
    }

    (requested, open)
}

#[tokio::test]
async fn test_gap_triggers_resume_at_first_missing() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let signer = FeedSigner::generate();
    let codec = FeedCodec::new(signer.publisher_key());

    // First connection drops 5-7; the retained tail still has them
    let server = tokio::spawn(serve_scripted(
        listener,
        signer,
        vec![vec![1, 2, 3, 4, 8], vec![5, 6, 7, 8, 9]],
    ));

    let mut client = BroadcastClient::connect(client_config(addr), Some(1), codec)
        .await
        .unwrap();
    assert_eq!(collect(&mut client, 9).await, (1..=9).collect::<Vec<_>>());

    let (requested, _open) = server.await.unwrap();
    assert_eq!(requested, vec![Some(1), Some(5)]);

    let stats = client.stats();
    assert_eq!(stats.gaps_detected, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.connection_epoch, 2);
    assert_eq!(stats.next_expected_sequence_number, Some(10));
}

#[tokio::test]
async fn test_forged_message_drops_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let publisher = FeedSigner::generate();
    let codec = FeedCodec::new(publisher.publisher_key());

    let impostor = FeedSigner::generate();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _subscribe = ws.next().await;
        let subscribed = ServerFrame::Subscribed {
            next_sequence_number: Some(1),
        };
        ws.send(Message::Binary(subscribed.to_bytes())).await.unwrap();
        let forged = ServerFrame::Message(impostor.sign(1, b"steal".to_vec()));
        ws.send(Message::Binary(forged.to_bytes())).await.unwrap();

        // The client hangs up and comes back for the same message
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _subscribe = ws.next().await;
        ws.send(Message::Binary(subscribed.to_bytes())).await.unwrap();
        let genuine = ServerFrame::Message(publisher.sign(1, b"pay".to_vec()));
        ws.send(Message::Binary(genuine.to_bytes())).await.unwrap();
        ws
    });

    let mut client = BroadcastClient::connect(client_config(addr), Some(1), codec)
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, b"pay".to_vec());
    assert_eq!(client.stats().reconnects, 1);
    let _ws = server.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_server_restart() {
    init_tracing();
    let config = BroadcasterConfig {
        port: free_port(),
        ..server_config()
    };
    let (node, addr) = start_sequencer(config).await;

    let mut client = BroadcastClient::connect(client_config(addr), None, node.codec())
        .await
        .unwrap();
    for i in 0..4u8 {
        node.sequence(vec![i]).unwrap();
    }
    assert_eq!(collect(&mut client, 4).await, vec![1, 2, 3, 4]);

    // Messages published while the follower is cut off stay in the tail
    node.stop().unwrap();
    for i in 4..7u8 {
        node.sequence(vec![i]).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    node.start().await.unwrap();

    let mut state = client.state_watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ClientState::Streaming),
    )
    .await
    .unwrap()
    .unwrap();
    for i in 7..10u8 {
        node.sequence(vec![i]).unwrap();
    }

    assert_eq!(collect(&mut client, 6).await, vec![5, 6, 7, 8, 9, 10]);
    assert!(client.stats().reconnects >= 1);
}

#[tokio::test]
async fn test_silent_subscriber_evicted() {
    init_tracing();
    let config = BroadcasterConfig {
        ping_interval_ms: 100,
        client_timeout_ms: 300,
        ..server_config()
    };
    let server = BroadcastServer::new(config);
    let addr = server.start().await.unwrap();

    // Subscribes, then never reads or answers pings
    let (mut ws, _) = connect_async(format!("ws://{}/feed", addr)).await.unwrap();
    let subscribe = ClientFrame::Subscribe { resume_from: None };
    ws.send(Message::Binary(subscribe.to_bytes())).await.unwrap();
    assert!(wait_until(|| server.connected_clients() == 1, Duration::from_secs(2)).await);
    let registered = tokio::time::Instant::now();

    assert!(wait_until(|| server.connected_clients() == 0, Duration::from_secs(3)).await);
    let evicted_after = registered.elapsed();

    // Deadline is 300ms; eviction lands on the next 100ms ping tick
    assert!(evicted_after >= Duration::from_millis(250));
    assert!(evicted_after < Duration::from_millis(1_000));
    assert_eq!(server.stats().evicted_timeout, 1);
}

#[tokio::test]
async fn test_responsive_client_is_not_evicted() {
    let config = BroadcasterConfig {
        ping_interval_ms: 50,
        client_timeout_ms: 150,
        ..server_config()
    };
    let (node, addr) = start_sequencer(config).await;
    let mut client = BroadcastClient::connect(client_config(addr), None, node.codec())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(node.connected_followers(), 1);
    assert_eq!(node.server().stats().evicted_timeout, 0);

    node.sequence(vec![1]).unwrap();
    assert_eq!(collect(&mut client, 1).await, vec![1]);
}

#[tokio::test]
async fn test_resync_on_reconnect_ends_stream() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let signer = FeedSigner::generate();
    let codec = FeedCodec::new(signer.publisher_key());

    let server = tokio::spawn(async move {
        // Deliver 1-3, then hang up
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _subscribe = ws.next().await;
        let subscribed = ServerFrame::Subscribed {
            next_sequence_number: Some(1),
        };
        ws.send(Message::Binary(subscribed.to_bytes())).await.unwrap();
        for seq in 1..=3 {
            let frame = ServerFrame::Message(signer.sign(seq, vec![seq as u8]));
            ws.send(Message::Binary(frame.to_bytes())).await.unwrap();
        }
        ws.close(None).await.unwrap();

        // By the time the follower is back, 4 has been dropped from the tail
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let resume_from = match ws.next().await.unwrap().unwrap() {
            Message::Binary(data) => match FeedCodec::decode_client_frame(&data).unwrap() {
                ClientFrame::Subscribe { resume_from } => resume_from,
                other => panic!("expected subscribe, got {:?}", other),
            },
            other => panic!("expected binary frame, got {:?}", other),
        };
        let resync = ServerFrame::ResyncRequired {
            requested: resume_from.unwrap(),
            oldest_available: Some(9),
        };
        ws.send(Message::Binary(resync.to_bytes())).await.unwrap();
        (resume_from, ws)
    });

    let mut client = BroadcastClient::connect(client_config(addr), Some(1), codec)
        .await
        .unwrap();
    assert_eq!(collect(&mut client, 3).await, vec![1, 2, 3]);

    let last = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        last,
        Err(FeedError::ResyncRequired {
            requested: 4,
            oldest_available: Some(9)
        })
    ));

    // Nothing follows the resync demand
    let end = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .unwrap();
    assert!(end.is_none());
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(client.stats().reconnects, 1);

    let (resume_from, _ws) = server.await.unwrap();
    assert_eq!(resume_from, Some(4));
}

#[tokio::test]
async fn test_silent_server_triggers_reconnect() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let signer = FeedSigner::generate();
    let codec = FeedCodec::new(signer.publisher_key());

    // The first connection delivers 1 and then goes quiet without closing
    let server = tokio::spawn(serve_scripted(listener, signer, vec![vec![1], vec![2, 3]]));

    let config = BroadcastClientConfig {
        server_timeout_ms: 300,
        ..client_config(addr)
    };
    let mut client = BroadcastClient::connect(config, Some(1), codec)
        .await
        .unwrap();
    assert_eq!(collect(&mut client, 1).await, vec![1]);
    let quiet_since = tokio::time::Instant::now();

    assert_eq!(collect(&mut client, 2).await, vec![2, 3]);
    assert!(quiet_since.elapsed() >= Duration::from_millis(250));

    let (requested, _open) = server.await.unwrap();
    assert_eq!(requested, vec![Some(1), Some(2)]);
    assert_eq!(client.stats().reconnects, 1);
}

#[tokio::test]
async fn test_stalled_reader_evicted_fast_followers_keep_pace() {
    init_tracing();
    const COUNT: usize = 800;
    // Large enough that the stalled socket's kernel buffers fill up
    const PAYLOAD: usize = 32 * 1024;

    let config = BroadcasterConfig {
        queue: 64,
        io_timeout_ms: 5_000,
        client_timeout_ms: 10_000,
        ..server_config()
    };
    let (node, addr) = start_sequencer(config).await;

    // Subscribes, then never reads another byte
    let (mut stalled, _) = connect_async(format!("ws://{}/feed", addr)).await.unwrap();
    let subscribe = ClientFrame::Subscribe { resume_from: None };
    stalled.send(Message::Binary(subscribe.to_bytes())).await.unwrap();

    let mut followers = Vec::new();
    for _ in 0..3 {
        let mut client = BroadcastClient::connect(client_config(addr), None, node.codec())
            .await
            .unwrap();
        followers.push(tokio::spawn(async move {
            let mut received = Vec::with_capacity(COUNT);
            while received.len() < COUNT {
                let message = tokio::time::timeout(Duration::from_secs(5), client.recv())
                    .await
                    .expect("fast follower stalled")
                    .expect("feed closed")
                    .expect("feed error");
                received.push((message.sequence_number, tokio::time::Instant::now()));
            }
            received
        }));
    }
    assert!(wait_until(|| node.connected_followers() == 4, Duration::from_secs(2)).await);

    let mut sent_at = Vec::with_capacity(COUNT);
    for i in 0..COUNT {
        sent_at.push(tokio::time::Instant::now());
        node.sequence(vec![i as u8; PAYLOAD]).unwrap();
        if i % 8 == 7 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    for follower in followers {
        let received = follower.await.unwrap();
        let sequence: Vec<SequenceNumber> = received.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequence, (1..=COUNT as u64).collect::<Vec<_>>());

        let worst = received
            .iter()
            .map(|(seq, at)| at.duration_since(sent_at[(*seq - 1) as usize]))
            .max()
            .unwrap();
        assert!(worst < Duration::from_secs(2), "delivery lagged by {:?}", worst);
    }

    assert!(wait_until(|| node.server().stats().evicted_slow == 1, Duration::from_secs(5)).await);
    assert_eq!(node.connected_followers(), 3);
    drop(stalled);
}

#[tokio::test]
async fn test_busy_subscriber_pongs_keep_it_alive() {
    let config = BroadcasterConfig {
        ping_interval_ms: 50,
        client_timeout_ms: 150,
        ..server_config()
    };
    let (node, addr) = start_sequencer(config).await;
    let mut client = BroadcastClient::connect(client_config(addr), None, node.codec())
        .await
        .unwrap();

    // Keep the queue arm busy across many ping ticks
    let mut published = 0;
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_millis(600) {
        for _ in 0..20 {
            node.sequence(vec![0u8; 256]).unwrap();
            published += 1;
        }
        collect(&mut client, 20).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(published > 0);
    assert_eq!(node.server().stats().evicted_timeout, 0);
    assert_eq!(node.connected_followers(), 1);
}
