mod common;

use std::sync::Arc;

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use streamtap_core::events::{Direction, MessageEvent, StreamEvent};
use streamtap_core::time::ManualClock;

use common::*;

fn collector() -> (Arc<Mutex<Vec<MessageEvent>>>, impl Fn(&MessageEvent) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |event: &MessageEvent| sink.lock().push(event.clone()))
}

#[test]
fn fragmented_frames_decode_in_order() {
    let wire = Wire::default();
    let connections = Connections::default();
    connections.set(vec![client_connection(CLIENT)]);

    let mut stream = bundle(&[b"plain"], false);
    stream.extend_from_slice(&bundle(&[b"packed message"], true));
    let segment = tcp_segment(SERVER_PORT, CLIENT_PORT, 5000, &stream);
    let pieces = fragments(SERVER, CLIENT, 77, &segment, 48);
    assert_eq!(pieces.len(), 3);

    // Out of order: last, first, middle.
    wire.push(pieces[2].clone(), 1_000);
    wire.push(pieces[0].clone(), 1_001);
    wire.push(pieces[1].clone(), 1_002);

    let monitor = monitor(&wire, &connections);
    let (received, on_received) = collector();
    let (sent, on_sent) = collector();
    monitor.on_message_received(on_received);
    monitor.on_message_sent(on_sent);
    monitor.start().unwrap();

    assert!(wait_for(|| received.lock().len() >= 2));
    monitor.stop();

    let received = received.lock();
    assert_eq!(received.len(), 2);
    assert_eq!(&received[0].payload[4..], b"plain");
    assert_eq!(&received[1].payload[4..], b"packed message");
    for event in received.iter() {
        assert_eq!(event.direction, Direction::Received);
        assert_eq!(event.connection, client_connection(CLIENT).id());
        assert!(event.epoch >= 1_000);
    }
    assert!(sent.lock().is_empty());
}

#[test]
fn directions_stay_isolated() {
    let wire = Wire::default();
    let connections = Connections::default();
    connections.set(vec![client_connection(CLIENT)]);

    let outbound = tcp_segment(CLIENT_PORT, SERVER_PORT, 1, &bundle(&[b"ping"], false));
    let inbound = tcp_segment(SERVER_PORT, CLIENT_PORT, 9, &bundle(&[b"pong"], false));
    wire.push(ipv4(CLIENT, SERVER, 1, 0, false, &outbound), 10);
    wire.push(ipv4(SERVER, CLIENT, 2, 0, false, &inbound), 20);

    let monitor = monitor(&wire, &connections);
    let (sent, on_sent) = collector();
    let (received, on_received) = collector();
    monitor.on_message_sent(on_sent);
    monitor.on_message_received(on_received);
    monitor.start().unwrap();

    assert!(wait_for(|| sent.lock().len() == 1 && received.lock().len() == 1));
    monitor.stop();

    let sent = sent.lock();
    let received = received.lock();
    assert_eq!(sent[0].payload.slice(4..), Bytes::from_static(b"ping"));
    assert_eq!(sent[0].epoch, 10);
    assert_eq!(received[0].payload.slice(4..), Bytes::from_static(b"pong"));
    assert_eq!(received[0].epoch, 20);
}

#[test]
fn unsubscribed_callbacks_stop_receiving() {
    let wire = Wire::default();
    let connections = Connections::default();
    connections.set(vec![client_connection(CLIENT)]);

    let monitor = monitor(&wire, &connections);
    let (kept, on_kept) = collector();
    let (removed, on_removed) = collector();
    monitor.on_message_received(on_kept);
    let id = monitor.on_message_received(on_removed);
    assert!(monitor.unsubscribe(id));
    assert!(!monitor.unsubscribe(id));

    let inbound = tcp_segment(SERVER_PORT, CLIENT_PORT, 9, &bundle(&[b"pong"], false));
    wire.push(ipv4(SERVER, CLIENT, 2, 0, false, &inbound), 20);
    monitor.start().unwrap();

    assert!(wait_for(|| kept.lock().len() == 1));
    monitor.stop();
    assert!(removed.lock().is_empty());
}

#[test]
fn stream_subscribers_see_reassembled_bytes() {
    let wire = Wire::default();
    let connections = Connections::default();
    connections.set(vec![client_connection(CLIENT)]);

    let stream = bundle(&[b"raw bytes"], false);
    let (head, tail) = stream.split_at(20);
    let first = tcp_segment(SERVER_PORT, CLIENT_PORT, 300, head);
    let second = tcp_segment(SERVER_PORT, CLIENT_PORT, 320, tail);
    wire.push(ipv4(SERVER, CLIENT, 5, 0, false, &second), 30);
    wire.push(ipv4(SERVER, CLIENT, 4, 0, false, &first), 31);

    let monitor = monitor(&wire, &connections);
    let chunks = Arc::new(Mutex::new(Vec::<StreamEvent>::new()));
    {
        let chunks = Arc::clone(&chunks);
        monitor.on_stream_received(move |event| chunks.lock().push(event.clone()));
    }
    let outbound = Arc::new(Mutex::new(Vec::<StreamEvent>::new()));
    {
        let outbound = Arc::clone(&outbound);
        monitor.on_stream_sent(move |event| outbound.lock().push(event.clone()));
    }
    let (received, on_received) = collector();
    monitor.on_message_received(on_received);
    monitor.start().unwrap();

    assert!(wait_for(|| received.lock().len() == 1));
    monitor.stop();

    let chunks = chunks.lock();
    let joined: Vec<u8> = chunks.iter().flat_map(|chunk| chunk.data.to_vec()).collect();
    assert_eq!(joined, stream);
    assert_eq!(chunks[0].epoch, 31);
    assert_eq!(&chunks[0].data[..], head);
    for chunk in chunks.iter() {
        assert_eq!(chunk.direction, Direction::Received);
        assert_eq!(chunk.connection, client_connection(CLIENT).id());
    }
    assert!(outbound.lock().is_empty());
    assert_eq!(&received.lock()[0].payload[4..], b"raw bytes");
}

#[test]
fn stream_subscriptions_can_be_removed() {
    let wire = Wire::default();
    let connections = Connections::default();
    let monitor = monitor(&wire, &connections);

    let stream_id = monitor.on_stream_sent(|_| {});
    let message_id = monitor.on_message_sent(|_| {});
    assert!(monitor.unsubscribe(stream_id));
    assert!(!monitor.unsubscribe(stream_id));
    assert!(monitor.unsubscribe(message_id));
}

#[test]
fn stream_without_syn_waits_for_its_anchor_window() {
    let wire = Wire::default();
    let connections = Connections::default();
    connections.set(vec![client_connection(CLIENT)]);
    let clock = ManualClock::new(1_000);

    let inbound = tcp_segment(SERVER_PORT, CLIENT_PORT, 9, &bundle(&[b"late"], false));
    wire.push(ipv4(SERVER, CLIENT, 2, 0, false, &inbound), 1_000);

    let monitor = monitor(&wire, &connections).with_clock(Arc::new(clock.clone()));
    let (received, on_received) = collector();
    monitor.on_message_received(on_received);
    monitor.start().unwrap();

    // An earlier segment could still arrive, so nothing is released yet.
    assert!(wait_for(|| wire.pending() == 0));
    thread::sleep(Duration::from_millis(30));
    assert!(received.lock().is_empty());

    clock.set(1_100);
    assert!(wait_for(|| received.lock().len() == 1));
    monitor.stop();
    assert_eq!(received.lock()[0].epoch, 1_000);
}
