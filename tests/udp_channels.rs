mod common;

use common::*;
use netbind::prelude::*;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn ping_round_trip() {
    let (engine, recorder) = new_engine(&[]);
    engine.open().expect("Failed to open engine");

    let peer = udp_peer("127.0.0.1:0");
    let remote = peer.local_addr().unwrap().into();
    let channel = engine.bind(out("Light", "PING"), remote).unwrap();

    let outcome = engine.receive_command("Light", "PING").unwrap();
    assert_eq!(outcome.served, 1);
    assert!(outcome.update_state);
    assert!(engine.socket_of(&channel).is_some());
    assert_eq!(recorder.configured(), vec!["Light".to_string()]);

    let (data, from) = recv_polling(&engine, &peer, WAIT).expect("Peer got nothing");
    assert_eq!(data, b"PING");

    peer.send_to(b"PONG", from).unwrap();
    assert!(poll_until(&engine, WAIT, || !recorder.parsed().is_empty()));
    assert_eq!(recorder.parsed_for("Light"), vec![b"PONG".to_vec()]);

    engine.deactivate();
    assert!(engine.socket_of(&channel).is_none());
}

#[test]
fn writes_leave_in_fifo_order() {
    let (engine, _recorder) = new_engine(&[]);
    engine.open().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let channel = engine
        .bind(out("Display", "*"), peer.local_addr().unwrap().into())
        .unwrap();

    for payload in ["W1", "W2", "W3"] {
        engine
            .write_buffer(&channel, payload.as_bytes().to_vec(), false, Duration::ZERO)
            .unwrap();
    }
    assert_eq!(engine.queued_writes(), 3);

    let mut received = Vec::new();
    while received.len() < 3 {
        let (data, _) = recv_polling(&engine, &peer, WAIT).expect("Missing write");
        received.push(data);
    }
    assert_eq!(received, vec![b"W1".to_vec(), b"W2".to_vec(), b"W3".to_vec()]);
    assert_eq!(engine.queued_writes(), 0);
}

#[test]
fn channels_share_one_socket_per_remote() {
    let (engine, _recorder) = new_engine(&[]);
    engine.open().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let other = udp_peer("127.0.0.1:0");
    let remote: Remote = peer.local_addr().unwrap().into();

    let on = engine.bind(out("Light", "ON"), remote).unwrap();
    let off = engine.bind(out("Light", "OFF"), remote).unwrap();
    let fan = engine.bind(out("Fan", "ON"), remote).unwrap();
    let elsewhere = engine
        .bind(out("Fan", "OFF"), other.local_addr().unwrap().into())
        .unwrap();

    engine.receive_command("Light", "ON").unwrap();
    let socket = engine.socket_of(&on).unwrap();
    assert_eq!(engine.socket_of(&off), Some(socket));
    assert_eq!(engine.socket_of(&fan), Some(socket));
    assert_eq!(engine.socket_of(&elsewhere), None);

    engine.receive_command("Fan", "OFF").unwrap();
    assert_ne!(engine.socket_of(&elsewhere), Some(socket));
}

#[test]
fn wildcard_routing_tracks_last_sender() {
    let (engine, recorder) = new_engine(&[]);
    engine.open().unwrap();
    let listener = engine.listener_addr().unwrap();

    // Three hosts on the loopback network, all sending from the same port
    let first = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = first.local_addr().unwrap().port();
    let second = UdpSocket::bind(("127.0.0.2", port)).unwrap();
    let third = UdpSocket::bind(("127.0.0.3", port)).unwrap();

    let masked = engine
        .bind(inbound("Motion"), format!("*:{port}").parse().unwrap())
        .unwrap();
    assert!(engine.socket_of(&masked).is_some());

    for (count, sender) in [&first, &second, &third].into_iter().enumerate() {
        sender.send_to(b"MOTION", listener).unwrap();
        assert!(poll_until(&engine, WAIT, || recorder.parsed().len() == count + 1));
        assert_eq!(masked.last_remote(), Some(sender.local_addr().unwrap()));
    }
    assert_eq!(recorder.parsed_for("Motion").len(), 3);

    // An exact remote wins over the mask
    let exact = engine
        .bind(inbound("Door"), third.local_addr().unwrap().into())
        .unwrap();
    third.send_to(b"OPEN", listener).unwrap();
    assert!(poll_until(&engine, WAIT, || recorder.parsed().len() == 4));
    assert_eq!(recorder.parsed_for("Door"), vec![b"OPEN".to_vec()]);
    assert_eq!(recorder.parsed_for("Motion").len(), 3);
    assert_eq!(exact.last_remote(), None);

    // Unmatched senders are dropped
    let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
    let strange = engine.bind(inbound("Other"), "10.9.9.9:*".parse().unwrap());
    assert!(strange.is_ok());
    stranger.send_to(b"NOISE", listener).unwrap();
    poll_until(&engine, Duration::from_millis(100), || false);
    assert_eq!(recorder.parsed().len(), 4);
}

#[test]
fn masked_channel_replies_to_last_sender() {
    let (engine, _recorder) = new_engine(&[]);
    engine.open().unwrap();
    let listener = engine.listener_addr().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let channel = engine
        .bind(inbound("Panel"), "127.0.0.1:*".parse().unwrap())
        .unwrap();

    // No sender seen yet, so the reply has nowhere to go
    assert!(engine
        .write_buffer(&channel, b"HELLO".to_vec(), false, Duration::ZERO)
        .unwrap()
        .is_none());
    assert_eq!(engine.queued_writes(), 0);

    peer.send_to(b"HI", listener).unwrap();
    assert!(poll_until(&engine, WAIT, || channel.last_remote().is_some()));

    engine
        .write_buffer(&channel, b"HELLO".to_vec(), false, Duration::ZERO)
        .unwrap();
    let (data, from) = recv_polling(&engine, &peer, WAIT).expect("No reply");
    assert_eq!(data, b"HELLO");
    assert_eq!(from, listener);
}

#[test]
fn blocking_write_times_out() {
    let (engine, recorder) = new_engine(&[]);
    engine.activate().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let channel = engine
        .bind(out("Amp", "*"), peer.local_addr().unwrap().into())
        .unwrap();

    let start = Instant::now();
    let response = engine
        .write_buffer(&channel, b"STATUS?".to_vec(), true, Duration::from_millis(200))
        .unwrap();
    let elapsed = start.elapsed();

    assert!(response.is_none());
    assert!(elapsed >= Duration::from_millis(200), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    assert!(!channel.is_blocking());

    // The write itself still went out
    let mut buf = [0u8; 64];
    let (len, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"STATUS?");

    // A late reply is an ordinary inbound buffer
    peer.send_to(b"LATE", from).unwrap();
    assert!(wait_until(WAIT, || recorder.parsed_for("Amp") == vec![b"LATE".to_vec()]));

    engine.deactivate();
}

#[test]
fn blocking_write_returns_reply() {
    let (engine, recorder) = new_engine(&[]);
    engine.activate().unwrap();

    let (remote, responder) = spawn_responder(|request| {
        let mut reply = b"ACK ".to_vec();
        reply.extend_from_slice(request);
        Some(reply)
    });
    let channel = engine.bind(out("Amp", "*"), remote.into()).unwrap();

    let response = engine
        .write_buffer(&channel, b"VOL 10".to_vec(), true, WAIT)
        .unwrap();
    assert_eq!(response, Some(b"ACK VOL 10".to_vec()));
    assert!(!channel.is_blocking());
    assert!(recorder.parsed().is_empty());

    engine.deactivate();
    stop_responder(remote, responder);
}

#[test]
fn each_reply_reaches_one_waiter() {
    let (engine, recorder) = new_engine(&[]);
    engine.activate().unwrap();

    let (remote, responder) = spawn_responder(|request| Some(request.to_vec()));
    let first = engine.bind(out("Light", "ON"), remote.into()).unwrap();
    let second = engine.bind(out("Light", "OFF"), remote.into()).unwrap();

    let callers: Vec<_> = [(first.clone(), "A"), (second.clone(), "B")]
        .into_iter()
        .map(|(channel, payload)| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine
                    .write_buffer(&channel, payload.as_bytes().to_vec(), true, WAIT)
                    .unwrap()
            })
        })
        .collect();

    let responses: Vec<_> = callers.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(responses[0], Some(b"A".to_vec()));
    assert_eq!(responses[1], Some(b"B".to_vec()));
    assert_eq!(engine.socket_of(&first), engine.socket_of(&second));
    assert!(recorder.parsed().is_empty());

    engine.deactivate();
    stop_responder(remote, responder);
}

#[test]
fn second_blocking_call_fails_fast() {
    let (engine, _recorder) = new_engine(&[]);
    engine.activate().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let channel = engine
        .bind(out("Amp", "*"), peer.local_addr().unwrap().into())
        .unwrap();

    let waiter = {
        let engine = Arc::clone(&engine);
        let channel = channel.clone();
        thread::spawn(move || {
            engine
                .write_buffer(&channel, b"ONE".to_vec(), true, Duration::from_millis(500))
                .unwrap()
        })
    };
    assert!(wait_until(WAIT, || channel.is_blocking()));

    let start = Instant::now();
    let second = engine.write_buffer(&channel, b"TWO".to_vec(), true, WAIT);
    assert!(matches!(second, Err(Error::BlockingInProgress { .. })));
    let plain = engine.write_buffer(&channel, b"THREE".to_vec(), false, WAIT);
    assert!(matches!(plain, Err(Error::BlockingInProgress { .. })));
    assert!(start.elapsed() < Duration::from_millis(100));

    assert!(waiter.join().unwrap().is_none());
    engine.deactivate();
}

#[test]
fn deactivate_releases_blocked_caller() {
    let (engine, _recorder) = new_engine(&[]);
    engine.activate().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let channel = engine
        .bind(out("Amp", "*"), peer.local_addr().unwrap().into())
        .unwrap();

    let waiter = {
        let engine = Arc::clone(&engine);
        let channel = channel.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let response = engine
                .write_buffer(&channel, b"ONE".to_vec(), true, Duration::from_secs(30))
                .unwrap();
            (response, start.elapsed())
        })
    };
    assert!(wait_until(WAIT, || channel.is_blocking()));

    engine.deactivate();
    let (response, elapsed) = waiter.join().unwrap();
    assert!(response.is_none());
    assert!(elapsed < Duration::from_secs(5));
    assert!(!engine.is_active());
}

#[test]
fn direction_sharing_keeps_outbound_off_the_listener() {
    let (engine, recorder) = new_engine(&[
        ("directionssharedconnections", "true"),
        ("addressmask", "false"),
    ]);
    engine.activate().unwrap();

    let (remote, responder) = spawn_responder(|request| Some(request.to_vec()));
    let sender = engine.bind(out("Amp", "*"), remote.into()).unwrap();
    let receiver = engine.bind(inbound("Amp"), remote.into()).unwrap();

    let listener = engine.socket_of(&receiver);
    assert!(listener.is_some());
    assert_eq!(engine.socket_of(&sender), None);

    let response = engine
        .write_buffer(&sender, b"PING".to_vec(), true, WAIT)
        .unwrap();
    assert_eq!(response, Some(b"PING".to_vec()));
    assert!(engine.socket_of(&sender).is_some());
    assert_ne!(engine.socket_of(&sender), listener);
    assert_eq!(engine.socket_of(&receiver), listener);
    assert!(wait_until(WAIT, || !recorder.configured().is_empty()));
    assert_eq!(recorder.configured(), vec!["Amp".to_string()]);

    engine.deactivate();
    stop_responder(remote, responder);
}

#[test]
fn channel_joining_live_socket_is_configured() {
    let (engine, recorder) = new_engine(&[]);
    engine.open().unwrap();

    let peer = udp_peer("127.0.0.1:0");
    let remote: Remote = peer.local_addr().unwrap().into();
    let on = engine.bind(out("Light", "ON"), remote).unwrap();
    engine.receive_command("Light", "ON").unwrap();
    assert_eq!(recorder.configured(), vec!["Light".to_string()]);

    // Bound after the socket came up
    let off = engine.bind(out("Light", "OFF"), remote).unwrap();
    assert_eq!(engine.socket_of(&off), None);
    engine.receive_command("Light", "OFF").unwrap();
    assert_eq!(engine.socket_of(&off), engine.socket_of(&on));
    assert_eq!(recorder.configured(), vec!["Light".to_string(), "Light".to_string()]);

    // Already on the socket, so no second call
    engine.receive_command("Light", "OFF").unwrap();
    assert_eq!(recorder.configured().len(), 2);
}
