mod common;

use amun_hub::{
    LogicalClock, StreamKind,
    core::protocol::RawPacket,
    hub::worker::{Origin, StatusSender},
    net::{
        interfaces::NetInterface,
        receiver::{Receiver, ReceiverConfig, ReceiverState},
    },
    utils::metrics::HubMetrics,
};
use common::*;
use crossbeam::channel;
use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

#[test]
fn update_port_moves_delivery_to_the_new_port() {
    let (status_tx, _status_rx) = channel::unbounded();
    let metrics = Arc::new(HubMetrics::new());
    let (mut receiver, handle) = Receiver::new(
        ReceiverConfig {
            stream: StreamKind::Vision,
            addr: Ipv4Addr::LOCALHOST,
            port: 38601,
            read_timeout: Duration::from_millis(10),
        },
        Arc::new(LogicalClock::new()),
        StatusSender::new(Origin::Network, status_tx),
        metrics.clone(),
    );
    let (tx, rx) = channel::unbounded();
    receiver.add_sink(Box::new(move |p: &RawPacket| {
        let _ = tx.send(p.payload.clone());
    }));

    let running = Arc::new(AtomicBool::new(true));
    let worker = {
        let running = running.clone();
        thread::spawn(move || receiver.run(running))
    };
    assert!(wait_until(Duration::from_secs(2), || handle.bound_port() == 38601));

    send_datagram(38601, b"old");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"old");

    handle.update_port(38602);
    assert!(wait_until(Duration::from_secs(2), || handle.bound_port() == 38602));
    assert_eq!(handle.state(), ReceiverState::Listening);

    send_datagram(38602, b"new");
    // nobody listens on the old port any more; the send itself succeeds
    send_datagram(38601, b"stale");

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"new");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(metrics.packets(StreamKind::Vision), 2);

    running.store(false, Ordering::Relaxed);
    worker.join().unwrap();
}

#[test]
fn membership_follows_interface_swaps() {
    let group = Ipv4Addr::new(224, 5, 23, 82);
    let (status_tx, _status_rx) = channel::unbounded();
    let (receiver, handle) = Receiver::new(
        ReceiverConfig {
            stream: StreamKind::Referee,
            addr: group,
            port: 38611,
            read_timeout: Duration::from_millis(10),
        },
        Arc::new(LogicalClock::new()),
        StatusSender::new(Origin::Network, status_tx),
        Arc::new(HubMetrics::new()),
    );
    // starts with no usable interface: only the default-route join
    let unplugged = NetInterface {
        name: "eth9".into(),
        addr: Ipv4Addr::new(10, 99, 0, 1),
        up: false,
        multicast: true,
        loopback: false,
    };
    let mut receiver = receiver.with_interfaces(vec![unplugged.clone()]);
    let (tx, rx) = channel::unbounded();
    receiver.add_sink(Box::new(move |p: &RawPacket| {
        let _ = tx.send(p.payload.clone());
    }));

    let running = Arc::new(AtomicBool::new(true));
    let worker = {
        let running = running.clone();
        thread::spawn(move || receiver.run(running))
    };
    assert!(wait_until(Duration::from_secs(2), || handle.bound_port() == 38611));

    let delivered = |tag: &[u8]| {
        wait_until(Duration::from_secs(2), || {
            send_multicast(group, 38611, tag);
            rx.try_iter().any(|payload| payload == tag)
        })
    };

    handle.update_interfaces(vec![unplugged.clone(), loopback()]);
    assert!(delivered(b"joined".as_slice()));
    assert_eq!(handle.state(), ReceiverState::Listening);

    // the loopback membership survives an unrelated change to the set
    handle.update_interfaces(vec![loopback()]);
    assert!(delivered(b"still joined".as_slice()));
    assert_eq!(handle.bound_port(), 38611);

    running.store(false, Ordering::Relaxed);
    worker.join().unwrap();
}
