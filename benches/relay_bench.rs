/* Hub relay latency: a Status handed to the hub until a subscriber holds the
stamped copy, and the routing-table deliver/switch pair on the vision path. */
use criterion::{Criterion, criterion_group, criterion_main};

use amun_hub::{
    HubConfig, Orchestrator, StatusMsg,
    core::protocol::RawPacket,
    hub::router::{VisionRouter, VisionSource},
    net::interfaces::{FixedInterfaces, NetInterface},
};
use crossbeam::channel::unbounded;
use std::{hint::black_box, net::Ipv4Addr, sync::Arc, time::Duration};

fn bench_status_relay(c: &mut Criterion) {
    let config = HubConfig {
        vision_addr: Ipv4Addr::LOCALHOST,
        vision_port: 38801,
        referee_addr: Ipv4Addr::LOCALHOST,
        referee_port: 38802,
        tracker_addr: Ipv4Addr::LOCALHOST,
        tracker_port: 38803,
        ..HubConfig::default()
    };
    let interfaces = Arc::new(FixedInterfaces::new(vec![NetInterface {
        name: "lo".into(),
        addr: Ipv4Addr::LOCALHOST,
        up: true,
        multicast: true,
        loopback: true,
    }]));
    let mut hub = Orchestrator::builder(config)
        .interfaces(interfaces)
        .build()
        .expect("config");
    let statuses = hub.subscribe();
    hub.start().expect("start");
    let sender = hub.status_sender();

    c.bench_function("hub_status_relay_roundtrip", |b| {
        b.iter(|| {
            sender.send(StatusMsg::debug_log("bench", "tick"));
            loop {
                let status = statuses
                    .recv_timeout(Duration::from_secs(1))
                    .expect("relay");
                if !status.debug.is_empty() {
                    black_box(status.time);
                    break;
                }
            }
        })
    });
    hub.stop();
}

fn bench_router(c: &mut Criterion) {
    let (tx, rx) = unbounded();
    let router = VisionRouter::new(VisionSource::Network, tx);
    let packet = RawPacket {
        payload: vec![0u8; 512],
        received_at: 0,
        host: "10.0.0.1".into(),
    };

    c.bench_function("router_deliver", |b| {
        b.iter(|| {
            black_box(router.deliver(VisionSource::Network, packet.clone()));
            let _ = rx.try_recv();
        })
    });

    c.bench_function("router_switch_pair", |b| {
        b.iter(|| {
            router.switch(VisionSource::Simulator);
            router.switch(VisionSource::Network);
            while rx.try_recv().is_ok() {}
        })
    });
}

criterion_group!(benches, bench_status_relay, bench_router);
criterion_main!(benches);
