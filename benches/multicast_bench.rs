/* Outbound path of the tracked publisher: building and encoding one tracked
frame, then fanning a datagram out over several loopback outlets. */
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use amun_hub::{
    core::protocol::{BallState, RobotState, WorldState},
    net::{
        interfaces::NetInterface,
        multicaster::Multicaster,
        tracked::{TrackedFrameBuilder, encode},
    },
};
use std::{
    hint::black_box,
    net::{Ipv4Addr, SocketAddrV4, UdpSocket},
};

fn world() -> WorldState {
    let robot = |id: u32| RobotState {
        id,
        p_x: id as f32 * 0.5,
        p_y: -1.0,
        phi: 0.3,
        ..Default::default()
    };
    WorldState {
        time: 1_000_000_000,
        balls: vec![BallState {
            p_x: 0.2,
            p_y: 1.1,
            v_x: 2.0,
            ..Default::default()
        }],
        yellow: (0..11).map(robot).collect(),
        blue: (0..11).map(robot).collect(),
    }
}

fn bench_tracked_encode(c: &mut Criterion) {
    let mut builder = TrackedFrameBuilder::new("bench");
    builder.set_flip(true);
    let world = world();
    c.bench_function("tracked_create_encode", |b| {
        b.iter(|| {
            let packet = builder.create(black_box(&world));
            black_box(encode(&packet))
        })
    });
}

fn bench_fanout(c: &mut Criterion) {
    let sink = UdpSocket::bind("127.0.0.1:0").expect("sink");
    let port = sink.local_addr().expect("addr").port();
    let payload = vec![0xabu8; 1200];

    let mut group = c.benchmark_group("multicaster_send");
    for outlets in [1usize, 2, 4] {
        let interfaces: Vec<NetInterface> = (0..outlets)
            .map(|i| NetInterface {
                name: format!("lo{}", i),
                addr: Ipv4Addr::LOCALHOST,
                up: true,
                multicast: true,
                loopback: true,
            })
            .collect();
        // a multicast destination opens one socket per interface
        let multicaster = Multicaster::open_on(
            SocketAddrV4::new(Ipv4Addr::new(224, 5, 23, 2), port),
            &interfaces,
        );
        group.bench_with_input(BenchmarkId::from_parameter(outlets), &outlets, |b, _| {
            b.iter(|| black_box(multicaster.send(&payload)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tracked_encode, bench_fanout);
criterion_main!(benches);
