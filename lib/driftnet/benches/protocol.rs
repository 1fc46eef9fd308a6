use criterion::{criterion_group, criterion_main, Criterion};

use driftnet::buffer::FRAME_CAPACITY;
use driftnet::crypto::CryptoContext;
use driftnet::packet::{Header, Packet, PacketKind};
use driftnet::replay::ReplayProtector;

use brine::crypto;

fn bench_keep_alive_encode(c: &mut Criterion) {
    let mut ctx = CryptoContext::empty();
    ctx.protocol_id = 1;
    ctx.encrypt_key = crypto::random_key();

    let packet = Packet::KeepAlive {
        sequence: 100_000,
        client_id: 77,
    };
    let mut frame = vec![0u8; FRAME_CAPACITY];

    c.bench_function("keep_alive_encode_seal", |b| {
        b.iter(|| {
            let header = packet.header();
            let header_len = header.encode(&mut frame).unwrap();
            let body_len = packet.encode_body(&ctx, &mut frame[header_len..]).unwrap();
            ctx.seal_body(&mut frame[header_len..], body_len, &header).unwrap()
        })
    });
}

fn bench_payload_open_decode(c: &mut Criterion) {
    let key = crypto::random_key();
    let mut ctx = CryptoContext::empty();
    ctx.protocol_id = 1;
    ctx.encrypt_key = key;
    ctx.decrypt_key = key;

    let packet = Packet::Payload {
        sequence: 9,
        data: vec![0xA5u8; 1200],
    };

    let mut sealed = vec![0u8; FRAME_CAPACITY];
    let header = packet.header();
    let header_len = header.encode(&mut sealed).unwrap();
    let body_len = packet.encode_body(&ctx, &mut sealed[header_len..]).unwrap();
    let sealed_len = ctx.seal_body(&mut sealed[header_len..], body_len, &header).unwrap();

    c.bench_function("payload_open_decode", |b| {
        b.iter(|| {
            let mut frame = sealed.clone();
            let (header, header_len) = Header::decode(&frame).unwrap();
            assert_eq!(header.kind, PacketKind::Payload);
            let plain_len = ctx
                .open_body(&mut frame[header_len..], sealed_len, &header)
                .unwrap();
            Packet::decode_body(&header, &ctx, &frame[header_len..header_len + plain_len]).unwrap()
        })
    });
}

fn bench_replay_window(c: &mut Criterion) {
    c.bench_function("replay_window_feed", |b| {
        b.iter(|| {
            let mut protector = ReplayProtector::new();
            let mut accepted = 0usize;
            for sequence in 0..4096u64 {
                if protector.accept(sequence) {
                    accepted += 1;
                }
            }
            accepted
        })
    });
}

criterion_group!(
    benches,
    bench_keep_alive_encode,
    bench_payload_open_decode,
    bench_replay_window
);
criterion_main!(benches);
