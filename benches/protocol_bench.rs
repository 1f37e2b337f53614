use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rasta_core::codec::{decode_packet, encode_packet, encode_redundancy_packet, split_datagram};
use rasta_core::config::RedundancyConfig;
use rasta_core::packet::{RedundancyPacket, SequenceFields};
use rasta_core::redundancy::RedundancyChannel;
use rasta_core::{Packet, RedundancyCheckCode, SafetyCode, SafetyCodeType};

fn data_packet() -> Packet {
    let seq = SequenceFields {
        sequence_number: 1000,
        confirmed_sequence_number: 42,
        timestamp: 123_456,
        confirmed_timestamp: 123_400,
    };
    Packet::data(0x60, 0x61, seq, vec![vec![0xAB; 64], vec![0xCD; 64], vec![0xEF; 64]])
}

fn benchmark_encode(c: &mut Criterion) {
    let packet = data_packet();
    for kind in [SafetyCodeType::Md4Lower, SafetyCodeType::Blake2bFull] {
        let code = SafetyCode::new(kind, b"bench key").unwrap();
        c.bench_function(&format!("encode_data_packet_{kind:?}"), |b| {
            b.iter(|| encode_packet(black_box(&packet), &code).unwrap());
        });
    }
}

fn benchmark_decode(c: &mut Criterion) {
    let code = SafetyCode::new(SafetyCodeType::Md4Lower, b"bench key").unwrap();
    let bytes = encode_packet(&data_packet(), &code).unwrap();

    c.bench_function("decode_data_packet", |b| {
        b.iter(|| decode_packet(black_box(&bytes), &code));
    });
}

fn benchmark_split_datagram(c: &mut Criterion) {
    let code = SafetyCode::new(SafetyCodeType::Crc32, b"").unwrap();
    let inner = encode_packet(&data_packet(), &code).unwrap();
    let mut datagram = Vec::new();
    for seq in 0..4 {
        let envelope = RedundancyPacket { sequence_number: seq, inner: inner.clone() };
        datagram.extend(encode_redundancy_packet(&envelope, &RedundancyCheckCode::Crc32).unwrap());
    }

    c.bench_function("split_datagram_4_envelopes", |b| {
        b.iter(|| split_datagram(black_box(&datagram)));
    });
}

fn benchmark_defer_queue(c: &mut Criterion) {
    let config = RedundancyConfig::default();
    let path = "127.0.0.1:9000".parse().unwrap();

    c.bench_function("defer_queue_reorder_1000", |b| {
        b.iter(|| {
            let mut channel = RedundancyChannel::new(0x61, 2, &config, SafetyCode::none());
            channel.receive(RedundancyPacket { sequence_number: 0, inner: vec![0] }, path, 0);
            // pairs arrive swapped: 2, 1, 4, 3, ...
            for base in (1..1000u32).step_by(2) {
                for seq in [base + 1, base] {
                    channel.receive(RedundancyPacket { sequence_number: seq, inner: vec![0] }, path, 0);
                }
            }
            while channel.pop_ready().is_some() {}
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_split_datagram,
    benchmark_defer_queue
);
criterion_main!(benches);
