//! Benchmarks for binary packet framing.

use bytes::{BufMut, BytesMut};
use caravel::protocol::{
    encode_get, encode_store, opcode, PacketHeader, PacketParser, StoreOperation, RESPONSE_MAGIC,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn response_bytes(count: usize, value_len: usize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let value = vec![0x61u8; value_len];
    for i in 0..count {
        let header = PacketHeader {
            magic: RESPONSE_MAGIC,
            opcode: opcode::GETK,
            key_len: 8,
            extras_len: 4,
            datatype: 0,
            field: 0,
            body_len: (4 + 8 + value_len) as u32,
            opaque: i as u32,
            cas: i as u64,
        };
        header.serialize(&mut buf);
        buf.put_u32(0);
        buf.put_slice(b"key00000");
        buf.put_slice(&value);
    }
    buf.to_vec()
}

fn benchmark_encode(c: &mut Criterion) {
    let value = vec![0x62u8; 256];
    c.benchmark_group("encode")
        .throughput(Throughput::Bytes((24 + 8 + 8 + 256) as u64))
        .bench_function("store_set_256b", |b| {
            let mut buf = BytesMut::with_capacity(4096);
            b.iter(|| {
                buf.clear();
                encode_store(
                    &mut buf,
                    StoreOperation::Set,
                    black_box(17),
                    black_box(42),
                    b"key00000",
                    &value,
                    0,
                    0,
                    0,
                );
                black_box(buf.len())
            })
        })
        .bench_function("getq", |b| {
            let mut buf = BytesMut::with_capacity(4096);
            b.iter(|| {
                buf.clear();
                encode_get(&mut buf, opcode::GETQ, black_box(17), black_box(42), b"key00000");
                black_box(buf.len())
            })
        });
}

fn benchmark_parse(c: &mut Criterion) {
    let stream = response_bytes(64, 256);
    c.benchmark_group("parse")
        .throughput(Throughput::Bytes(stream.len() as u64))
        .bench_function("getk_stream_64x256b", |b| {
            b.iter(|| {
                let mut parser = PacketParser::new();
                parser.extend(&stream);
                let mut packets = 0;
                while let Some(packet) = parser.parse().unwrap() {
                    packets += 1;
                    black_box(packet.value.len());
                }
                assert_eq!(packets, 64);
            })
        });
}

criterion_group!(benches, benchmark_encode, benchmark_parse);
criterion_main!(benches);
