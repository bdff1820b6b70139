use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use redis_relay::protocol::{RespDecoder, RespEncoder};
use redis_relay::Command;

fn bench_encode_command(c: &mut Criterion) {
    c.bench_function("encode_command", |b| {
        let command = Command::new("SET").arg("mykey").arg("myvalue");
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(64);
            RespEncoder::encode_command(black_box(&command), &mut buf);
            black_box(buf);
        });
    });
}

fn bench_encode_large_value(c: &mut Criterion) {
    c.bench_function("encode_large_value_chunks", |b| {
        let command = Command::new("SET").arg("blob").arg(vec![0x5a_u8; 64 * 1024]);
        b.iter(|| {
            black_box(RespEncoder::encode_chunks(black_box(&command)));
        });
    });
}

fn bench_decode_simple_string(c: &mut Criterion) {
    c.bench_function("decode_simple_string", |b| {
        let mut decoder = RespDecoder::new();
        b.iter(|| {
            black_box(decoder.decode_all(black_box(b"+OK\r\n")).unwrap());
        });
    });
}

fn bench_decode_bulk_string(c: &mut Criterion) {
    c.bench_function("decode_bulk_string", |b| {
        let mut decoder = RespDecoder::new();
        b.iter(|| {
            black_box(decoder.decode_all(black_box(b"$13\r\nHello, Redis!\r\n")).unwrap());
        });
    });
}

fn bench_decode_array(c: &mut Criterion) {
    c.bench_function("decode_array", |b| {
        let data = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        let mut decoder = RespDecoder::new();
        b.iter(|| {
            black_box(decoder.decode_all(black_box(data)).unwrap());
        });
    });
}

fn bench_decode_fragmented(c: &mut Criterion) {
    c.bench_function("decode_array_byte_at_a_time", |b| {
        let data = b"*2\r\n$7\r\nmessage\r\n:12345\r\n";
        let mut decoder = RespDecoder::new();
        b.iter(|| {
            for byte in data.chunks(1) {
                black_box(decoder.decode_all(byte).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_encode_command,
    bench_encode_large_value,
    bench_decode_simple_string,
    bench_decode_bulk_string,
    bench_decode_array,
    bench_decode_fragmented,
);
criterion_main!(benches);
