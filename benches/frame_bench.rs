#![allow(clippy::unwrap_used, clippy::uninlined_format_args)]

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use session_gateway::core::codec::FrameCodec;
use session_gateway::core::frame::{Command, Frame};
use session_gateway::core::mask;
use session_gateway::utils::compression::{compress, decompress, CompressionKind};
use session_gateway::utils::crypto::{Direction, KeyMaterial, SessionCipher, TAG_LEN};
use session_gateway::utils::ring_buffer::ring_buffer;
use tokio_util::codec::{Decoder, Encoder};

const PAYLOAD_SIZES: [usize; 4] = [64, 512, 4096, 32 * 1024];

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for &size in &PAYLOAD_SIZES {
        let payload = Bytes::from(vec![0x5au8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("seal_{}b", size), |b| {
            b.iter(|| {
                Frame::seal(Command::RoutingTransparent.as_u16(), false, 7, payload.clone())
                    .unwrap()
            })
        });

        group.bench_function(format!("encode_{}b", size), |b| {
            let frame =
                Frame::seal(Command::RoutingTransparent.as_u16(), false, 7, payload.clone())
                    .unwrap();
            b.iter_batched(
                || frame.clone(),
                |frame| {
                    let mut buf = BytesMut::with_capacity(frame.encoded_len());
                    FrameCodec.encode(frame, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("decode_{}b", size), |b| {
            let mut wire = BytesMut::new();
            let frame =
                Frame::seal(Command::RoutingTransparent.as_u16(), false, 7, payload.clone())
                    .unwrap();
            FrameCodec.encode(frame, &mut wire).unwrap();
            let wire = wire.freeze();
            b.iter_batched(
                || BytesMut::from(&wire[..]),
                |mut buf| {
                    let decoded = FrameCodec.decode(&mut buf).unwrap().unwrap();
                    assert!(decoded.verify().is_ok());
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("mask_{}b", size), |b| {
            let header = [0x2eu8, 0, 0, 0x7e, 0x90, 0, 0, 0, 7, 0];
            b.iter(|| mask::compute(&header, &payload))
        });
    }

    group.finish();
}

fn bench_client_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("client_payload");
    let cipher = SessionCipher::new(&KeyMaterial::generate());

    for &size in &PAYLOAD_SIZES {
        let data: Vec<u8> = (0..size).map(|i| (i % 17) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("seal_{}b", size), |b| {
            b.iter(|| cipher.seal(Direction::Downstream, 42, &data).unwrap())
        });

        group.bench_function(format!("open_{}b", size), |b| {
            let sealed = cipher.seal(Direction::Upstream, 42, &data).unwrap();
            b.iter(|| {
                let plain = cipher.open(Direction::Upstream, 42, &sealed).unwrap();
                assert_eq!(plain.len() + TAG_LEN, sealed.len());
            })
        });

        group.bench_function(format!("lz4_roundtrip_{}b", size), |b| {
            b.iter(|| {
                let packed = compress(&data, CompressionKind::Lz4).unwrap();
                decompress(&packed, CompressionKind::Lz4).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_ring_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    let entry_header = [0u8; 8];
    let body = vec![1u8; 256];
    let mut out = vec![0u8; entry_header.len() + body.len()];

    group.throughput(Throughput::Bytes(out.len() as u64));
    group.bench_function("write_read_264b", |b| {
        let (mut producer, mut consumer) = ring_buffer(1024 * 1024);
        b.iter(|| {
            assert!(producer.try_write_parts(&[&entry_header[..], &body[..]]));
            assert!(consumer.try_read(&mut out));
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_codec,
    bench_client_payload,
    bench_ring_buffer
);
criterion_main!(benches);
