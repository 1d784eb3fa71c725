use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use secure_rpc::core::codec::PacketCodec;
use secure_rpc::core::frame::Frame;
use secure_rpc::core::serialization::SerializationFormat;
use secure_rpc::greet::{GreetRequest, Greeter};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_message_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_frame");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || Frame::Message {
                    call_id: 1,
                    payload: vec![0u8; size],
                },
                |frame| {
                    let mut buf = BytesMut::with_capacity(size + 32);
                    let mut codec = PacketCodec::default();
                    codec.encode(frame.to_packet().unwrap(), &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        let mut wire = BytesMut::new();
        PacketCodec::default()
            .encode(
                Frame::Message {
                    call_id: 1,
                    payload: vec![0u8; size],
                }
                .to_packet()
                .unwrap(),
                &mut wire,
            )
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || wire.clone(),
                |mut buf| {
                    let packet = PacketCodec::default().decode(&mut buf).unwrap().unwrap();
                    let frame = Frame::from_packet(&packet).unwrap();
                    assert!(matches!(frame, Frame::Message { .. }));
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_request_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("greet_request");
    let request = GreetRequest::new(Greeter::new("John", "Doe"));

    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        group.bench_function(format!("encode_{}", format.name()), |b| {
            b.iter(|| format.encode(&request).unwrap())
        });

        let blob = format.encode(&request).unwrap();
        group.bench_function(format!("decode_{}", format.name()), |b| {
            b.iter(|| {
                let _: GreetRequest = format.decode(&blob).unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_message_frames, bench_request_formats);
criterion_main!(benches);
