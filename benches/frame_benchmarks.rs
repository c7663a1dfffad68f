use bytes::BytesMut;
use cnxn_gateway::frame::FrameCodec;
use cnxn_gateway::records::ReplyHeader;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn encode_response_benchmark(c: &mut Criterion) {
    let header = ReplyHeader { xid: 42, zxid: 1000, err: 0 };

    c.bench_function("encode_response small header", |b| {
        b.iter(|| {
            let wire = FrameCodec::encode_response(black_box(&header), None);
            black_box(wire);
        })
    });
}

fn read_frame_benchmark(c: &mut Criterion) {
    let codec = FrameCodec::new(1024 * 1024);
    let payload = vec![7u8; 256];
    let mut wire = Vec::new();
    wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    wire.extend_from_slice(&payload);

    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();

    c.bench_function("read_frame fully buffered", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut stream = std::io::Cursor::new(wire.clone());
                let mut buffer = BytesMut::new();
                let outcome = codec.read_frame(&mut stream, &mut buffer, true).await.unwrap();
                black_box(outcome);
            })
        })
    });
}

criterion_group!(benches, encode_response_benchmark, read_frame_benchmark);
criterion_main!(benches);
