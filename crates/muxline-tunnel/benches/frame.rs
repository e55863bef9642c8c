//! Frame codec and reassembly benchmarks.
//!
//! Compares whole-frame reads (zero-copy dispatch) with reads that cut
//! every frame (fragment buffer path).

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use muxline_tunnel::frame::encode_frame;
use muxline_tunnel::{
    Flags, Header, MuxConfig, Multiplexer, Role, StreamCtx, StreamHandler, StreamId, Transport,
};

struct Discard;

impl Transport for Discard {
    fn write_parts(&mut self, _parts: &[&[u8]]) -> bool {
        true
    }

    fn close(&mut self, _force: bool) {}
}

struct Count(usize);

impl StreamHandler for Count {
    fn on_data(&mut self, cx: &mut StreamCtx<'_>, id: StreamId, data: &[u8]) {
        self.0 += data.len();
        let _ = cx.try_send_window_update(id, data.len());
    }
}

fn bench_header(c: &mut Criterion) {
    let h = Header::data(Flags::empty(), 7, 1400);
    let raw = h.encode();

    let mut group = c.benchmark_group("header");
    group.bench_function("encode", |b| b.iter(|| black_box(black_box(&h).encode())));
    group.bench_function("decode", |b| b.iter(|| black_box(Header::decode(black_box(&raw)).unwrap())));
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let payload = vec![0xA5u8; 1400];
    let mut stream = Vec::new();
    encode_frame(&Header::data(Flags::SYN, 1, 0), &[], &mut stream);
    for _ in 0..64 {
        encode_frame(&Header::data(Flags::empty(), 1, payload.len() as u32), &payload, &mut stream);
    }

    let mut group = c.benchmark_group("reassembly");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for read_size in [stream.len(), 16 * 1024, 1000] {
        group.bench_function(format!("read_{}", read_size), |b| {
            b.iter(|| {
                let mut mux = Multiplexer::new(Role::Server, MuxConfig::default());
                mux.set_acceptor(|_cx: &mut StreamCtx<'_>, _id: StreamId| {
                    Some(Box::new(Count(0)) as Box<dyn StreamHandler>)
                });
                let mut io = Discard;
                for chunk in stream.chunks(read_size) {
                    mux.on_receive_data(&mut io, black_box(chunk));
                }
                black_box(mux.stream_count())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_header, bench_reassembly);
criterion_main!(benches);
