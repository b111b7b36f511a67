use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ferry::streaming::{
    decode_from_slice, encode_to_bytes, memory_pair, receive_chunks, send_chunks, BlockFile,
    BufferPair, Deadlines, Encode, StagedFile, StorageOptions, TransferState,
};
use tempfile::TempDir;

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for size in [64usize, 4096, 65536].iter() {
        let payload = vec![0xA5u8; *size];
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("encode_string", size), size, |b, _| {
            let mut out = BytesMut::with_capacity(size + 4);
            b.iter(|| {
                out.clear();
                black_box(payload.as_slice()).encode(&mut out).unwrap();
            });
        });

        let encoded = encode_to_bytes(payload.as_slice()).unwrap();
        group.bench_with_input(BenchmarkId::new("decode_string", size), size, |b, _| {
            b.iter(|| {
                let (value, used): (Bytes, usize) =
                    decode_from_slice(black_box(&encoded)).unwrap();
                black_box((value, used))
            });
        });
    }

    let ids: Vec<u64> = (0..1024).collect();
    group.throughput(Throughput::Elements(ids.len() as u64));
    group.bench_function("u64_vec_roundtrip_1024", |b| {
        b.iter(|| {
            let encoded = encode_to_bytes(black_box(ids.as_slice())).unwrap();
            let (decoded, _): (Vec<u64>, usize) = decode_from_slice(&encoded).unwrap();
            black_box(decoded)
        });
    });

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src.bin");
    let file_size = 4 * 1024 * 1024;
    std::fs::write(&src, vec![7u8; file_size]).unwrap();

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(20);
    group.throughput(Throughput::Bytes(file_size as u64));

    for block_size in [4096usize, 65536, 1024 * 1024].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(block_size),
            block_size,
            |b, &block_size| {
                b.iter(|| {
                    runtime.block_on(async {
                        let source_file = BlockFile::open(&src, StorageOptions::default())
                            .await
                            .unwrap();
                        let dst = tmp.path().join("dst.bin");
                        let (dest_file, staged) =
                            StagedFile::create(&dst, StorageOptions::default())
                                .await
                                .unwrap();
                        let (mut sink, mut source) = memory_pair();

                        let send = async {
                            let mut buffers = BufferPair::new(block_size);
                            let mut state = TransferState::default();
                            send_chunks(
                                &source_file,
                                &mut sink,
                                &mut buffers,
                                &mut state,
                                Deadlines::default(),
                            )
                            .await
                        };
                        let receive = async {
                            let mut buffers = BufferPair::new(block_size);
                            let mut state = TransferState::default();
                            receive_chunks(
                                &mut source,
                                &dest_file,
                                &mut buffers,
                                &mut state,
                                Deadlines::default(),
                            )
                            .await
                        };
                        let (sent, received) = tokio::join!(send, receive);
                        sent.unwrap();
                        received.unwrap();
                        drop(dest_file);
                        staged.commit().await.unwrap();
                    })
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_codec, bench_pipeline);
criterion_main!(benches);
