use criterion::{criterion_group, criterion_main, Criterion};
use exaconn_protocol::http::{write_chunk, write_final_chunk, ChunkedReader};
use tokio::io::BufReader;
use tokio::runtime::Runtime;

fn chunked_decode_bench(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let body = rt.block_on(async {
        let mut body = Vec::new();
        let row = vec![b'x'; 64 * 1024];
        for _ in 0..64 {
            write_chunk(&mut body, &row).await.expect("chunk");
        }
        write_final_chunk(&mut body).await.expect("final");
        body
    });
    c.bench_function("chunked_decode_4mb", |b| {
        b.to_async(&rt).iter(|| async {
            let mut reader = ChunkedReader::new(BufReader::new(body.as_slice()));
            let mut total = 0usize;
            while let Some(chunk) = reader.next_chunk().await.expect("chunk") {
                total += chunk.len();
            }
            assert_eq!(total, 64 * 64 * 1024);
        });
    });
}

criterion_group!(chunked_benches, chunked_decode_bench);
criterion_main!(chunked_benches);
