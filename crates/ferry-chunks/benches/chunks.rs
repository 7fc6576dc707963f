use ferry_chunks::{compress_chunk, decompress_chunk, hash_bytes, partition};

fn make_data(size: usize) -> Vec<u8> {
    // Semi-realistic data: repeating pattern with some entropy
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576, 10485760])]
fn blake3_hash(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| hash_bytes(divan::black_box(&data)));
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn zstd_compress_chunk(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| compress_chunk(divan::black_box(&data), 3).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn zstd_decompress_chunk(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let frame = compress_chunk(&data, 3).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decompress_chunk(divan::black_box(&frame), size).unwrap());
}

/// Upfront expected-hash pass: partition, compress, hash every chunk.
#[divan::bench(args = [1048576, 10485760])]
fn expected_hash_pass(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            for range in partition(size as u64, 256 * 1024) {
                let start = range.offset as usize;
                let end = range.end() as usize;
                let frame = compress_chunk(&data[start..end], 3).unwrap();
                let _hash = hash_bytes(&frame);
            }
        });
}

fn main() {
    divan::main();
}
