use ferry_crypto::{generate_transfer_key, ChunkCipher};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_chunk(bencher: divan::Bencher, size: usize) {
    let cipher = ChunkCipher::new(&generate_transfer_key(), "bench").unwrap();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| cipher.encrypt_chunk(divan::black_box(7), divan::black_box(&data)).unwrap());
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_chunk(bencher: divan::Bencher, size: usize) {
    let cipher = ChunkCipher::new(&generate_transfer_key(), "bench").unwrap();
    let data = make_data(size);
    let encrypted = cipher.encrypt_chunk(7, &data).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| cipher.decrypt_chunk(divan::black_box(7), divan::black_box(&encrypted)).unwrap());
}

fn main() {
    divan::main();
}
