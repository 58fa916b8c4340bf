//! Benchmarks for envelope sealing, opening and key derivation.
//!
//! ```bash
//! cargo bench --bench crypto_operations
//! ```

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use notevault_core::crypto::kdf::{KdfAlgorithm, KeyDerivation, Password};
use notevault_core::crypto::keys::MasterKey;
use notevault_core::fs::envelope::EnvelopeCipher;
use notevault_core::vault::BulkReKeyEngine;
use rand::RngCore;

fn note_of_size(size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rand::rng().fill_bytes(&mut data);
    data
}

const NOTE_SIZES: [(&str, usize); 4] = [
    ("empty", 0),
    ("1KB", 1024),
    ("64KB", 64 * 1024),
    ("1MB", 1024 * 1024),
];

fn bench_envelope_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encrypt");
    let cipher = EnvelopeCipher::from_master_key(&MasterKey::generate()).unwrap();

    for (name, size) in NOTE_SIZES {
        let plaintext = note_of_size(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &plaintext, |b, pt| {
            b.iter(|| cipher.encrypt(black_box(pt), None).unwrap());
        });
    }
    group.finish();
}

fn bench_envelope_decrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decrypt");
    let cipher = EnvelopeCipher::from_master_key(&MasterKey::generate()).unwrap();

    for (name, size) in NOTE_SIZES {
        let envelope = cipher.encrypt(&note_of_size(size), None).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &envelope, |b, env| {
            b.iter(|| cipher.decrypt(black_box(env), None).unwrap());
        });
    }

    // Plaintext passthrough only pays for the header check and a copy
    let plain = note_of_size(64 * 1024);
    group.bench_function("passthrough_64KB", |b| {
        b.iter(|| cipher.decrypt(black_box(&plain), None).unwrap());
    });
    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    group.sample_size(20);

    for algorithm in [KdfAlgorithm::Pbkdf2HmacSha256, KdfAlgorithm::Pbkdf2HmacSha512] {
        for iterations in [1_000u32, 10_000] {
            let kdf = KeyDerivation::new(vec![7u8; 16])
                .with_iterations(iterations)
                .with_algorithm(algorithm);
            group.bench_function(format!("{algorithm}/{iterations}"), |b| {
                b.iter(|| {
                    let mut password = Password::new("benchmark-password");
                    kdf.derive_master_key(black_box(&mut password)).unwrap()
                });
            });
        }
    }
    group.finish();
}

fn bench_re_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("re_encrypt_files");
    group.sample_size(10);
    let engine = BulkReKeyEngine::local();

    for files in [16usize, 128] {
        group.bench_function(BenchmarkId::from_parameter(files), |b| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().unwrap();
                    for i in 0..files {
                        std::fs::write(dir.path().join(format!("{i}.md")), note_of_size(4096)).unwrap();
                    }
                    (dir, MasterKey::generate())
                },
                |(dir, key)| engine.re_encrypt_files(None, &key, dir.path()).unwrap(),
                criterion::BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_encrypt,
    bench_envelope_decrypt,
    bench_key_derivation,
    bench_re_encrypt
);
criterion_main!(benches);
