use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;
use vg_crypto::{generate_keypair, sha256_hex, sign_hash, verify_hash};

fn bench_sign(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let priv_path = dir.path().join("bench_private.pem");
    let pub_path = dir.path().join("bench_public.pem");
    generate_keypair(&priv_path, &pub_path).expect("keygen");
    let hash = sha256_hex(b"bench block hash input");

    let mut group = c.benchmark_group("rsa_sign");
    group.bench_function(BenchmarkId::from_parameter("1-hash"), |b| {
        b.iter(|| {
            let sig = sign_hash(black_box(&hash), &priv_path).expect("sign");
            black_box(sig)
        })
    });
    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let priv_path = dir.path().join("bench_private.pem");
    let pub_path = dir.path().join("bench_public.pem");
    generate_keypair(&priv_path, &pub_path).expect("keygen");
    let hash = sha256_hex(b"bench block hash input verify");
    let sig = sign_hash(&hash, &priv_path).expect("sign");

    let mut group = c.benchmark_group("rsa_verify");
    group.bench_function(BenchmarkId::from_parameter("1-sig"), |b| {
        b.iter(|| {
            let ok = verify_hash(black_box(&hash), black_box(&sig), &pub_path);
            black_box(ok)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_sign, bench_verify);
criterion_main!(benches);
