//! Image cipher and rotation throughput benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use stashvault_core::{ImageCipher, KeyMaterial, StartRotation, Vault, VaultConfig};

fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_cipher");
    let cipher = ImageCipher::new();
    let key = KeyMaterial::generate();

    // thumbnail, phone photo, large scan
    for size in [16 * 1024, 512 * 1024, 4 * 1024 * 1024] {
        let image = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &image, |b, image| {
            b.iter(|| {
                let mut buffer = image.clone();
                cipher.encrypt(&key, black_box(&mut buffer)).unwrap()
            });
        });

        let mut buffer = image.clone();
        let sealed = cipher.encrypt(&key, &mut buffer).unwrap();
        group.bench_with_input(BenchmarkId::new("decrypt", size), &sealed, |b, sealed| {
            b.iter(|| {
                cipher
                    .decrypt(&key, black_box(&sealed.ciphertext), &sealed.iv, &sealed.tag)
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_rotation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_rotation");
    group.sample_size(10);

    let runtime = tokio::runtime::Runtime::new().unwrap();

    for images in [50usize, 500] {
        group.throughput(Throughput::Elements(images as u64));
        group.bench_function(BenchmarkId::new("migrate", images), |b| {
            b.iter(|| {
                runtime.block_on(async {
                    let vault = Vault::in_memory(VaultConfig::default()).unwrap();
                    let key = vault.keys().create_key("bench", "bench").unwrap();
                    vault.keys().activate_key(key.kid).unwrap();

                    for i in 0..images {
                        vault
                            .images()
                            .register_image(&format!("bench/{}.jpg", i), &[7u8; 8 * 1024], None)
                            .await
                            .unwrap();
                    }

                    let rotation = vault
                        .rotations()
                        .start_rotation(StartRotation::migration(key.kid, "bench"))
                        .await
                        .unwrap();
                    vault.rotations().wait(rotation.id).await.unwrap();
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cipher, bench_rotation);
criterion_main!(benches);
