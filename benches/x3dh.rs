use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand_core::OsRng;
use secure_session::keys::IdentityKeyPair;
use secure_session::x3dh::{initiate, respond};
use secure_session::{InMemoryStorage, KeyStore, SessionConfig};
use std::sync::Arc;

fn key_store(one_time_prekeys: usize) -> KeyStore {
    let store = KeyStore::open(Arc::new(InMemoryStorage::new()), 1, SessionConfig::default()).unwrap();
    store.generate_identity(&mut OsRng).unwrap();
    store.rotate_signed_prekey(&mut OsRng).unwrap();
    store
        .replenish_one_time_prekeys(&mut OsRng, one_time_prekeys)
        .unwrap();
    store
}

fn bench_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");

    group.bench_function("identity_keypair", |b| {
        b.iter(|| black_box(IdentityKeyPair::generate(&mut OsRng)));
    });

    group.bench_function("sign_prekey", |b| {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let message = [7u8; 64];
        b.iter(|| black_box(identity.sign(&mut OsRng, &message).unwrap()));
    });

    group.finish();
}

fn bench_x3dh_handshake(c: &mut Criterion) {
    let mut group = c.benchmark_group("x3dh_handshake");

    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = key_store(1);
    let bundle = bob.public_bundle().unwrap().take_bundle();

    group.bench_function("initiate", |b| {
        b.iter(|| black_box(initiate(&mut OsRng, &alice_identity, &bundle).unwrap()));
    });

    group.bench_function("respond", |b| {
        let init = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();
        let identity = bob.identity().unwrap();
        let signed_prekey = bob.signed_prekey(bundle.signed_prekey_id).unwrap();
        let one_time_prekey = bundle
            .one_time_prekey
            .map(|(id, _)| bob.one_time_prekey(id).unwrap());

        b.iter(|| {
            black_box(
                respond(
                    &identity,
                    &signed_prekey,
                    one_time_prekey.as_ref(),
                    alice_identity.public_key(),
                    &init.base_key,
                )
                .unwrap(),
            )
        });
    });

    group.bench_function("full_handshake", |b| {
        b.iter(|| {
            let alice = IdentityKeyPair::generate(&mut OsRng);
            let bob = key_store(1);
            let bundle = bob.public_bundle().unwrap().take_bundle();

            let init = initiate(&mut OsRng, &alice, &bundle).unwrap();
            let (id, _) = bundle.one_time_prekey.unwrap();
            let resp = respond(
                &bob.identity().unwrap(),
                &bob.signed_prekey(bundle.signed_prekey_id).unwrap(),
                Some(&bob.consume_one_time_prekey(id).unwrap()),
                alice.public_key(),
                &init.base_key,
            )
            .unwrap();

            black_box((init, resp))
        });
    });

    group.finish();
}

fn bench_signature_verification(c: &mut Criterion) {
    let mut group = c.benchmark_group("signature_verification");

    let bundle = key_store(0).public_bundle().unwrap().take_bundle();

    group.bench_function("verify_bundle_signature", |b| {
        b.iter(|| black_box(bundle.verify_signature().unwrap()));
    });

    group.finish();
}

fn bench_one_time_prekey_replenish(c: &mut Criterion) {
    let mut group = c.benchmark_group("one_time_prekey_replenish");

    for count in [10, 50, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| black_box(key_store(count)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_x3dh_handshake,
    bench_signature_verification,
    bench_one_time_prekey_replenish
);

criterion_main!(benches);
