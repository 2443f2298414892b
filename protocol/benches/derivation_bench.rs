// Derivation, sealing and build benchmarks for the Dropline protocol.
//
// The channel key is PBKDF2 with 100k rounds and runs once per session
// open, as does address derivation, which scales with the mailbox count.
// Sealing and building sit on the send path.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use dropline_protocol::crypto::{decrypt, encrypt};
use dropline_protocol::derivation::{derive_addresses, derive_encryption_key};
use dropline_protocol::secret::normalize;
use dropline_protocol::transaction::{build_transaction, SpendableOutput};

const PHRASE: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn bench_normalize(c: &mut Criterion) {
    let messy = "  Abandon ABANDON abandon abandon abandon abandon\tabandon abandon abandon abandon abandon About ";
    c.bench_function("secret/normalize", |b| {
        b.iter(|| normalize(messy).unwrap());
    });
}

fn bench_derive_addresses(c: &mut Criterion) {
    let secret = normalize(PHRASE).unwrap();
    let mut group = c.benchmark_group("derivation/addresses");

    for count in [1u32, 8, 64] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| derive_addresses(&secret, count).unwrap());
        });
    }

    group.finish();
}

fn bench_derive_key(c: &mut Criterion) {
    let secret = normalize(PHRASE).unwrap();
    let mut group = c.benchmark_group("derivation/channel_key");
    group.sample_size(10);
    group.bench_function("pbkdf2_sha256", |b| {
        b.iter(|| derive_encryption_key(&secret).unwrap());
    });
    group.finish();
}

fn bench_seal_open(c: &mut Criterion) {
    let key = derive_encryption_key(&normalize(PHRASE).unwrap()).unwrap();
    let payload = encrypt(&key, "meet at the north gate at nine").unwrap();

    c.bench_function("aes_gcm/encrypt", |b| {
        b.iter(|| encrypt(&key, "meet at the north gate at nine").unwrap());
    });
    c.bench_function("aes_gcm/decrypt", |b| {
        b.iter(|| decrypt(&key, &payload).unwrap());
    });
}

fn bench_build_transaction(c: &mut Criterion) {
    let secret = normalize(PHRASE).unwrap();
    let key = derive_encryption_key(&secret).unwrap();
    let addresses = derive_addresses(&secret, 2).unwrap();
    let (mailbox, sender) = (&addresses[0], &addresses[1]);
    let payload = encrypt(&key, "hello").unwrap();

    let mut group = c.benchmark_group("transaction/build");
    for utxos_len in [1usize, 10, 50] {
        // Unconfirmed coins ahead of the one spendable coin.
        let utxos: Vec<SpendableOutput> = (0..utxos_len)
            .map(|i| SpendableOutput {
                txid: format!("{:064x}", i + 1),
                vout: 0,
                value: 50_000,
                confirmed: i + 1 == utxos_len,
                script_pubkey: Some(sender.script_pubkey().clone()),
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(utxos_len), &utxos, |b, utxos| {
            b.iter(|| build_transaction(&sender.address, mailbox, &payload, utxos, 1.0).unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_normalize,
    bench_derive_addresses,
    bench_derive_key,
    bench_seal_open,
    bench_build_transaction,
);
criterion_main!(benches);
