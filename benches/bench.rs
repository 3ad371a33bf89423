use std::{hint::black_box, time::Duration};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use tempfile::NamedTempFile;
use vaultkv::{Cursor, DbFlags, OpenFlags, Store};

const VAL: &[u8] = b"the quick brown fox jumps over the lazy dog";

fn key(i: u64) -> [u8; 8] {
	i.to_be_bytes()
}

fn open_store() -> (NamedTempFile, std::sync::Arc<Store>) {
	let f = NamedTempFile::new().unwrap();
	let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
	(f, store)
}

/// just open an empty store
fn open(c: &mut Criterion) {
	c.bench_function("open", |b| {
		b.iter(|| {
			let (_f, store) = open_store();
			black_box(store);
		})
	});
}

fn put(c: &mut Criterion) {
	let mut group = c.benchmark_group("put");
	group.measurement_time(Duration::from_secs(15));

	for n in [1_000u64, 10_000] {
		group.throughput(Throughput::Elements(n));
		group.sample_size(20);
		group.bench_function(n.to_string(), |b| {
			b.iter(|| {
				let (_f, store) = open_store();
				let db = store.db(1, DbFlags::UINT64_KEYS).unwrap();
				for i in 0..n {
					db.put(&key(black_box(i)), black_box(VAL), false).unwrap();
				}
			})
		});
	}
	group.finish();
}

fn get(c: &mut Criterion) {
	const N: u64 = 50_000;
	let (_f, store) = open_store();
	let db = store.db(1, DbFlags::UINT64_KEYS).unwrap();
	for i in 0..N {
		db.put(&key(i), VAL, false).unwrap();
	}

	let mut group = c.benchmark_group("get");
	group.measurement_time(Duration::from_secs(15));
	group.throughput(Throughput::Elements(1));
	group.bench_function("hit", |b| {
		let mut i = 0u64;
		b.iter(|| {
			// odd stride so repeated calls don't settle into a cache-friendly walk
			i = (i + 7919) % N;
			black_box(db.get(&key(black_box(i))).unwrap());
		})
	});
	group.bench_function("miss", |b| {
		b.iter(|| {
			let _ = black_box(db.get(&key(black_box(N + 1))));
		})
	});
	group.finish();
}

fn cursor_scan(c: &mut Criterion) {
	let mut group = c.benchmark_group("cursor_scan");
	group.measurement_time(Duration::from_secs(15));
	group.sample_size(20);

	for n in [1_000u64, 50_000] {
		let (_f, store) = open_store();
		let db = store.db(1, DbFlags::UINT64_KEYS).unwrap();
		for i in 0..n {
			db.put(&key(i), VAL, false).unwrap();
		}

		group.throughput(Throughput::Elements(n));
		group.bench_function(n.to_string(), |b| {
			b.iter(|| {
				let mut cur = Cursor::new(db.clone());
				cur.to_first().unwrap();
				let mut count = 0u64;
				while cur.get().is_ok() {
					count += 1;
					if cur.next().is_err() {
						break;
					}
				}
				black_box(count);
			})
		});
	}
	group.finish();
}

fn del(c: &mut Criterion) {
	const N: u64 = 10_000;
	let mut group = c.benchmark_group("del");
	group.measurement_time(Duration::from_secs(15));
	group.throughput(Throughput::Elements(N));
	group.sample_size(20);
	group.bench_function("all", |b| {
		b.iter(|| {
			let (_f, store) = open_store();
			let db = store.db(1, DbFlags::UINT64_KEYS).unwrap();
			for i in 0..N {
				db.put(&key(i), VAL, false).unwrap();
			}
			for i in 0..N {
				db.del(&key(black_box(i))).unwrap();
			}
		})
	});
	group.finish();
}

criterion_group!(benches, open, put, get, cursor_scan, del);
criterion_main!(benches);
