use tempfile::NamedTempFile;
use vaultkv::{DbFlags, Error, OpenFlags, Store};

fn open_fresh() -> (NamedTempFile, std::sync::Arc<Store>) {
	let f = NamedTempFile::new().unwrap();
	let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
	(f, store)
}

#[test]
fn scenario_1_open_create_reopen() {
	let f = NamedTempFile::new().unwrap();
	{
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::empty()).unwrap();
		db.put(b"a", b"1", false).unwrap();
		assert_eq!(db.get(b"a").unwrap(), b"1");
		store.close().unwrap();
	}

	let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
	let db = store.db(1, DbFlags::empty()).unwrap();
	assert_eq!(db.get(b"a").unwrap(), b"1");
}

#[test]
fn scenario_2_thousand_keys_scan_in_order() {
	let (_f, store) = open_fresh();
	let db = store.db(1, DbFlags::empty()).unwrap();
	for i in 0..1000u32 {
		let k = format!("k{i:04}");
		db.put(k.as_bytes(), k.as_bytes(), false).unwrap();
	}

	let mut cur = vaultkv::Cursor::new(db);
	cur.to_first().unwrap();
	let mut seen = Vec::new();
	loop {
		let (k, _) = cur.get().unwrap();
		seen.push(String::from_utf8(k).unwrap());
		if cur.next().is_err() {
			break;
		}
	}
	assert_eq!(seen.len(), 1000);
	let expected: Vec<String> = (0..1000u32).map(|i| format!("k{i:04}")).collect();
	assert_eq!(seen, expected);
}

#[test]
fn scenario_3_numeric_keys_descending_scan() {
	let (_f, store) = open_fresh();
	let db = store.db(1, DbFlags::UINT64_KEYS).unwrap();
	for k in [1u64, 1_000_000, 42] {
		db.put(&k.to_be_bytes(), b"v", false).unwrap();
	}

	let mut cur = vaultkv::Cursor::new(db);
	cur.to_last().unwrap();
	let mut seen = Vec::new();
	loop {
		let (k, _) = cur.get().unwrap();
		seen.push(u64::from_be_bytes(k.try_into().unwrap()));
		if cur.prev().is_err() {
			break;
		}
	}
	assert_eq!(seen, vec![1_000_000, 42, 1]);
}

/// Runs the fill-then-split-then-delete workload against a store opened
/// with a pinned seed, returning the per-level node counts right after
/// the forced split and again at the end.
fn run_scenario_4(seed: u64) -> ([u32; 30], [u32; 30]) {
	let f = NamedTempFile::new().unwrap();
	let store = Store::open_with_seed(f.path(), OpenFlags::empty(), seed).unwrap();
	let db = store.db(1, DbFlags::empty()).unwrap();
	for i in 0..33u32 {
		let k = format!("k{i:03}");
		db.put(k.as_bytes(), k.as_bytes(), false).unwrap();
	}
	// 33 inserts into a 32-slot node force exactly one split, which draws
	// exactly two node levels total (one for the node created by the
	// first insert, one for the node created by the split) from the
	// seeded PRNG.
	let counts_after_split = db.level_counts();

	// this put lands after the block has already split at least once
	let newest = "k999";
	db.put(newest.as_bytes(), newest.as_bytes(), false).unwrap();
	db.del(newest.as_bytes()).unwrap();
	assert!(matches!(db.get(newest.as_bytes()), Err(Error::NotFound)));
	for i in 0..33u32 {
		let k = format!("k{i:03}");
		assert_eq!(db.get(k.as_bytes()).unwrap(), k.as_bytes());
	}
	(counts_after_split, db.level_counts())
}

#[test]
fn scenario_4_split_then_delete_preserves_invariants() {
	const SEED: u64 = 0xC0FFEE_u64;

	let (a_split, a_final) = run_scenario_4(SEED);
	let (b_split, b_final) = run_scenario_4(SEED);

	// Same seed, same insertion order: the two independently-drawn level
	// sequences must line up exactly, so the resulting per-level node
	// counts (`lcnt`) must match bit for bit between runs.
	assert_eq!(a_split, b_split);
	assert_eq!(a_final, b_final);

	// The split drew levels for exactly two nodes.
	assert_eq!(a_split.iter().sum::<u32>(), 2);
	assert_ne!(a_split, [0u32; 30]);

	// k999's insert lands in the node the split just created (it isn't
	// full yet, so it's absorbed in place), and deleting it again just
	// removes one pair from a node with more than one member left; the
	// split itself is never undone, so the level histogram carries over
	// unchanged.
	assert_eq!(a_split, a_final);
}

#[test]
fn scenario_5_dup_values_sorted_iterate_and_remove() {
	let (_f, store) = open_fresh();
	let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
	for v in [5u64, 2, 5, 9] {
		db.dup_add(b"k", v).unwrap();
	}
	assert_eq!(db.dup_num(b"k").unwrap(), 3);

	let mut cur = vaultkv::Cursor::new(db.clone());
	cur.to_key(b"k").unwrap();
	let mut asc = Vec::new();
	cur.dup_iter(None, true, |v| {
		asc.push(v);
		true
	})
	.unwrap();
	assert_eq!(asc, vec![2, 5, 9]);

	db.dup_rm(b"k", 5).unwrap();
	let mut asc2 = Vec::new();
	cur.dup_iter(None, true, |v| {
		asc2.push(v);
		true
	})
	.unwrap();
	assert_eq!(asc2, vec![2, 9]);
}

#[test]
fn scenario_6_rdonly_put_rejected() {
	let f = NamedTempFile::new().unwrap();
	{
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::empty()).unwrap();
		db.put(b"a", b"1", false).unwrap();
		store.close().unwrap();
	}

	let store = Store::open(f.path(), OpenFlags::RDONLY).unwrap();
	let db = store.db(1, DbFlags::empty()).unwrap();
	assert!(matches!(db.put(b"b", b"2", false), Err(Error::ReadOnly)));
}

#[test]
fn property_idempotent_delete() {
	let (_f, store) = open_fresh();
	let db = store.db(1, DbFlags::empty()).unwrap();
	assert!(matches!(db.del(b"missing"), Err(Error::NotFound)));
	db.put(b"k", b"v", false).unwrap();
	db.del(b"k").unwrap();
	assert!(matches!(db.del(b"k"), Err(Error::NotFound)));
}

#[test]
fn property_round_trip_latest_put_wins() {
	let (_f, store) = open_fresh();
	let db = store.db(1, DbFlags::empty()).unwrap();
	db.put(b"k", b"first", false).unwrap();
	db.put(b"k", b"second", false).unwrap();
	assert_eq!(db.get(b"k").unwrap(), b"second");
	assert!(matches!(db.put(b"k", b"third", true), Err(Error::KeyExists)));
	assert_eq!(db.get(b"k").unwrap(), b"second");
}

#[test]
fn property_persistence_across_multiple_databases() {
	let f = NamedTempFile::new().unwrap();
	{
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let a = store.db(1, DbFlags::empty()).unwrap();
		let b = store.db(2, DbFlags::empty()).unwrap();
		for i in 0..50u32 {
			a.put(format!("a{i}").as_bytes(), b"x", false).unwrap();
			b.put(format!("b{i}").as_bytes(), b"y", false).unwrap();
		}
		store.close().unwrap();
	}

	let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
	let a = store.db(1, DbFlags::empty()).unwrap();
	let b = store.db(2, DbFlags::empty()).unwrap();
	for i in 0..50u32 {
		assert_eq!(a.get(format!("a{i}").as_bytes()).unwrap(), b"x");
		assert_eq!(b.get(format!("b{i}").as_bytes()).unwrap(), b"y");
	}
}

#[test]
fn db_destroy_purges_keys_in_background() {
	let (_f, store) = open_fresh();
	let db = store.db(1, DbFlags::empty()).unwrap();
	for i in 0..20u32 {
		db.put(format!("k{i}").as_bytes(), b"v", false).unwrap();
	}
	store.db_destroy(1).unwrap();

	// A fresh open of the same id sees no leftover pairs.
	let db2 = store.db(1, DbFlags::empty()).unwrap();
	assert!(matches!(db2.get(b"k0"), Err(Error::NotFound)));
}
