//! C5: lookup context and skip-list algorithms — descent, get, put
//! (including split), and delete (including level-wise rewiring).
//!
//! Each call works against a set of per-level rails sized to `SLEVELS`
//! rather than a fixed ring-allocated arena: Rust gives a `[u32; SLEVELS]`
//! on the stack for free, so there is no heap traffic to amortize the way
//! a long-lived arena would in a language without that guarantee.

use std::cmp::Ordering;

use crate::blockfile::{AllocFlags, BlockFile, BLOCK_SIZE};
use crate::db::{Database, KeyCmpFn};
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::kvblk::{KvBlk, MIN_SZPOW, NSLOTS};
use crate::rng::{LevelRng, SLEVELS};
use crate::sblk::{SblkFlags, Sblk, SkipNode};
use parking_lot::{Mutex, RwLock};

/// Index within a full (32-pair) node's permutation above which pairs
/// move into the newly split-off node.
const SPLIT_PIVOT: usize = 17;

pub struct Ctx<'a> {
	pub bf:  &'a BlockFile,
	pub fsm: &'a RwLock<Fsm>,
	pub cmp: KeyCmpFn,
	pub rng: &'a Mutex<LevelRng>,
}

pub(crate) fn addr_of(blockno: u32) -> u64 {
	blockno as u64 * BLOCK_SIZE
}

pub(crate) fn blockno_of(addr: u64) -> u32 {
	(addr / BLOCK_SIZE) as u32
}

pub(crate) fn load_sblk(bf: &BlockFile, blockno: u32) -> Result<Sblk> {
	let addr = addr_of(blockno);
	let mut buf = [0u8; crate::sblk::SBLK_SIZE];
	bf.mmap_slice(|m| {
		if addr as usize + buf.len() > m.len() {
			return Err(Error::Corrupted("sblk address out of range".into()));
		}
		buf.copy_from_slice(&m[addr as usize..addr as usize + buf.len()]);
		Ok(())
	})?;
	Sblk::decode(addr, &buf)
}

fn sync_sblk(bf: &BlockFile, sblk: &mut Sblk) -> Result<()> {
	if !sblk.dirty {
		return Ok(());
	}
	let mut buf = [0u8; crate::sblk::SBLK_SIZE];
	sblk.encode(&mut buf);
	bf.write(sblk.addr, &buf)?;
	sblk.dirty = false;
	Ok(())
}

pub(crate) fn load_kvblk(bf: &BlockFile, blockno: u32, szpow_hint: u8) -> Result<KvBlk> {
	let addr = addr_of(blockno);
	let len = 1usize << szpow_hint;
	bf.mmap_slice(|m| {
		if addr as usize + len > m.len() {
			return Err(Error::Corrupted("kvblk address out of range".into()));
		}
		KvBlk::decode(&m[addr as usize..addr as usize + len])
	})
}

fn sync_kvblk(bf: &BlockFile, kv: &mut KvBlk, blockno: u32) -> Result<()> {
	if !kv.dirty {
		return Ok(());
	}
	kv.sync_mm()?;
	bf.write(addr_of(blockno), &kv.data)?;
	Ok(())
}

pub(crate) fn node_min_key(bf: &BlockFile, sblk: &Sblk) -> Result<Vec<u8>> {
	if sblk.flags.contains(SblkFlags::FULL_LKEY) {
		Ok(sblk.lowest_key().to_vec())
	} else {
		let kv = load_kvblk(bf, sblk.kvblkn, szpow_of_block(bf, sblk.kvblkn)?)?;
		Ok(kv.peek_key(sblk.pi[0] as usize)?.to_vec())
	}
}

/// The KVBLK's own `szpow` is self-describing (its first encoded byte),
/// so a cold load only needs to know how many bytes to copy out of the
/// mmap before decoding; this probes just that one byte.
pub(crate) fn szpow_of_block(bf: &BlockFile, blockno: u32) -> Result<u8> {
	let mut b = [0u8; 1];
	bf.mmap_slice(|m| {
		let off = addr_of(blockno) as usize;
		if off >= m.len() {
			return Err(Error::Corrupted("kvblk address out of range".into()));
		}
		b[0] = m[off];
		Ok(())
	})?;
	if b[0] < MIN_SZPOW {
		return Err(Error::InvalidBlockSize);
	}
	Ok(b[0])
}

/// Descend the skip list toward `key`. `strict`:
/// - `false` (containing-node search, used by get/put): rolls forward
///   while the next node's minimum key is `<= key`, landing `lower` on
///   the node that would hold `key` among its pairs.
/// - `true` (predecessor search, used when unlinking a whole node):
///   rolls forward only while the next node's minimum key is `< key`,
///   landing `lower` strictly before any node whose minimum key equals
///   `key`.
fn descend(ctx: &Ctx, db: &Database, key: &[u8], strict: bool) -> Result<([u32; SLEVELS], [u32; SLEVELS])> {
	let mut plower = [0u32; SLEVELS];
	let mut pupper = [0u32; SLEVELS];
	let Some(top) = db.header.top_level() else {
		return Ok((plower, pupper));
	};

	let mut cur: u32 = 0;
	for lvl in (0..=top as usize).rev() {
		loop {
			let next = if cur == 0 { db.header.n[lvl] } else { load_sblk(ctx.bf, cur)?.n[lvl] };
			if next == 0 {
				break;
			}
			let next_node = load_sblk(ctx.bf, next)?;
			let next_key = node_min_key(ctx.bf, &next_node)?;
			let ord = (ctx.cmp)(&next_key, key);
			let advance = if strict { ord == Ordering::Less } else { ord != Ordering::Greater };
			if advance {
				cur = next;
			} else {
				break;
			}
		}
		plower[lvl] = cur;
		pupper[lvl] = if cur == 0 { db.header.n[lvl] } else { load_sblk(ctx.bf, cur)?.n[lvl] };
	}
	Ok((plower, pupper))
}

/// Find the node that would hold `key` and its permutation index, for a
/// cursor positioning itself without necessarily requiring an exact
/// match. Returns `(blockno, found, idx)`; `blockno == 0` means the key
/// would sort before everything currently in the database.
pub(crate) fn locate(ctx: &Ctx, db: &Database, key: &[u8]) -> Result<(u32, bool, usize)> {
	let (plower, _) = descend(ctx, db, key, false)?;
	let lower_blockno = plower[0];
	if lower_blockno == 0 {
		return Ok((0, false, 0));
	}
	let lower = load_sblk(ctx.bf, lower_blockno)?;
	let szpow = szpow_of_block(ctx.bf, lower.kvblkn)?;
	let kv = load_kvblk(ctx.bf, lower.kvblkn, szpow)?;
	let (found, idx) = lower.find_pi(&kv, key, &ctx.cmp)?;
	Ok((lower_blockno, found, idx))
}

pub fn get(ctx: &Ctx, db: &Database, key: &[u8]) -> Result<Vec<u8>> {
	let (plower, _) = descend(ctx, db, key, false)?;
	let lower_blockno = plower[0];
	if lower_blockno == 0 {
		return Err(Error::NotFound);
	}
	let lower = load_sblk(ctx.bf, lower_blockno)?;
	let kv = load_kvblk(ctx.bf, lower.kvblkn, szpow_of_block(ctx.bf, lower.kvblkn)?)?;
	let (found, idx) = lower.find_pi(&kv, key, &ctx.cmp)?;
	if !found {
		return Err(Error::NotFound);
	}
	Ok(kv.peek_val(lower.pi[idx] as usize)?.to_vec())
}

/// Read a dup-mode key's sorted-value-run count.
pub fn dup_num(ctx: &Ctx, db: &Database, key: &[u8], width: usize) -> Result<u32> {
	crate::dupslot::num(&get(ctx, db, key)?, width)
}

/// Membership test against a dup-mode key's sorted-value run.
pub fn dup_contains(ctx: &Ctx, db: &Database, key: &[u8], width: usize, value: u64) -> Result<bool> {
	crate::dupslot::contains(&get(ctx, db, key)?, width, value)
}

/// Insert (`remove = false`) or remove (`remove = true`) one member of a
/// dup-mode key's sorted-value run, rewriting the slot through the
/// normal `put` path so splitting/reallocation stay uniform. A key with
/// no prior value run is treated as an empty one; removing the last
/// member deletes the key outright rather than leaving an empty run.
pub fn dup_put(ctx: &Ctx, db: &mut Database, key: &[u8], width: usize, value: u64, remove: bool) -> Result<()> {
	let existing = match get(ctx, db, key) {
		Ok(v) => Some(v),
		Err(Error::NotFound) => None,
		Err(e) => return Err(e),
	};

	if remove {
		let Some(cur) = existing else { return Err(Error::NotFound) };
		match crate::dupslot::remove(&cur, width, value)? {
			None => Err(Error::NotFound),
			Some(next) if crate::dupslot::num(&next, width)? == 0 => del(ctx, db, key),
			Some(next) => put(ctx, db, key, &next, false),
		}
	} else {
		let base = existing.unwrap_or_else(crate::dupslot::empty_slot);
		match crate::dupslot::insert(&base, width, value)? {
			None => Ok(()),
			Some(next) => put(ctx, db, key, &next, false),
		}
	}
}

/// Allocate and zero-initialize a fresh SBLK block (4 blocks = 256
/// bytes) from the FSM.
fn alloc_sblk_block(ctx: &Ctx) -> Result<u32> {
	let len_blocks = (crate::sblk::SBLK_SIZE as u64).div_ceil(BLOCK_SIZE);
	let (off, _) = ctx.fsm.write().allocate(ctx.bf, len_blocks, AllocFlags::NO_OVERALLOCATE)?;
	Ok(off as u32)
}

fn alloc_kvblk(ctx: &Ctx) -> Result<(u32, KvBlk)> {
	let kv = KvBlk::create(MIN_SZPOW);
	let len_blocks = (kv.block_len() as u64).div_ceil(BLOCK_SIZE);
	let (off, _) = ctx.fsm.write().allocate(ctx.bf, len_blocks, AllocFlags::NO_OVERALLOCATE)?;
	Ok((off as u32, kv))
}

fn dealloc_block(ctx: &Ctx, blockno: u32, size_bytes: u64) -> Result<()> {
	let len_blocks = size_bytes.div_ceil(BLOCK_SIZE);
	ctx.fsm.write().deallocate(ctx.bf, blockno as u64, len_blocks, true)
}

fn len_blocks_of(kv: &KvBlk) -> u64 {
	(kv.block_len() as u64) / BLOCK_SIZE
}

/// `KvBlk::add_kv`/`update_kv`/`rm_kv` grow or shrink the block in place
/// (doubling/halving `szpow`) without knowing where it lives on disk.
/// This reallocates the backing extent to match whenever that happened,
/// repoints `sblk.kvblkn`, and then persists the payload.
fn commit_kvblk(ctx: &Ctx, sblk: &mut Sblk, kv: &mut KvBlk, old_len_blocks: u64) -> Result<()> {
	let new_len_blocks = len_blocks_of(kv);
	if new_len_blocks != old_len_blocks {
		let (new_off, _, _) =
			ctx.fsm.write().reallocate(ctx.bf, sblk.kvblkn as u64, old_len_blocks, new_len_blocks, AllocFlags::NO_OVERALLOCATE)?;
		sblk.kvblkn = new_off as u32;
		sblk.dirty = true;
	}
	sync_kvblk(ctx.bf, kv, sblk.kvblkn)
}

fn choose_level(db: &Database, rng: &Mutex<LevelRng>) -> u8 {
	let mut nlvl = rng.lock().genlevel();
	let ceiling = db.header.top_level().map(|t| t + 1).unwrap_or(0);
	if nlvl > ceiling {
		nlvl = ceiling;
	}
	nlvl
}

/// Link a freshly allocated node into the chain at every level
/// `0..=nlvl`, patching the header's per-level counts and the
/// predecessor/successor `n[]`/`p0` pointers.
fn wire_new_node(
	ctx: &Ctx,
	db: &mut Database,
	plower: &[u32; SLEVELS],
	pupper: &[u32; SLEVELS],
	new_blockno: u32,
	new_sblk: &mut Sblk,
	mut existing_lower: Option<(u32, &mut Sblk)>,
) -> Result<()> {
	let nlvl = new_sblk.lvl as usize;
	let back_addr = existing_lower.as_ref().map(|&(bn, _)| bn).unwrap_or(0);
	new_sblk.set_back(back_addr);

	let upper0 = pupper[0];
	if upper0 != 0 {
		let mut upper = load_sblk(ctx.bf, upper0)?;
		upper.set_back(new_blockno);
		sync_sblk(ctx.bf, &mut upper)?;
	}

	for i in 0..=nlvl {
		new_sblk.set_forward(i, pupper[i]);
		let pl = plower[i];
		if pl == 0 {
			db.header.n[i] = new_blockno;
			continue;
		}
		if let Some((lb, lower_ref)) = existing_lower.as_mut() {
			if pl == *lb {
				lower_ref.set_forward(i, new_blockno);
				continue;
			}
		}
		let mut node = load_sblk(ctx.bf, pl)?;
		node.set_forward(i, new_blockno);
		sync_sblk(ctx.bf, &mut node)?;
	}
	db.header.c[nlvl] += 1;
	db.header.dirty = true;
	Ok(())
}

/// Insert `(key, val)` when the containing node cannot simply accept it
/// in place: either there is no containing node yet (`existing = None`)
/// or it is full and splits (`existing = Some`).
#[allow(clippy::too_many_arguments)]
fn split_insert(
	ctx: &Ctx,
	db: &mut Database,
	plower: &[u32; SLEVELS],
	pupper: &[u32; SLEVELS],
	key: &[u8],
	val: &[u8],
	existing: Option<(u32, Sblk, KvBlk)>,
) -> Result<()> {
	let nlvl = choose_level(db, ctx.rng);
	let (new_kvblkn, mut new_kv) = alloc_kvblk(ctx)?;
	let new_blockno = alloc_sblk_block(ctx)?;
	let mut new_sblk = Sblk::empty(addr_of(new_blockno), nlvl, new_kvblkn);

	let new_old_len_blocks = len_blocks_of(&new_kv);

	match existing {
		None => {
			new_sblk.addkv(&mut new_kv, key, val, &ctx.cmp)?;
			wire_new_node(ctx, db, plower, pupper, new_blockno, &mut new_sblk, None)?;
			commit_kvblk(ctx, &mut new_sblk, &mut new_kv, new_old_len_blocks)?;
			sync_sblk(ctx.bf, &mut new_sblk)
		}
		Some((lower_blockno, mut lower, mut lower_kv)) => {
			let lower_old_len_blocks = len_blocks_of(&lower_kv);
			let (_, idx) = lower.find_pi(&lower_kv, key, &ctx.cmp)?;

			if idx == NSLOTS {
				new_sblk.addkv(&mut new_kv, key, val, &ctx.cmp)?;
			} else {
				let moving: Vec<(Vec<u8>, Vec<u8>)> = (SPLIT_PIVOT..lower.pnum as usize)
					.map(|i| {
						let slot = lower.pi[i] as usize;
						Ok((lower_kv.peek_key(slot)?.to_vec(), lower_kv.peek_val(slot)?.to_vec()))
					})
					.collect::<Result<_>>()?;
				for i in (SPLIT_PIVOT..lower.pnum as usize).rev() {
					lower.rmkv(&mut lower_kv, i)?;
				}
				for (k, v) in &moving {
					new_sblk.addkv(&mut new_kv, k, v, &ctx.cmp)?;
				}
				if idx < SPLIT_PIVOT {
					lower.addkv(&mut lower_kv, key, val, &ctx.cmp)?;
				} else {
					new_sblk.addkv(&mut new_kv, key, val, &ctx.cmp)?;
				}
			}

			wire_new_node(ctx, db, plower, pupper, new_blockno, &mut new_sblk, Some((lower_blockno, &mut lower)))?;
			commit_kvblk(ctx, &mut lower, &mut lower_kv, lower_old_len_blocks)?;
			sync_sblk(ctx.bf, &mut lower)?;
			commit_kvblk(ctx, &mut new_sblk, &mut new_kv, new_old_len_blocks)?;
			sync_sblk(ctx.bf, &mut new_sblk)
		}
	}
}

pub fn put(ctx: &Ctx, db: &mut Database, key: &[u8], val: &[u8], no_overwrite: bool) -> Result<()> {
	if key.len() as u64 + val.len() as u64 > crate::error::MAX_KV_SIZE {
		return Err(Error::MaxKvSize);
	}
	loop {
		let (plower, pupper) = descend(ctx, db, key, false)?;
		let lower_blockno = plower[0];
		if lower_blockno == 0 {
			return split_insert(ctx, db, &plower, &pupper, key, val, None);
		}

		let mut lower = load_sblk(ctx.bf, lower_blockno)?;
		let szpow = szpow_of_block(ctx.bf, lower.kvblkn)?;
		let mut kv = load_kvblk(ctx.bf, lower.kvblkn, szpow)?;
		let old_len_blocks = len_blocks_of(&kv);
		let (found, idx) = lower.find_pi(&kv, key, &ctx.cmp)?;

		if found {
			if no_overwrite {
				return Err(Error::KeyExists);
			}
			lower.updatekv(&mut kv, idx, key, val)?;
			commit_kvblk(ctx, &mut lower, &mut kv, old_len_blocks)?;
			return sync_sblk(ctx.bf, &mut lower);
		}

		if (lower.pnum as usize) < NSLOTS {
			lower.addkv(&mut kv, key, val, &ctx.cmp)?;
			commit_kvblk(ctx, &mut lower, &mut kv, old_len_blocks)?;
			return sync_sblk(ctx.bf, &mut lower);
		}

		let upper_blockno = pupper[0];
		if idx == NSLOTS && upper_blockno != 0 {
			let mut upper = load_sblk(ctx.bf, upper_blockno)?;
			let upper_szpow = szpow_of_block(ctx.bf, upper.kvblkn)?;
			let mut ukv = load_kvblk(ctx.bf, upper.kvblkn, upper_szpow)?;
			let upper_old_len_blocks = len_blocks_of(&ukv);
			if (upper.pnum as usize) < NSLOTS {
				upper.addkv(&mut ukv, key, val, &ctx.cmp)?;
				commit_kvblk(ctx, &mut upper, &mut ukv, upper_old_len_blocks)?;
				return sync_sblk(ctx.bf, &mut upper);
			}
		}

		return split_insert(ctx, db, &plower, &pupper, key, val, Some((lower_blockno, lower, kv)));
	}
}

pub fn del(ctx: &Ctx, db: &mut Database, key: &[u8]) -> Result<()> {
	let (plower, _) = descend(ctx, db, key, false)?;
	let lower_blockno = plower[0];
	if lower_blockno == 0 {
		return Err(Error::NotFound);
	}
	let mut lower = load_sblk(ctx.bf, lower_blockno)?;
	let szpow = szpow_of_block(ctx.bf, lower.kvblkn)?;
	let mut kv = load_kvblk(ctx.bf, lower.kvblkn, szpow)?;
	let old_len_blocks = len_blocks_of(&kv);
	let (found, idx) = lower.find_pi(&kv, key, &ctx.cmp)?;
	if !found {
		return Err(Error::NotFound);
	}

	if lower.pnum > 1 {
		lower.rmkv(&mut kv, idx)?;
		commit_kvblk(ctx, &mut lower, &mut kv, old_len_blocks)?;
		return sync_sblk(ctx.bf, &mut lower);
	}

	// Last pair: the node itself is removed. Rails relative to the node's
	// own minimum key (predecessor search) give the true predecessors.
	let min_key = lower.lowest_key().to_vec();
	let (pred_lower, _) = descend(ctx, db, &min_key, true)?;
	let nlvl = lower.lvl as usize;
	for i in 0..=nlvl {
		let forward = lower.n[i];
		let pl = pred_lower[i];
		if pl == 0 {
			db.header.n[i] = forward;
		} else {
			let mut node = load_sblk(ctx.bf, pl)?;
			node.set_forward(i, forward);
			sync_sblk(ctx.bf, &mut node)?;
		}
		db.header.c[i] -= 1;
	}
	db.header.dirty = true;

	let succ = lower.n[0];
	if succ != 0 {
		let mut s = load_sblk(ctx.bf, succ)?;
		s.set_back(lower.p0);
		sync_sblk(ctx.bf, &mut s)?;
	}

	dealloc_block(ctx, blockno_of(lower.addr), crate::sblk::SBLK_SIZE as u64)?;
	dealloc_block(ctx, lower.kvblkn, kv.block_len() as u64)?;
	Ok(())
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::blockfile::OpenFlags;
	use crate::db::Store;
	use tempfile::NamedTempFile;

	#[test]
	fn put_get_del_roundtrip() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, crate::db::DbFlags::empty()).unwrap();
		db.put(b"hello", b"world", false).unwrap();
		assert_eq!(db.get(b"hello").unwrap(), b"world");
		db.del(b"hello").unwrap();
		assert!(matches!(db.get(b"hello"), Err(Error::NotFound)));
	}

	#[test]
	fn many_keys_force_splits_and_scan_in_order() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, crate::db::DbFlags::empty()).unwrap();
		for i in 0..200u32 {
			let k = format!("k{i:05}");
			db.put(k.as_bytes(), k.as_bytes(), false).unwrap();
		}
		for i in 0..200u32 {
			let k = format!("k{i:05}");
			assert_eq!(db.get(k.as_bytes()).unwrap(), k.as_bytes());
		}
	}
}
