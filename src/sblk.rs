//! C4: SBLK, the fixed 256-byte skip-list node.
//!
//! Fields are packed by hand rather than through a derived codec, so
//! every multi-byte field goes through an explicit little-endian
//! encode/decode step regardless of the mmap offset's own alignment.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::kvblk::{KvBlk, NSLOTS};
use crate::rng::SLEVELS;

pub const SBLK_SIZE: usize = 256;
pub const MAX_LK: usize = 64;

bitflags::bitflags! {
	/// Only `FULL_LKEY` is persisted; `DB`/`DURTY`/`LKEY_ONLY` exist only
	/// as in-memory bookkeeping and never reach the on-disk byte.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SblkFlags: u8 {
		const FULL_LKEY = 1 << 0;
	}
}

pub type KeyCmp<'a> = &'a dyn Fn(&[u8], &[u8]) -> Ordering;

/// Shared capability set for a skip-list node, implemented by both
/// `Sblk` and the database header acting as the list's sentinel head.
pub trait SkipNode {
	fn level(&self) -> u8;
	fn forward(&self, lvl: usize) -> u32;
	fn set_forward(&mut self, lvl: usize, addr: u32);
	fn back(&self) -> u32;
	fn set_back(&mut self, addr: u32);
	fn mark_dirty(&mut self);
	fn is_dirty(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Sblk {
	/// Block-aligned file offset this node occupies; 0 until first sync.
	pub addr: u64,
	pub flags: SblkFlags,
	pub lvl: u8,
	pub lkl: u8,
	pub pnum: u8,
	pub p0: u32,
	pub kvblkn: u32,
	pub pi: [u8; NSLOTS],
	pub n: [u32; SLEVELS],
	pub lk: [u8; MAX_LK],
	pub dirty: bool,
}

impl Sblk {
	pub fn empty(addr: u64, lvl: u8, kvblkn: u32) -> Self {
		Self {
			addr,
			flags: SblkFlags::empty(),
			lvl,
			lkl: 0,
			pnum: 0,
			p0: 0,
			kvblkn,
			pi: [0u8; NSLOTS],
			n: [0u32; SLEVELS],
			lk: [0u8; MAX_LK],
			dirty: true,
		}
	}

	pub fn decode(addr: u64, bytes: &[u8]) -> Result<Self> {
		if bytes.len() != SBLK_SIZE {
			return Err(Error::Corrupted("short sblk read".into()));
		}
		let flags = SblkFlags::from_bits_truncate(bytes[0]);
		let lvl = bytes[1];
		let lkl = bytes[2];
		let pnum = bytes[3];
		let p0 = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
		let kvblkn = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
		let mut pi = [0u8; NSLOTS];
		pi.copy_from_slice(&bytes[12..12 + NSLOTS]);
		let mut n = [0u32; SLEVELS];
		for (i, slot) in n.iter_mut().enumerate() {
			let o = 44 + i * 4;
			*slot = u32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
		}
		let mut lk = [0u8; MAX_LK];
		lk.copy_from_slice(&bytes[192..192 + MAX_LK]);
		if lvl as usize >= SLEVELS || pnum as usize > NSLOTS || lkl as usize > MAX_LK {
			return Err(Error::Corrupted("sblk field out of range".into()));
		}
		Ok(Self {
			addr,
			flags,
			lvl,
			lkl,
			pnum,
			p0,
			kvblkn,
			pi,
			n,
			lk,
			dirty: false,
		})
	}

	pub fn encode(&self, out: &mut [u8; SBLK_SIZE]) {
		out.fill(0);
		out[0] = self.flags.bits();
		out[1] = self.lvl;
		out[2] = self.lkl;
		out[3] = self.pnum;
		out[4..8].copy_from_slice(&self.p0.to_le_bytes());
		out[8..12].copy_from_slice(&self.kvblkn.to_le_bytes());
		out[12..12 + NSLOTS].copy_from_slice(&self.pi);
		for (i, &v) in self.n.iter().enumerate() {
			let o = 44 + i * 4;
			out[o..o + 4].copy_from_slice(&v.to_le_bytes());
		}
		out[192..192 + MAX_LK].copy_from_slice(&self.lk);
	}

	pub fn lowest_key(&self) -> &[u8] {
		&self.lk[..self.lkl as usize]
	}

	fn set_lowest_key(&mut self, key: &[u8]) {
		if key.len() <= MAX_LK {
			self.lkl = key.len() as u8;
			self.lk[..key.len()].copy_from_slice(key);
			self.lk[key.len()..].fill(0);
			self.flags.insert(SblkFlags::FULL_LKEY);
		} else {
			self.lkl = MAX_LK as u8;
			self.lk.copy_from_slice(&key[..MAX_LK]);
			self.flags.remove(SblkFlags::FULL_LKEY);
		}
		self.dirty = true;
	}

	/// Binary search `pi[0..pnum)` by key, probing each candidate lazily
	/// via its KVBLK slot. Returns `(found, idx)` where `idx` is the
	/// matching index, or the insertion point when not found.
	pub fn find_pi(&self, kvblk: &KvBlk, key: &[u8], cmp: KeyCmp) -> Result<(bool, usize)> {
		let n = self.pnum as usize;
		let (mut lo, mut hi) = (0usize, n);
		while lo < hi {
			let mid = (lo + hi) / 2;
			let probe = kvblk.peek_key(self.pi[mid] as usize)?;
			match cmp(probe, key) {
				Ordering::Less => lo = mid + 1,
				Ordering::Greater => hi = mid,
				Ordering::Equal => return Ok((true, mid)),
			}
		}
		Ok((false, lo))
	}

	/// Insert `slot` into `pi` at the position `key` belongs, shifting
	/// later entries right. Caller must have already verified `pnum < 32`.
	pub fn insert_pi(&mut self, kvblk: &KvBlk, slot: usize, key: &[u8], cmp: KeyCmp) -> Result<usize> {
		debug_assert!((self.pnum as usize) < NSLOTS);
		let (_, idx) = self.find_pi(kvblk, key, cmp)?;
		let n = self.pnum as usize;
		for i in (idx..n).rev() {
			self.pi[i + 1] = self.pi[i];
		}
		self.pi[idx] = slot as u8;
		self.pnum += 1;
		self.dirty = true;
		Ok(idx)
	}

	/// Insert `(key, val)`. Returns `KvBlockFull` when `pnum == 32`,
	/// signalling the caller to split.
	pub fn addkv(&mut self, kvblk: &mut KvBlk, key: &[u8], val: &[u8], cmp: KeyCmp) -> Result<usize> {
		if self.pnum as usize >= NSLOTS {
			return Err(Error::KvBlockFull);
		}
		let slot = kvblk.add_kv(key, val)?;
		let idx = self.insert_pi(kvblk, slot, key, cmp)?;
		if idx == 0 {
			self.set_lowest_key(key);
		}
		self.dirty = true;
		Ok(slot)
	}

	/// Overwrite the value already found at permutation index `idx`.
	pub fn updatekv(&mut self, kvblk: &mut KvBlk, idx: usize, key: &[u8], val: &[u8]) -> Result<()> {
		let slot = self.pi[idx] as usize;
		if let Some(new_slot) = kvblk.update_kv(slot, key, val)? {
			self.pi[idx] = new_slot as u8;
		}
		self.dirty = true;
		Ok(())
	}

	/// Remove the pair at permutation index `idx`, refreshing the lowest
	/// key from the new minimum when the removed pair held it.
	pub fn rmkv(&mut self, kvblk: &mut KvBlk, idx: usize) -> Result<()> {
		let slot = self.pi[idx] as usize;
		kvblk.rm_kv(slot)?;
		let n = self.pnum as usize;
		for i in idx..n - 1 {
			self.pi[i] = self.pi[i + 1];
		}
		self.pi[n - 1] = 0;
		self.pnum -= 1;
		self.dirty = true;
		if idx == 0 && self.pnum > 0 {
			let newkey = kvblk.peek_key(self.pi[0] as usize)?.to_vec();
			self.set_lowest_key(&newkey);
		}
		Ok(())
	}
}

impl SkipNode for Sblk {
	fn level(&self) -> u8 {
		self.lvl
	}
	fn forward(&self, lvl: usize) -> u32 {
		self.n[lvl]
	}
	fn set_forward(&mut self, lvl: usize, addr: u32) {
		self.n[lvl] = addr;
		self.dirty = true;
	}
	fn back(&self) -> u32 {
		self.p0
	}
	fn set_back(&mut self, addr: u32) {
		self.p0 = addr;
		self.dirty = true;
	}
	fn mark_dirty(&mut self) {
		self.dirty = true;
	}
	fn is_dirty(&self) -> bool {
		self.dirty
	}
}
