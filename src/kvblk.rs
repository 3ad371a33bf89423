//! C3: KVBLK, the variable-size block holding up to 32 key/value pairs.
//! Pairs grow from the block's end toward the middle; the
//! slot table and a 1-byte `szpow` + 4-byte `idxsz` header grow from the
//! start. `KvBlk` is a plain in-memory value: callers decode it from a
//! block-sized byte slice taken from the store's mmap, mutate it, and
//! write the (possibly now larger or smaller) result back, handing block
//! (re)allocation off to the free-space manager, keeping it as a value
//! decoded from/encoded back to a fixed on-disk slot rather than a live
//! view into the mmap.

use crate::error::{Error, Result};
use crate::varint;

pub const NSLOTS: usize = 32;
/// `szpow >= 9` ⇒ minimum KVBLK size of 512 bytes.
pub const MIN_SZPOW: u8 = 9;
/// Fixed header prelude: `szpow:u8` + `idxsz:u32`.
const HEADER_PRELUDE: u32 = 1 + 4;
/// Safety margin reserved against the slot table growing a few bytes
/// when a previously-zero slot's varint encoding gets longer.
const HEADER_SLACK: u32 = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
	/// Offset of the pair's end, measured backward from the block's end.
	pub off: u32,
	pub len: u32,
}

impl Slot {
	fn is_empty(&self) -> bool {
		self.len == 0
	}
}

#[derive(Debug, Clone)]
pub struct KvBlk {
	pub szpow: u8,
	pub slots: [Slot; NSLOTS],
	pub maxoff: u32,
	pub data: Vec<u8>,
	pub dirty: bool,
}

impl KvBlk {
	pub fn create(szpow: u8) -> Self {
		debug_assert!(szpow >= MIN_SZPOW);
		Self {
			szpow,
			slots: [Slot::default(); NSLOTS],
			maxoff: 0,
			data: vec![0u8; 1usize << szpow],
			dirty: true,
		}
	}

	pub fn block_len(&self) -> u32 {
		1u32 << self.szpow
	}

	fn idxsz(&self) -> u32 {
		self.slots
			.iter()
			.map(|s| (varint::encoded_len(s.off) + varint::encoded_len(s.len)) as u32)
			.sum()
	}

	fn header_len(&self) -> u32 {
		HEADER_PRELUDE + self.idxsz()
	}

	fn first_free_slot(&self) -> Option<usize> {
		self.slots.iter().position(Slot::is_empty)
	}

	pub fn pair_count(&self) -> usize {
		self.slots.iter().filter(|s| !s.is_empty()).count()
	}

	fn try_fit(&self, extra: u32) -> bool {
		let used = self.header_len() + self.maxoff + HEADER_SLACK;
		used <= self.block_len() && self.block_len() - used >= extra
	}

	/// Decode a KVBLK from a block-sized slice taken from the mmap.
	pub fn decode(bytes: &[u8]) -> Result<Self> {
		if bytes.is_empty() {
			return Err(Error::Corrupted("empty kvblk slice".into()));
		}
		let szpow = bytes[0];
		if szpow < MIN_SZPOW || (1usize << szpow) != bytes.len() {
			return Err(Error::InvalidBlockSize);
		}
		let idxsz = u32::from_le_bytes(bytes[1..5].try_into().unwrap());
		let mut slots = [Slot::default(); NSLOTS];
		let mut pos = 5usize;
		for s in slots.iter_mut() {
			let (off, n1) = varint::decode(&bytes[pos..])?;
			pos += n1;
			let (len, n2) = varint::decode(&bytes[pos..])?;
			pos += n2;
			*s = Slot { off, len };
		}
		if pos != 5 + idxsz as usize {
			return Err(Error::Corrupted("kvblk idxsz mismatch".into()));
		}
		let maxoff = slots.iter().filter(|s| !s.is_empty()).map(|s| s.off).max().unwrap_or(0);
		Ok(Self {
			szpow,
			slots,
			maxoff,
			data: bytes.to_vec(),
			dirty: false,
		})
	}

	/// Rewrite the header/index region if dirty. Pair payloads are
	/// mutated directly in `data` by `add_kv`/`update_kv`/`compact`, so
	/// they never need a separate write step.
	pub fn sync_mm(&mut self) -> Result<()> {
		if !self.dirty {
			return Ok(());
		}
		let mut idx_bytes = Vec::with_capacity(self.idxsz() as usize);
		for s in &self.slots {
			varint::encode(s.off, &mut idx_bytes);
			varint::encode(s.len, &mut idx_bytes);
		}
		self.data[0] = self.szpow;
		self.data[1..5].copy_from_slice(&(idx_bytes.len() as u32).to_le_bytes());
		self.data[5..5 + idx_bytes.len()].copy_from_slice(&idx_bytes);
		self.dirty = false;
		Ok(())
	}

	fn pair_bounds(&self, slot_idx: usize) -> Result<(usize, usize)> {
		let s = self.slots[slot_idx];
		if s.is_empty() {
			return Err(Error::NotFound);
		}
		let start = (self.block_len() - s.off) as usize;
		Ok((start, start + s.len as usize))
	}

	pub fn peek_key(&self, slot_idx: usize) -> Result<&[u8]> {
		let (start, _) = self.pair_bounds(slot_idx)?;
		let (keylen, n) = varint::decode(&self.data[start..])?;
		Ok(&self.data[start + n..start + n + keylen as usize])
	}

	pub fn peek_val(&self, slot_idx: usize) -> Result<&[u8]> {
		let (start, end) = self.pair_bounds(slot_idx)?;
		let (keylen, n) = varint::decode(&self.data[start..])?;
		Ok(&self.data[start + n + keylen as usize..end])
	}

	fn write_pair(&mut self, start: usize, key: &[u8], val: &[u8]) {
		let mut buf = Vec::with_capacity(varint::encoded_len(key.len() as u32) + key.len() + val.len());
		varint::encode(key.len() as u32, &mut buf);
		buf.extend_from_slice(key);
		buf.extend_from_slice(val);
		self.data[start..start + buf.len()].copy_from_slice(&buf);
	}

	/// Merge-sort the slot descriptors by offset and slide each pair
	/// toward the end, eliminating internal fragmentation so the
	/// compacted payload size always equals `maxoff`.
	pub fn compact(&mut self) {
		let mut items: Vec<(usize, Slot)> = self
			.slots
			.iter()
			.enumerate()
			.filter(|(_, s)| !s.is_empty())
			.map(|(i, &s)| (i, s))
			.collect();
		items.sort_by_key(|(_, s)| s.off);

		let block_len = self.block_len();
		let mut staged = Vec::with_capacity(self.maxoff as usize);
		let mut updates = Vec::with_capacity(items.len());
		let mut cursor = 0u32;
		for (idx, s) in items {
			let start = (block_len - s.off) as usize;
			staged.extend_from_slice(&self.data[start..start + s.len as usize]);
			cursor += s.len;
			updates.push((idx, Slot { off: cursor, len: s.len }));
		}
		let dest = (block_len - cursor) as usize;
		self.data[dest..dest + staged.len()].copy_from_slice(&staged);
		for (idx, s) in updates {
			self.slots[idx] = s;
		}
		self.maxoff = cursor;
		self.dirty = true;
	}

	fn double_size(&mut self) {
		let old_len = self.block_len();
		self.szpow += 1;
		let new_len = self.block_len();
		let mut new_data = vec![0u8; new_len as usize];
		let old_start = (old_len - self.maxoff) as usize;
		let new_start = (new_len - self.maxoff) as usize;
		new_data[new_start..new_start + self.maxoff as usize]
			.copy_from_slice(&self.data[old_start..old_start + self.maxoff as usize]);
		self.data = new_data;
		self.dirty = true;
	}

	fn halve_size(&mut self) {
		let old_len = self.block_len();
		self.szpow -= 1;
		let new_len = self.block_len();
		let mut new_data = vec![0u8; new_len as usize];
		let old_start = (old_len - self.maxoff) as usize;
		let new_start = (new_len - self.maxoff) as usize;
		new_data[new_start..new_start + self.maxoff as usize]
			.copy_from_slice(&self.data[old_start..old_start + self.maxoff as usize]);
		self.data = new_data;
		self.dirty = true;
	}

	fn grow_to_fit(&mut self, extra: u32) {
		while !self.try_fit(extra) {
			self.double_size();
		}
	}

	/// Shrink while the compacted payload is at most half of `2^szpow`
	/// and `szpow > MIN_SZPOW`.
	fn maybe_shrink(&mut self) {
		loop {
			if self.szpow <= MIN_SZPOW {
				return;
			}
			self.compact();
			if self.maxoff as u64 * 2 > self.block_len() as u64 {
				return;
			}
			self.halve_size();
		}
	}

	/// Insert `(key, val)`. The only way this fails is `pnum == 32`
	/// (every slot occupied) — all space pressure is
	/// absorbed internally via `compact`/grow-in-place first.
	pub fn add_kv(&mut self, key: &[u8], val: &[u8]) -> Result<usize> {
		let Some(slot_idx) = self.first_free_slot() else {
			return Err(Error::KvBlockFull);
		};
		let psz = (varint::encoded_len(key.len() as u32) + key.len() + val.len()) as u32;
		if !self.try_fit(psz) {
			self.compact();
		}
		if !self.try_fit(psz) {
			self.grow_to_fit(psz);
		}
		let new_maxoff = self.maxoff + psz;
		let start = (self.block_len() - new_maxoff) as usize;
		self.write_pair(start, key, val);
		self.slots[slot_idx] = Slot { off: new_maxoff, len: psz };
		self.maxoff = new_maxoff;
		self.dirty = true;
		Ok(slot_idx)
	}

	/// Update the pair at `slot_idx`. Returns `Some(new_slot)` when the
	/// value grew past its old slot and had to move (remove + add); the
	/// caller (SBLK, which owns `pi[]`) must then repoint that permutation
	/// entry at `new_slot`.
	pub fn update_kv(&mut self, slot_idx: usize, key: &[u8], val: &[u8]) -> Result<Option<usize>> {
		let cur = self.slots[slot_idx];
		if cur.is_empty() {
			return Err(Error::NotFound);
		}
		let new_psz = (varint::encoded_len(key.len() as u32) + key.len() + val.len()) as u32;
		if new_psz <= cur.len {
			let start = (self.block_len() - cur.off) as usize;
			self.write_pair(start, key, val);
			self.slots[slot_idx].len = new_psz;
			self.dirty = true;
			Ok(None)
		} else {
			self.rm_kv(slot_idx)?;
			Ok(Some(self.add_kv(key, val)?))
		}
	}

	/// Remove the pair at `slot_idx`, reclaiming `maxoff` if it owned it
	/// and shrinking the block if the remainder is sparse enough.
	pub fn rm_kv(&mut self, slot_idx: usize) -> Result<()> {
		let s = self.slots[slot_idx];
		if s.is_empty() {
			return Err(Error::NotFound);
		}
		self.slots[slot_idx] = Slot::default();
		if s.off == self.maxoff {
			self.maxoff = self.slots.iter().filter(|s| !s.is_empty()).map(|s| s.off).max().unwrap_or(0);
		}
		self.dirty = true;
		self.maybe_shrink();
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn add_peek_update_remove() {
		let mut kv = KvBlk::create(MIN_SZPOW);
		let s0 = kv.add_kv(b"alpha", b"1").unwrap();
		let s1 = kv.add_kv(b"beta", b"2").unwrap();
		assert_eq!(kv.peek_key(s0).unwrap(), b"alpha");
		assert_eq!(kv.peek_val(s1).unwrap(), b"2");

		assert_eq!(kv.update_kv(s0, b"alpha", b"1-updated").unwrap(), None);
		assert_eq!(kv.peek_val(s0).unwrap(), b"1-updated");

		kv.rm_kv(s1).unwrap();
		assert!(kv.peek_key(s1).is_err());
		assert_eq!(kv.pair_count(), 1);
	}

	#[test]
	fn grows_past_one_block() {
		let mut kv = KvBlk::create(MIN_SZPOW);
		for i in 0..20u32 {
			let key = format!("key-{i:04}");
			let val = vec![0xABu8; 64];
			kv.add_kv(key.as_bytes(), &val).unwrap();
		}
		assert!(kv.szpow > MIN_SZPOW);
		for i in 0..20u32 {
			let key = format!("key-{i:04}");
			let slot = (0..NSLOTS).find(|&s| kv.peek_key(s).ok() == Some(key.as_bytes())).unwrap();
			assert_eq!(kv.peek_val(slot).unwrap().len(), 64);
		}
	}

	#[test]
	fn full_after_32_pairs() {
		let mut kv = KvBlk::create(MIN_SZPOW);
		for i in 0..32u32 {
			kv.add_kv(format!("k{i}").as_bytes(), b"v").unwrap();
		}
		assert!(matches!(kv.add_kv(b"overflow", b"v"), Err(Error::KvBlockFull)));
	}

	#[test]
	fn shrinks_after_removal() {
		let mut kv = KvBlk::create(MIN_SZPOW);
		for i in 0..20u32 {
			kv.add_kv(format!("key-{i:04}").as_bytes(), &vec![0u8; 64]).unwrap();
		}
		let grown_szpow = kv.szpow;
		assert!(grown_szpow > MIN_SZPOW);
		for i in 0..18u32 {
			let key = format!("key-{i:04}");
			let slot = (0..NSLOTS).find(|&s| kv.peek_key(s).ok() == Some(key.as_bytes())).unwrap();
			kv.rm_kv(slot).unwrap();
		}
		assert!(kv.szpow < grown_szpow);
	}

	#[test]
	fn decode_encode_roundtrip() {
		let mut kv = KvBlk::create(MIN_SZPOW);
		kv.add_kv(b"k", b"v").unwrap();
		kv.sync_mm().unwrap();
		let bytes = kv.data.clone();
		let decoded = KvBlk::decode(&bytes).unwrap();
		assert_eq!(decoded.maxoff, kv.maxoff);
		assert_eq!(decoded.peek_key(0).unwrap(), b"k");
	}
}
