//! C2: free-space manager. Owns the persistent block bitmap and the
//! in-memory best-fit tree of free extents, and keeps its own small
//! header decoded straight off the backing store.

mod bitmap;
mod tree;

use bincode::{Decode, Encode};
pub use bitmap::Bitmap;
pub use tree::FreeTree;

use crate::blockfile::{AllocFlags, BlockFile, BLOCK_SIZE, PAGE_SIZE};
use crate::codec;
use crate::error::{Error, Result};

pub const FSM_MAGIC: u32 = 0x19cc_7cc;

/// Offset of the FSM header within the store's reserved custom-header
/// region (right after the 12-byte store header: magic + first-db ptr).
pub const FSM_HDR_OFFSET: u64 = 12;

/// Total size of the store's reserved custom header.
pub const KVHDRSZ: u64 = 255;

/// Stats are reset once `crznum` exceeds this, to bound the running
/// sums' magnitude.
const STATS_RESET_THRESHOLD: u32 = 65_535;

#[derive(Debug, Clone, Copy, Encode, Decode)]
struct FsmHeader {
	magic:  u32,
	bpow:   u8,
	bmoff:  u64,
	bmlen:  u64,
	// Running allocation-size statistics: sum, count, and sum-of-squares
	// (the last stands in for the wire format's `crzvar` field; variance
	// is derived from it on read rather than stored pre-divided).
	crzsum:   u64,
	crznum:   u32,
	crzvar:   u64,
	reserved: [u8; 32],
	hdrlen:   u32,
}

const FSM_HEADER_LEN: usize = 4 + 1 + 8 + 8 + 8 + 4 + 8 + 32 + 4;

pub struct Fsm {
	header:  FsmHeader,
	bitmap:  Bitmap,
	tree:    FreeTree,
	lfbkoff: u64,
	lfbklen: u64,
}

impl Fsm {
	fn header_region_end() -> u64 {
		FSM_HDR_OFFSET + KVHDRSZ
	}

	fn bitmap_start_for(_bf: &BlockFile) -> u64 {
		// bmoff is always page-aligned.
		Self::header_region_end().div_ceil(PAGE_SIZE) * PAGE_SIZE
	}

	/// Initialize a brand new FSM: zero bitmap, mark the header region and
	/// the bitmap's own blocks allocated.
	pub fn create(bf: &BlockFile) -> Result<Self> {
		let bmoff = Self::bitmap_start_for(bf);
		let initial_bitmap_bytes = BLOCK_SIZE as usize; // one block of bits to start
		let bmlen = (initial_bitmap_bytes * 8) as u64;

		bf.ensure_size(bmoff + initial_bitmap_bytes as u64)?;

		let header = FsmHeader {
			magic: FSM_MAGIC,
			bpow: crate::blockfile::BLOCK_POW as u8,
			bmoff,
			bmlen,
			crzsum: 0,
			crznum: 0,
			crzvar: 0,
			reserved: [0u8; 32],
			hdrlen: FSM_HEADER_LEN as u32,
		};

		let mut fsm = Self {
			header,
			bitmap: Bitmap::with_len_blocks(bmlen),
			tree: FreeTree::new(),
			lfbkoff: 0,
			lfbklen: 0,
		};

		// Bootstrap: everything up to and including the bitmap's own
		// blocks is allocated; the rest is one large free extent.
		let reserved_blocks = (bmoff + initial_bitmap_bytes as u64).div_ceil(BLOCK_SIZE);
		fsm.bitmap.set_range(0, reserved_blocks, true);
		let total_blocks = bf.len() / BLOCK_SIZE;
		if total_blocks > reserved_blocks {
			fsm.tree.insert_merge(reserved_blocks, total_blocks - reserved_blocks);
		}
		fsm.refresh_lfbk();
		fsm.flush(bf)?;
		Ok(fsm)
	}

	/// Reopen an existing FSM: read the header, load the bitmap, and
	/// rebuild the free-extent tree from it.
	pub fn open(bf: &BlockFile) -> Result<Self> {
		let mut hdr_buf = [0u8; FSM_HEADER_LEN];
		bf.readhdr(FSM_HDR_OFFSET, &mut hdr_buf)?;
		let header: FsmHeader = codec::decode_be(&hdr_buf)?;
		if header.magic != FSM_MAGIC {
			return Err(Error::Corrupted("FSM header magic mismatch".into()));
		}

		let mut bitmap = Bitmap::with_len_blocks(header.bmlen);
		bf.readhdr(header.bmoff, &mut bitmap.bytes)?;

		let mut tree = FreeTree::new();
		for (off, len) in bitmap.free_runs() {
			tree.insert_merge(off, len);
		}

		let mut fsm = Self {
			header,
			bitmap,
			tree,
			lfbkoff: 0,
			lfbklen: 0,
		};
		fsm.refresh_lfbk();
		Ok(fsm)
	}

	fn refresh_lfbk(&mut self) {
		let (off, len) = self.tree.largest_offset_extent().unwrap_or((0, 0));
		self.lfbkoff = off;
		self.lfbklen = len;
	}

	pub fn flush(&self, bf: &BlockFile) -> Result<()> {
		let mut hdr_buf = [0u8; FSM_HEADER_LEN];
		codec::encode_be_into(&mut hdr_buf, &self.header)?;
		bf.writehdr(FSM_HDR_OFFSET, &hdr_buf)?;
		bf.writehdr(self.header.bmoff, &self.bitmap.bytes)?;
		Ok(())
	}

	pub fn allocated_blocks(&self) -> u64 {
		self.bitmap.nblocks() - self.tree.total_free_blocks()
	}

	pub fn total_blocks(&self) -> u64 {
		self.bitmap.nblocks()
	}

	fn record_alloc_stat(&mut self, len: u64, flags: AllocFlags) {
		if flags.contains(AllocFlags::NO_STATS) {
			return;
		}
		let h = &mut self.header;
		h.crzsum += len;
		h.crznum += 1;
		h.crzvar += len * len;
		if h.crznum > STATS_RESET_THRESHOLD {
			h.crzsum = len;
			h.crznum = 1;
			h.crzvar = len * len;
		}
	}

	/// Mean and variance of the running allocation-size distribution.
	fn stats_mean_var(&self) -> (f64, f64) {
		let n = self.header.crznum as f64;
		if n == 0.0 {
			return (0.0, 0.0);
		}
		let mean = self.header.crzsum as f64 / n;
		let mean_sq = self.header.crzvar as f64 / n;
		(mean, (mean_sq - mean * mean).max(0.0))
	}

	/// Allocate at least `len_blocks` contiguous blocks.
	pub fn allocate(&mut self, bf: &BlockFile, len_blocks: u64, flags: AllocFlags) -> Result<(u64, u64)> {
		let align = if flags.contains(AllocFlags::PAGE_ALIGNED) {
			PAGE_SIZE / BLOCK_SIZE
		} else {
			1
		};

		loop {
			if let Some((off, fit_len)) = self.tree.find_best_fit(len_blocks, align) {
				// `find_best_fit` may have returned an aligned sub-window of
				// a larger, misaligned extent; recover the extent that
				// actually owns `off` so we remove exactly what's registered.
				let (owner_off, owner_len) = self.extent_owning(off, fit_len);
				self.tree.remove_exact(owner_off, owner_len);

				let head_slack = off - owner_off;
				if head_slack > 0 {
					self.tree.insert_merge(owner_off, head_slack);
				}

				let avail = owner_len - head_slack;
				let given_len = if avail == len_blocks {
					avail
				} else if flags.contains(AllocFlags::NO_OVERALLOCATE) {
					len_blocks
				} else {
					let tail_len = avail - len_blocks;
					let (mean, var) = self.stats_mean_var();
					let diff = mean - tail_len as f64;
					if self.header.crznum > 0 && diff * diff > 6.0 * var {
						avail
					} else {
						len_blocks
					}
				};

				if given_len < avail {
					self.tree.insert_merge(off + given_len, avail - given_len);
				}

				self.bitmap.set_range(off, given_len, true);
				self.record_alloc_stat(given_len, flags);
				self.refresh_lfbk();
				self.flush(bf)?;
				log::trace!("fsm::allocate(len={len_blocks}) -> (off={off}, len={given_len})");
				return Ok((off, given_len));
			}

			if flags.contains(AllocFlags::NO_EXTEND) {
				return Err(Error::NoFreeSpace);
			}
			self.extend(bf, len_blocks)?;
		}
	}

	/// Find the free extent that contains `off` (used to recover the full
	/// extent after `find_best_fit` returned an aligned sub-window of it).
	fn extent_owning(&self, off: u64, min_len: u64) -> (u64, u64) {
		for (o, l) in self.tree.extents_containing(off) {
			return (o, l);
		}
		(off, min_len)
	}

	fn extend(&mut self, bf: &BlockFile, want_blocks: u64) -> Result<()> {
		let old_bmlen = self.header.bmlen;
		let old_bitmap_blocks = old_bmlen.div_ceil(8).div_ceil(BLOCK_SIZE);

		let new_bmlen = (old_bmlen * 2).max(old_bmlen + want_blocks * 2);
		let new_bitmap_bytes = new_bmlen.div_ceil(8);
		let new_bitmap_blocks = new_bitmap_bytes.div_ceil(BLOCK_SIZE);
		let cur_total = bf.len() / BLOCK_SIZE;
		let new_total = (cur_total + want_blocks).max(new_bmlen);

		bf.ensure_size(new_total * BLOCK_SIZE)?;
		self.bitmap.resize_blocks(new_bmlen);
		self.header.bmlen = new_bmlen;

		let grown_from = cur_total;
		let grown_to = bf.len() / BLOCK_SIZE;
		if grown_to > grown_from {
			self.tree.insert_merge(grown_from, grown_to - grown_from);
		}

		// The bitmap's own on-disk footprint grows in place, from
		// `old_bitmap_blocks` to `new_bitmap_blocks` blocks starting at
		// `bmoff`. That extra span is still registered as free in the
		// tree (it was folded into the single bootstrap extent back in
		// `create`), so it has to be carved out before we mark it
		// allocated in the bitmap; otherwise a later `allocate()` could
		// hand those same blocks to a live KVBLK/SBLK and the next
		// `flush()` would overwrite it with the larger serialized
		// bitmap.
		let bm_start_block = self.header.bmoff / BLOCK_SIZE;
		if new_bitmap_blocks > old_bitmap_blocks {
			let carve_off = bm_start_block + old_bitmap_blocks;
			let carve_len = new_bitmap_blocks - old_bitmap_blocks;
			let (owner_off, owner_len) = self.extent_owning(carve_off, carve_len);
			self.tree.remove_exact(owner_off, owner_len);
			let head_slack = carve_off - owner_off;
			if head_slack > 0 {
				self.tree.insert_merge(owner_off, head_slack);
			}
			let tail_start = carve_off + carve_len;
			let tail_len = (owner_off + owner_len).saturating_sub(tail_start);
			if tail_len > 0 {
				self.tree.insert_merge(tail_start, tail_len);
			}
		}
		self.bitmap.set_range(bm_start_block, new_bitmap_blocks, true);
		self.refresh_lfbk();
		self.flush(bf)?;
		Ok(())
	}

	/// Deallocate `[off, off+len)`, merging with adjacent free extents.
	/// `strict` mirrors the `STRICT` opt flag.
	pub fn deallocate(&mut self, bf: &BlockFile, off: u64, len: u64, strict: bool) -> Result<()> {
		if strict && !self.bitmap.range_is(off, len, true) {
			return Err(Error::Segmentation(format!(
				"deallocate({off},{len}): not all blocks were allocated"
			)));
		}
		self.bitmap.set_range(off, len, false);
		self.tree.insert_merge(off, len);
		self.refresh_lfbk();
		self.flush(bf)
	}

	/// Grow or shrink an existing extent in place when possible; otherwise
	/// allocate a new extent, and the caller is responsible for copying
	/// the payload and deallocating the old extent.
	pub fn reallocate(
		&mut self,
		bf: &BlockFile,
		cur_off: u64,
		cur_len: u64,
		new_len: u64,
		flags: AllocFlags,
	) -> Result<(u64, u64, bool)> {
		use std::cmp::Ordering;
		match new_len.cmp(&cur_len) {
			Ordering::Equal => Ok((cur_off, cur_len, true)),
			Ordering::Less => {
				let freed = cur_len - new_len;
				self.tree.insert_merge(cur_off + new_len, freed);
				self.bitmap.set_range(cur_off + new_len, freed, false);
				self.refresh_lfbk();
				self.flush(bf)?;
				Ok((cur_off, new_len, true))
			}
			Ordering::Greater => {
				let grow_by = new_len - cur_len;
				if self.bitmap.range_is(cur_off + cur_len, grow_by, false)
					&& self.tree.extents_containing(cur_off + cur_len).next().is_some()
				{
					let (ext_off, ext_len) = self.extent_owning(cur_off + cur_len, grow_by);
					if ext_off == cur_off + cur_len && ext_len >= grow_by {
						self.tree.remove_exact(ext_off, ext_len);
						if ext_len > grow_by {
							self.tree.insert_merge(ext_off + grow_by, ext_len - grow_by);
						}
						self.bitmap.set_range(cur_off + cur_len, grow_by, true);
						self.refresh_lfbk();
						self.flush(bf)?;
						return Ok((cur_off, new_len, true));
					}
				}
				let (new_off, got_len) = self.allocate(bf, new_len, flags)?;
				Ok((new_off, got_len, false))
			}
		}
	}

	/// Close-time trim: relocate the bitmap to a lower free extent if one
	/// fits, then truncate the file at the last allocated block.
	pub fn trim(&mut self, bf: &BlockFile) -> Result<()> {
		let bitmap_blocks = self.header.bmlen.div_ceil(8).div_ceil(BLOCK_SIZE);
		let cur_bm_block = self.header.bmoff / BLOCK_SIZE;

		if let Some((off, len)) = self
			.tree
			.find_best_fit(bitmap_blocks, PAGE_SIZE / BLOCK_SIZE)
		{
			if off < cur_bm_block {
				self.tree.remove_exact(off, len);
				self.tree.insert_merge(cur_bm_block, bitmap_blocks);
				if len > bitmap_blocks {
					self.tree.insert_merge(off + bitmap_blocks, len - bitmap_blocks);
				}
				self.bitmap.set_range(cur_bm_block, bitmap_blocks, false);
				self.bitmap.set_range(off, bitmap_blocks, true);
				self.header.bmoff = off * BLOCK_SIZE;
			}
		}

		if let Some(last) = self.bitmap.last_set_bit() {
			let new_len = (last + 1) * BLOCK_SIZE;
			if new_len < bf.len() {
				log::debug!("trimming store file to {new_len} bytes");
				bf.truncate(new_len)?;
			}
		}
		self.flush(bf)
	}
}

#[cfg(test)]
mod t {
	use tempfile::NamedTempFile;

	use super::*;
	use crate::blockfile::OpenFlags;

	fn harness() -> (NamedTempFile, BlockFile) {
		let f = NamedTempFile::new().unwrap();
		let bf = BlockFile::open(f.path(), OpenFlags::empty(), BLOCK_SIZE * 64).unwrap();
		(f, bf)
	}

	#[test]
	fn create_allocate_deallocate() {
		let (_f, bf) = harness();
		let mut fsm = Fsm::create(&bf).unwrap();
		let (off1, len1) = fsm.allocate(&bf, 4, AllocFlags::NO_OVERALLOCATE).unwrap();
		assert_eq!(len1, 4);
		let (off2, len2) = fsm.allocate(&bf, 4, AllocFlags::NO_OVERALLOCATE).unwrap();
		assert_eq!(len2, 4);
		assert_ne!(off1, off2);

		fsm.deallocate(&bf, off1, len1, true).unwrap();
		fsm.deallocate(&bf, off2, len2, true).unwrap();

		// conservation: total == allocated + free, at a quiescent point.
		assert_eq!(fsm.total_blocks(), fsm.allocated_blocks() + fsm.tree.total_free_blocks());
	}

	#[test]
	fn strict_rejects_double_free() {
		let (_f, bf) = harness();
		let mut fsm = Fsm::create(&bf).unwrap();
		let (off, len) = fsm.allocate(&bf, 2, AllocFlags::NO_OVERALLOCATE).unwrap();
		fsm.deallocate(&bf, off, len, true).unwrap();
		assert!(matches!(
			fsm.deallocate(&bf, off, len, true),
			Err(Error::Segmentation(_))
		));
	}

	#[test]
	fn extend_keeps_tree_and_bitmap_in_sync() {
		let (_f, bf) = harness();
		let mut fsm = Fsm::create(&bf).unwrap();

		// Drive well past the initial ~512-block bitmap capacity so
		// `bmlen` itself has to grow and its on-disk footprint expands
		// in place.
		let mut allocs = Vec::new();
		for _ in 0..20 {
			let (off, len) = fsm.allocate(&bf, 64, AllocFlags::NO_OVERALLOCATE).unwrap();
			allocs.push((off, len));
		}
		assert!(fsm.header.bmlen > 512);

		let bm_start = fsm.header.bmoff / BLOCK_SIZE;
		let bm_end = bm_start + fsm.header.bmlen.div_ceil(8).div_ceil(BLOCK_SIZE);
		for &(off, len) in &allocs {
			assert!(
				off >= bm_end || off + len <= bm_start,
				"allocation [{off}, {}) overlaps bitmap footprint [{bm_start}, {bm_end})",
				off + len
			);
		}

		assert_eq!(fsm.total_blocks(), fsm.allocated_blocks() + fsm.tree.total_free_blocks());
	}

	#[test]
	fn reopen_rebuilds_tree() {
		let (f, bf) = harness();
		let mut fsm = Fsm::create(&bf).unwrap();
		let (off, len) = fsm.allocate(&bf, 4, AllocFlags::NO_OVERALLOCATE).unwrap();
		fsm.flush(&bf).unwrap();
		drop(fsm);
		drop(bf);

		let bf2 = BlockFile::open(f.path(), OpenFlags::empty(), 0).unwrap();
		let fsm2 = Fsm::open(&bf2).unwrap();
		assert!(fsm2.bitmap.range_is(off, len, true));
	}
}
