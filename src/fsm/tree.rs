//! In-memory best-fit tree of free extents.
//!
//! Kept as two maps in lock-step rather than one tree ordered by
//! `(length DESC, offset ASC)`: a `len -> {offset}` index answers
//! "smallest sufficient extent, lowest offset" directly via
//! `BTreeMap::range(len..)`, and an `offset -> len` index answers the
//! adjacency questions deallocation needs (is there a free extent right
//! before/after this one) in O(log n) instead of a linear scan.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct FreeTree {
	by_len: BTreeMap<u64, BTreeSet<u64>>,
	by_off: BTreeMap<u64, u64>,
}

impl FreeTree {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn clear(&mut self) {
		self.by_len.clear();
		self.by_off.clear();
	}

	pub fn is_empty(&self) -> bool {
		self.by_off.is_empty()
	}

	fn insert_raw(&mut self, off: u64, len: u64) {
		if len == 0 {
			return;
		}
		self.by_len.entry(len).or_default().insert(off);
		self.by_off.insert(off, len);
	}

	fn remove_raw(&mut self, off: u64, len: u64) {
		if let Some(set) = self.by_len.get_mut(&len) {
			set.remove(&off);
			if set.is_empty() {
				self.by_len.remove(&len);
			}
		}
		self.by_off.remove(&off);
	}

	/// Insert a free extent, merging with an adjacent extent on either
	/// side: no two free extents ever overlap or sit adjacent unmerged.
	pub fn insert_merge(&mut self, mut off: u64, mut len: u64) {
		if let Some((&pre_off, &pre_len)) = self.by_off.range(..off).next_back() {
			if pre_off + pre_len == off {
				self.remove_raw(pre_off, pre_len);
				off = pre_off;
				len += pre_len;
			}
		}
		if let Some((&next_off, &next_len)) = self.by_off.range(off + len..).next() {
			if off + len == next_off {
				self.remove_raw(next_off, next_len);
				len += next_len;
			}
		}
		self.insert_raw(off, len);
	}

	/// Remove exactly the extent `(off, len)`. Panics if it isn't present
	/// verbatim; callers split first when they need part of an extent.
	pub fn remove_exact(&mut self, off: u64, len: u64) {
		debug_assert_eq!(self.by_off.get(&off), Some(&len));
		self.remove_raw(off, len);
	}

	/// Best-fit search: the extent with the smallest length `>= want`,
	/// and among ties the lowest offset, optionally constrained so that
	/// `offset % align == 0`.
	pub fn find_best_fit(&self, want: u64, align: u64) -> Option<(u64, u64)> {
		for (&len, offsets) in self.by_len.range(want..) {
			for &off in offsets {
				if align <= 1 || off % align == 0 {
					return Some((off, len));
				}
				// Not aligned at the start, but an aligned sub-extent may
				// still fit inside this one.
				let aligned = off.div_ceil(align) * align;
				if aligned + want <= off + len {
					return Some((aligned, len - (aligned - off)));
				}
			}
		}
		None
	}

	/// The free extent, if any, whose range covers `point`. Used to
	/// recover a registered extent's true bounds after a best-fit search
	/// returned an aligned sub-window of it.
	pub fn extents_containing(&self, point: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
		self.by_off
			.range(..=point)
			.next_back()
			.filter(move |&(&o, &l)| point < o + l)
			.map(|(&o, &l)| (o, l))
			.into_iter()
	}

	/// The free extent with the largest offset, used to accelerate
	/// file-tail trimming (`lfbkoff`/`lfbklen`).
	pub fn largest_offset_extent(&self) -> Option<(u64, u64)> {
		self.by_off.iter().next_back().map(|(&o, &l)| (o, l))
	}

	pub fn total_free_blocks(&self) -> u64 {
		self.by_off.values().sum()
	}

	#[cfg(test)]
	pub fn extents(&self) -> Vec<(u64, u64)> {
		self.by_off.iter().map(|(&o, &l)| (o, l)).collect()
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn merges_adjacent() {
		let mut t = FreeTree::new();
		t.insert_merge(0, 4);
		t.insert_merge(8, 4);
		assert_eq!(t.extents(), vec![(0, 4), (8, 4)]);
		t.insert_merge(4, 4);
		assert_eq!(t.extents(), vec![(0, 12)]);
	}

	#[test]
	fn best_fit_picks_smallest_sufficient() {
		let mut t = FreeTree::new();
		t.insert_merge(100, 10);
		t.insert_merge(0, 4);
		t.insert_merge(50, 6);
		assert_eq!(t.find_best_fit(4, 1), Some((0, 4)));
		assert_eq!(t.find_best_fit(5, 1), Some((50, 6)));
		assert_eq!(t.find_best_fit(7, 1), Some((100, 10)));
		assert_eq!(t.find_best_fit(11, 1), None);
	}
}
