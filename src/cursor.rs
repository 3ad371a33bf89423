//! Forward/backward iteration over a database's skip list at level 0,
//! independent of the `lookup::get/put/del` entry points.

use crate::db::Db;
use crate::error::{Error, Result};
use crate::lookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
	BeforeFirst,
	AfterLast,
	At { blockno: u32, idx: usize },
}

pub struct Cursor {
	db:  Db,
	pos: Pos,
}

impl Cursor {
	pub fn new(db: Db) -> Self {
		Self { db, pos: Pos::BeforeFirst }
	}

	pub fn to_first(&mut self) -> Result<()> {
		let newpos = self.db.with_locked(|_ctx, db| {
			Ok(match db.header.n[0] {
				0 => Pos::BeforeFirst,
				b => Pos::At { blockno: b, idx: 0 },
			})
		})?;
		self.pos = newpos;
		Ok(())
	}

	/// O(n) in the number of nodes; there is no direct "last" pointer, so
	/// this walks the level-0 chain to its end.
	pub fn to_last(&mut self) -> Result<()> {
		let newpos = self.db.with_locked(|ctx, db| {
			let mut cur = db.header.n[0];
			if cur == 0 {
				return Ok(Pos::AfterLast);
			}
			loop {
				let sblk = lookup::load_sblk(ctx.bf, cur)?;
				if sblk.n[0] == 0 {
					return Ok(Pos::At { blockno: cur, idx: sblk.pnum as usize - 1 });
				}
				cur = sblk.n[0];
			}
		})?;
		self.pos = newpos;
		Ok(())
	}

	/// Position on `key` if present, otherwise on the next key greater
	/// than it (or `AfterLast` if none exists).
	pub fn to_key(&mut self, key: &[u8]) -> Result<()> {
		let newpos = self.db.with_locked(|ctx, db| {
			let (blockno, found, idx) = lookup::locate(ctx, db, key)?;
			if blockno == 0 {
				return Ok(match db.header.n[0] {
					0 => Pos::AfterLast,
					b => Pos::At { blockno: b, idx: 0 },
				});
			}
			let sblk = lookup::load_sblk(ctx.bf, blockno)?;
			if found || idx < sblk.pnum as usize {
				Ok(Pos::At { blockno, idx })
			} else if sblk.n[0] != 0 {
				Ok(Pos::At { blockno: sblk.n[0], idx: 0 })
			} else {
				Ok(Pos::AfterLast)
			}
		})?;
		self.pos = newpos;
		Ok(())
	}

	pub fn get(&self) -> Result<(Vec<u8>, Vec<u8>)> {
		let Pos::At { blockno, idx } = self.pos else {
			return Err(Error::InvalidState("cursor is not positioned on a key".into()));
		};
		self.db.with_locked(|ctx, _db| {
			let sblk = lookup::load_sblk(ctx.bf, blockno)?;
			let szpow = lookup::szpow_of_block(ctx.bf, sblk.kvblkn)?;
			let kv = lookup::load_kvblk(ctx.bf, sblk.kvblkn, szpow)?;
			let slot = sblk.pi[idx] as usize;
			Ok((kv.peek_key(slot)?.to_vec(), kv.peek_val(slot)?.to_vec()))
		})
	}

	pub fn next(&mut self) -> Result<()> {
		let (blockno, idx) = match self.pos {
			Pos::At { blockno, idx } => (blockno, idx),
			Pos::BeforeFirst => return self.to_first(),
			Pos::AfterLast => return Err(Error::InvalidState("cursor is already after the last key".into())),
		};
		let newpos = self.db.with_locked(|ctx, _db| {
			let sblk = lookup::load_sblk(ctx.bf, blockno)?;
			if idx + 1 < sblk.pnum as usize {
				Ok(Pos::At { blockno, idx: idx + 1 })
			} else if sblk.n[0] != 0 {
				Ok(Pos::At { blockno: sblk.n[0], idx: 0 })
			} else {
				Ok(Pos::AfterLast)
			}
		})?;
		self.pos = newpos;
		Ok(())
	}

	pub fn prev(&mut self) -> Result<()> {
		let (blockno, idx) = match self.pos {
			Pos::At { blockno, idx } => (blockno, idx),
			Pos::AfterLast => return self.to_last(),
			Pos::BeforeFirst => return Err(Error::InvalidState("cursor is already before the first key".into())),
		};
		let newpos = self.db.with_locked(|ctx, _db| {
			if idx > 0 {
				return Ok(Pos::At { blockno, idx: idx - 1 });
			}
			let sblk = lookup::load_sblk(ctx.bf, blockno)?;
			if sblk.p0 == 0 {
				Ok(Pos::BeforeFirst)
			} else {
				let prev_sblk = lookup::load_sblk(ctx.bf, sblk.p0)?;
				Ok(Pos::At { blockno: sblk.p0, idx: prev_sblk.pnum as usize - 1 })
			}
		})?;
		self.pos = newpos;
		Ok(())
	}

	/// Sorted-duplicate helpers operate on the value run stored at the
	/// cursor's current key.
	fn current_key(&self) -> Result<Vec<u8>> {
		Ok(self.get()?.0)
	}

	pub fn dup_num(&self) -> Result<u32> {
		self.db.dup_num(&self.current_key()?)
	}

	pub fn dup_contains(&self, val: u64) -> Result<bool> {
		self.db.dup_contains(&self.current_key()?, val)
	}

	pub fn dup_add(&mut self, val: u64) -> Result<()> {
		let key = self.current_key()?;
		self.db.dup_add(&key, val)
	}

	pub fn dup_rm(&mut self, val: u64) -> Result<()> {
		let key = self.current_key()?;
		self.db.dup_rm(&key, val)
	}

	/// Visit every member of the current key's sorted-duplicate run, in
	/// ascending or descending order, optionally skipping members before
	/// (ascending) or after (descending) `start`. Stops early if
	/// `visitor` returns `false`.
	pub fn dup_iter(&self, start: Option<u64>, ascending: bool, mut visitor: impl FnMut(u64) -> bool) -> Result<()> {
		let key = self.current_key()?;
		let raw = self.db.get(&key)?;
		let width = crate::db::dup_value_width(self.db.flags())?;
		let mut vals = crate::dupslot::decode_values(&raw, width)?;
		if !ascending {
			vals.reverse();
		}
		for v in vals {
			if let Some(s) = start {
				if ascending && v < s {
					continue;
				}
				if !ascending && v > s {
					continue;
				}
			}
			if !visitor(v) {
				break;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::blockfile::OpenFlags;
	use crate::db::{DbFlags, Store};
	use tempfile::NamedTempFile;

	#[test]
	fn iterates_in_sorted_order() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::empty()).unwrap();
		for k in ["banana", "apple", "cherry", "date"] {
			db.put(k.as_bytes(), k.as_bytes(), false).unwrap();
		}

		let mut cur = Cursor::new(db);
		cur.to_first().unwrap();
		let mut seen = Vec::new();
		loop {
			let (k, _) = cur.get().unwrap();
			seen.push(String::from_utf8(k).unwrap());
			if cur.next().is_err() {
				break;
			}
			if matches!(cur.get(), Err(_)) {
				break;
			}
		}
		assert_eq!(seen, vec!["apple", "banana", "cherry", "date"]);
	}

	#[test]
	fn to_key_seeks_forward() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::empty()).unwrap();
		for k in ["a", "c", "e"] {
			db.put(k.as_bytes(), k.as_bytes(), false).unwrap();
		}
		let mut cur = Cursor::new(db);
		cur.to_key(b"b").unwrap();
		assert_eq!(cur.get().unwrap().0, b"c");
	}

	#[test]
	fn dup_iter_visits_in_both_directions() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();
		for v in [5u64, 2, 9] {
			db.dup_add(b"k", v).unwrap();
		}

		let mut cur = Cursor::new(db);
		cur.to_key(b"k").unwrap();

		let mut asc = Vec::new();
		cur.dup_iter(None, true, |v| {
			asc.push(v);
			true
		})
		.unwrap();
		assert_eq!(asc, vec![2, 5, 9]);

		let mut desc = Vec::new();
		cur.dup_iter(None, false, |v| {
			desc.push(v);
			true
		})
		.unwrap();
		assert_eq!(desc, vec![9, 5, 2]);
	}
}
