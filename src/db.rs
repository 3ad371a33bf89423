//! C6: store and database headers, and the top-level `Store`/`Db` API.
//!
//! A `Store` owns one memory-mapped file and its free-space manager; a
//! `Db` is one named skip list inside that file, addressed by a small
//! numeric id. The database header doubles as the skip list's
//! level-`SLEVELS` sentinel head, so it implements the same `SkipNode`
//! trait as an ordinary `Sblk`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::blockfile::{AllocFlags, BlockFile, OpenFlags, SyncFlags, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::fsm::Fsm;
use crate::lookup::{self, Ctx};
use crate::rng::{LevelRng, SLEVELS};
use crate::sblk::SkipNode;

/// Big-endian "iwkv"-style store magic, written at byte 0 of the file.
const STORE_MAGIC: u32 = 0x7661_756b;

pub type KeyCmpFn = fn(&[u8], &[u8]) -> Ordering;

fn cmp_bytes(a: &[u8], b: &[u8]) -> Ordering {
	a.cmp(b)
}

fn cmp_u32(a: &[u8], b: &[u8]) -> Ordering {
	let a = u32::from_be_bytes(a.try_into().unwrap_or([0; 4]));
	let b = u32::from_be_bytes(b.try_into().unwrap_or([0; 4]));
	a.cmp(&b)
}

fn cmp_u64(a: &[u8], b: &[u8]) -> Ordering {
	let a = u64::from_be_bytes(a.try_into().unwrap_or([0; 8]));
	let b = u64::from_be_bytes(b.try_into().unwrap_or([0; 8]));
	a.cmp(&b)
}

pub fn comparator_for(flags: DbFlags) -> KeyCmpFn {
	if flags.contains(DbFlags::UINT64_KEYS) {
		cmp_u64
	} else if flags.contains(DbFlags::UINT32_KEYS) {
		cmp_u32
	} else {
		cmp_bytes
	}
}

/// Member width (4 or 8 bytes) for a dup-mode database's flags, or
/// `InvalidArgs` if neither `DUP_*` bit is set.
pub(crate) fn dup_value_width(flags: DbFlags) -> Result<usize> {
	if flags.contains(DbFlags::DUP_UINT64_VALS) {
		Ok(crate::dupslot::width_of(true))
	} else if flags.contains(DbFlags::DUP_UINT32_VALS) {
		Ok(crate::dupslot::width_of(false))
	} else {
		Err(Error::InvalidArgs("database was not opened with a duplicate-value mode".into()))
	}
}

bitflags::bitflags! {
	/// Per-database mode flags, fixed for the lifetime of the database
	/// once the first pair is written.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DbFlags: u32 {
		/// Keys are exactly 4 bytes, compared as big-endian `u32`.
		const UINT32_KEYS = 1 << 0;
		/// Keys are exactly 8 bytes, compared as big-endian `u64`.
		const UINT64_KEYS = 1 << 1;
		/// Values are fixed 4-byte numeric duplicates kept in a sorted run.
		const DUP_UINT32_VALS = 1 << 2;
		/// Values are fixed 8-byte numeric duplicates kept in a sorted run.
		const DUP_UINT64_VALS = 1 << 3;
	}
}

const DB_MAGIC: u32 = 0x4442_7631;
/// Meaningful prefix: magic + flags + id + next + p0 + n[30] + c[30].
const DB_HEADER_MEAN_LEN: usize = 4 + 4 + 4 + 8 + 4 + SLEVELS * 4 + SLEVELS * 4;
/// Rounded up to the block grain.
pub const DB_HEADER_LEN: usize = 320;

#[derive(Debug, Clone)]
pub struct DbHeader {
	pub addr: u64,
	pub magic: u32,
	pub flags: DbFlags,
	pub id: u32,
	pub next: u64,
	pub p0: u32,
	pub n: [u32; SLEVELS],
	pub c: [u32; SLEVELS],
	pub dirty: bool,
}

impl DbHeader {
	pub fn new(addr: u64, id: u32, flags: DbFlags) -> Self {
		Self {
			addr,
			magic: DB_MAGIC,
			flags,
			id,
			next: 0,
			p0: 0,
			n: [0u32; SLEVELS],
			c: [0u32; SLEVELS],
			dirty: true,
		}
	}

	pub fn encode(&self, out: &mut [u8; DB_HEADER_LEN]) {
		out.fill(0);
		out[0..4].copy_from_slice(&self.magic.to_be_bytes());
		out[4..8].copy_from_slice(&self.flags.bits().to_be_bytes());
		out[8..12].copy_from_slice(&self.id.to_be_bytes());
		out[12..20].copy_from_slice(&self.next.to_be_bytes());
		out[20..24].copy_from_slice(&self.p0.to_be_bytes());
		for (i, &v) in self.n.iter().enumerate() {
			let o = 24 + i * 4;
			out[o..o + 4].copy_from_slice(&v.to_be_bytes());
		}
		for (i, &v) in self.c.iter().enumerate() {
			let o = 24 + SLEVELS * 4 + i * 4;
			out[o..o + 4].copy_from_slice(&v.to_be_bytes());
		}
	}

	pub fn decode(addr: u64, bytes: &[u8]) -> Result<Self> {
		if bytes.len() < DB_HEADER_MEAN_LEN {
			return Err(Error::Corrupted("short db header read".into()));
		}
		let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
		if magic != DB_MAGIC {
			return Err(Error::Corrupted("db header magic mismatch".into()));
		}
		let flags = DbFlags::from_bits_truncate(u32::from_be_bytes(bytes[4..8].try_into().unwrap()));
		let id = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
		let next = u64::from_be_bytes(bytes[12..20].try_into().unwrap());
		let p0 = u32::from_be_bytes(bytes[20..24].try_into().unwrap());
		let mut n = [0u32; SLEVELS];
		for (i, slot) in n.iter_mut().enumerate() {
			let o = 24 + i * 4;
			*slot = u32::from_be_bytes(bytes[o..o + 4].try_into().unwrap());
		}
		let mut c = [0u32; SLEVELS];
		for (i, slot) in c.iter_mut().enumerate() {
			let o = 24 + SLEVELS * 4 + i * 4;
			*slot = u32::from_be_bytes(bytes[o..o + 4].try_into().unwrap());
		}
		Ok(Self {
			addr,
			magic,
			flags,
			id,
			next,
			p0,
			n,
			c,
			dirty: false,
		})
	}

	/// Highest level with a node attached, or `None` for an empty list.
	pub fn top_level(&self) -> Option<u8> {
		self.n.iter().rposition(|&a| a != 0).map(|i| i as u8)
	}
}

impl SkipNode for DbHeader {
	fn level(&self) -> u8 {
		SLEVELS as u8
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

pub struct Database {
	pub header: DbHeader,
}

pub struct Store {
	bf:            BlockFile,
	fsm:           RwLock<Fsm>,
	first_db_addr: RwLock<u64>,
	dbs:           RwLock<HashMap<u32, Arc<RwLock<Database>>>>,
	rng:           Mutex<LevelRng>,
	rdonly:        bool,
}

impl Store {
	pub fn open(path: &Path, flags: OpenFlags) -> Result<Arc<Store>> {
		Self::open_with_rng(path, flags, LevelRng::from_time())
	}

	/// Like `open`, but draws skip-list levels from a PRNG seeded with a
	/// caller-supplied value instead of the clock, making level
	/// assignment (and therefore the resulting node layout) reproducible
	/// across runs.
	pub fn open_with_seed(path: &Path, flags: OpenFlags, seed: u64) -> Result<Arc<Store>> {
		Self::open_with_rng(path, flags, LevelRng::seeded(seed))
	}

	fn open_with_rng(path: &Path, flags: OpenFlags, rng: LevelRng) -> Result<Arc<Store>> {
		let rdonly = flags.contains(OpenFlags::RDONLY) && !flags.contains(OpenFlags::TRUNC);
		let bf = BlockFile::open(path, flags, crate::fsm::KVHDRSZ)?;

		let mut magic_buf = [0u8; 4];
		bf.readhdr(0, &mut magic_buf)?;
		let existing_magic = u32::from_be_bytes(magic_buf);

		let (fsm, first_db_addr) = if existing_magic == STORE_MAGIC {
			let fsm = Fsm::open(&bf)?;
			let mut ptr_buf = [0u8; 8];
			bf.readhdr(4, &mut ptr_buf)?;
			(fsm, u64::from_be_bytes(ptr_buf))
		} else {
			if rdonly {
				return Err(Error::InvalidFileMeta("store file is not initialized".into()));
			}
			let fsm = Fsm::create(&bf)?;
			bf.writehdr(0, &STORE_MAGIC.to_be_bytes())?;
			bf.writehdr(4, &0u64.to_be_bytes())?;
			(fsm, 0)
		};

		log::info!("opened store {path:?} (fresh={})", existing_magic != STORE_MAGIC);

		Ok(Arc::new(Store {
			bf,
			fsm: RwLock::new(fsm),
			first_db_addr: RwLock::new(first_db_addr),
			dbs: RwLock::new(HashMap::new()),
			rng: Mutex::new(rng),
			rdonly,
		}))
	}

	pub fn is_rdonly(&self) -> bool {
		self.rdonly
	}

	pub fn sync(&self, flags: SyncFlags) -> Result<()> {
		for db in self.dbs.read().values() {
			let mut d = db.write();
			if d.header.dirty {
				self.write_header(&mut d.header)?;
			}
		}
		self.fsm.read().flush(&self.bf)?;
		self.bf.sync(flags)
	}

	pub fn close(&self) -> Result<()> {
		if self.rdonly {
			return Ok(());
		}
		self.sync(SyncFlags::empty())?;
		self.fsm.write().trim(&self.bf)?;
		self.bf.sync(SyncFlags::FULL)
	}

	fn write_header(&self, header: &mut DbHeader) -> Result<()> {
		let mut buf = [0u8; DB_HEADER_LEN];
		header.encode(&mut buf);
		self.bf.write(header.addr, &buf)?;
		header.dirty = false;
		Ok(())
	}

	fn read_header(&self, addr: u64) -> Result<DbHeader> {
		let mut buf = [0u8; DB_HEADER_LEN];
		self.bf.readhdr(addr, &mut buf)?;
		DbHeader::decode(addr, &buf)
	}

	fn alloc_db_header(&self) -> Result<u64> {
		let len_blocks = (DB_HEADER_LEN as u64).div_ceil(BLOCK_SIZE);
		let (off, _) = self.fsm.write().allocate(&self.bf, len_blocks, AllocFlags::NO_OVERALLOCATE)?;
		Ok(off * BLOCK_SIZE)
	}

	/// Open (creating if absent) the database with the given numeric id.
	pub fn db(self: &Arc<Self>, id: u32, flags: DbFlags) -> Result<Db> {
		if let Some(existing) = self.dbs.read().get(&id) {
			let hdr_flags = existing.read().header.flags;
			if !flags.is_empty() && hdr_flags != flags {
				return Err(Error::IncompatibleDbMode);
			}
			return Ok(Db { store: self.clone(), id });
		}

		let mut addr = *self.first_db_addr.read();
		while addr != 0 {
			let header = self.read_header(addr)?;
			if header.id == id {
				if !flags.is_empty() && header.flags != flags {
					return Err(Error::IncompatibleDbMode);
				}
				self.dbs.write().insert(id, Arc::new(RwLock::new(Database { header })));
				return Ok(Db { store: self.clone(), id });
			}
			addr = header.next;
		}

		if self.rdonly {
			return Err(Error::NotFound);
		}

		let new_addr = self.alloc_db_header()?;
		let mut header = DbHeader::new(new_addr, id, flags);
		header.next = *self.first_db_addr.read();
		self.write_header(&mut header)?;
		*self.first_db_addr.write() = new_addr;
		self.bf.writehdr(4, &new_addr.to_be_bytes())?;

		self.dbs.write().insert(id, Arc::new(RwLock::new(Database { header })));
		log::debug!("created database {id} at block {}", new_addr / BLOCK_SIZE);
		Ok(Db { store: self.clone(), id })
	}

	/// Destroy a database: unlink its header from the chain immediately,
	/// then sweep its skip-list nodes in a detached background thread so
	/// the caller is not blocked on the size of what it deleted.
	pub fn db_destroy(self: &Arc<Self>, id: u32) -> Result<()> {
		if self.rdonly {
			return Err(Error::ReadOnly);
		}
		let removed = self.dbs.write().remove(&id);
		let db = match removed {
			Some(d) => d,
			None => {
				let addr = *self.first_db_addr.read();
				let h = self.find_header(addr, id)?;
				Arc::new(RwLock::new(Database { header: h }))
			}
		};

		let header = db.read().header.clone();
		self.unlink_header(&header)?;

		let store = self.clone();
		std::thread::Builder::new()
			.name(format!("db-sweep-{id}"))
			.spawn(move || store.sweep_database(header))
			.map_err(|e| Error::Threading(e.to_string()))?;
		Ok(())
	}

	fn find_header(&self, mut addr: u64, id: u32) -> Result<DbHeader> {
		while addr != 0 {
			let header = self.read_header(addr)?;
			if header.id == id {
				return Ok(header);
			}
			addr = header.next;
		}
		Err(Error::NotFound)
	}

	fn unlink_header(&self, target: &DbHeader) -> Result<()> {
		let mut addr = *self.first_db_addr.read();
		if addr == target.addr {
			*self.first_db_addr.write() = target.next;
			self.bf.writehdr(4, &target.next.to_be_bytes())?;
			return Ok(());
		}
		while addr != 0 {
			let mut header = self.read_header(addr)?;
			if header.next == target.addr {
				header.next = target.next;
				self.write_header(&mut header)?;
				return Ok(());
			}
			addr = header.next;
		}
		Ok(())
	}

	/// Walk every level-0 node of a removed database's skip list, freeing
	/// its KVBLK and SBLK blocks, then free the header block itself.
	fn sweep_database(&self, header: DbHeader) {
		if let Err(e) = self.sweep_database_inner(&header) {
			log::error!("database {} sweep failed: {e}", header.id);
		}
	}

	fn sweep_database_inner(&self, header: &DbHeader) -> Result<()> {
		let mut cur = header.n[0];
		while cur != 0 {
			let addr = cur as u64 * BLOCK_SIZE;
			let mut buf = [0u8; crate::sblk::SBLK_SIZE];
			self.bf.readhdr(addr, &mut buf)?;
			let sblk = crate::sblk::Sblk::decode(addr, &buf)?;
			let next = sblk.n[0];

			let mut szpow_buf = [0u8; 1];
			self.bf.readhdr(sblk.kvblkn as u64 * BLOCK_SIZE, &mut szpow_buf)?;
			let kv_len_blocks = (1u64 << szpow_buf[0]).div_ceil(BLOCK_SIZE);
			self.fsm.write().deallocate(&self.bf, sblk.kvblkn as u64, kv_len_blocks, true)?;

			let sblk_len_blocks = (crate::sblk::SBLK_SIZE as u64).div_ceil(BLOCK_SIZE);
			self.fsm.write().deallocate(&self.bf, cur as u64, sblk_len_blocks, true)?;
			cur = next;
		}
		let hdr_len_blocks = (DB_HEADER_LEN as u64).div_ceil(BLOCK_SIZE);
		self.fsm.write().deallocate(&self.bf, header.addr / BLOCK_SIZE, hdr_len_blocks, true)?;
		log::info!("database {} swept", header.id);
		Ok(())
	}
}

/// A handle to one open database. Cheap to clone; all state lives in the
/// owning `Store`.
#[derive(Clone)]
pub struct Db {
	store: Arc<Store>,
	id:    u32,
}

impl Db {
	/// Run `f` against a read lock on this database's header and a `Ctx`
	/// built from the owning store. Used by `Cursor` for traversal that
	/// doesn't go through `lookup::get/put/del`.
	pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&Ctx, &Database) -> Result<R>) -> Result<R> {
		let handle = self.handle();
		let db = handle.read();
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx {
			bf:  &self.store.bf,
			fsm: &self.store.fsm,
			cmp,
			rng: &self.store.rng,
		};
		f(&ctx, &db)
	}

	fn handle(&self) -> Arc<RwLock<Database>> {
		self.store
			.dbs
			.read()
			.get(&self.id)
			.cloned()
			.expect("Db handle outlived its Store entry")
	}

	fn validate_key(&self, flags: DbFlags, key: &[u8]) -> Result<()> {
		if flags.contains(DbFlags::UINT64_KEYS) && key.len() != 8 {
			return Err(Error::KeyNumValueSize);
		}
		if flags.contains(DbFlags::UINT32_KEYS) && key.len() != 4 {
			return Err(Error::KeyNumValueSize);
		}
		Ok(())
	}

	fn dup_width(&self, flags: DbFlags) -> Result<usize> {
		dup_value_width(flags)
	}

	pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
		let handle = self.handle();
		let db = handle.read();
		self.validate_key(db.header.flags, key)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx {
			bf:  &self.store.bf,
			fsm: &self.store.fsm,
			cmp,
			rng: &self.store.rng,
		};
		lookup::get(&ctx, &db, key).map_err(Error::escape_guard)
	}

	pub fn put(&self, key: &[u8], val: &[u8], no_overwrite: bool) -> Result<()> {
		if self.store.rdonly {
			return Err(Error::ReadOnly);
		}
		let handle = self.handle();
		let mut db = handle.write();
		self.validate_key(db.header.flags, key)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx {
			bf:  &self.store.bf,
			fsm: &self.store.fsm,
			cmp,
			rng: &self.store.rng,
		};
		let res = lookup::put(&ctx, &mut db, key, val, no_overwrite).map_err(Error::escape_guard);
		if db.header.dirty {
			self.store.write_header(&mut db.header)?;
		}
		res
	}

	pub fn del(&self, key: &[u8]) -> Result<()> {
		if self.store.rdonly {
			return Err(Error::ReadOnly);
		}
		let handle = self.handle();
		let mut db = handle.write();
		self.validate_key(db.header.flags, key)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx {
			bf:  &self.store.bf,
			fsm: &self.store.fsm,
			cmp,
			rng: &self.store.rng,
		};
		let res = lookup::del(&ctx, &mut db, key).map_err(Error::escape_guard);
		if db.header.dirty {
			self.store.write_header(&mut db.header)?;
		}
		res
	}

	/// Insert `val` into the sorted-duplicate run stored at `key`,
	/// creating the run if `key` has none yet. No-op if `val` is already
	/// a member.
	pub fn dup_add(&self, key: &[u8], val: u64) -> Result<()> {
		if self.store.rdonly {
			return Err(Error::ReadOnly);
		}
		let handle = self.handle();
		let mut db = handle.write();
		let width = self.dup_width(db.header.flags)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx { bf: &self.store.bf, fsm: &self.store.fsm, cmp, rng: &self.store.rng };
		let res = lookup::dup_put(&ctx, &mut db, key, width, val, false).map_err(Error::escape_guard);
		if db.header.dirty {
			self.store.write_header(&mut db.header)?;
		}
		res
	}

	/// Remove `val` from the sorted-duplicate run stored at `key`.
	/// Deletes the key outright if that was its last member.
	pub fn dup_rm(&self, key: &[u8], val: u64) -> Result<()> {
		if self.store.rdonly {
			return Err(Error::ReadOnly);
		}
		let handle = self.handle();
		let mut db = handle.write();
		let width = self.dup_width(db.header.flags)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx { bf: &self.store.bf, fsm: &self.store.fsm, cmp, rng: &self.store.rng };
		let res = lookup::dup_put(&ctx, &mut db, key, width, val, true).map_err(Error::escape_guard);
		if db.header.dirty {
			self.store.write_header(&mut db.header)?;
		}
		res
	}

	pub fn dup_num(&self, key: &[u8]) -> Result<u32> {
		let handle = self.handle();
		let db = handle.read();
		let width = self.dup_width(db.header.flags)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx { bf: &self.store.bf, fsm: &self.store.fsm, cmp, rng: &self.store.rng };
		lookup::dup_num(&ctx, &db, key, width).map_err(Error::escape_guard)
	}

	pub fn dup_contains(&self, key: &[u8], val: u64) -> Result<bool> {
		let handle = self.handle();
		let db = handle.read();
		let width = self.dup_width(db.header.flags)?;
		let cmp = comparator_for(db.header.flags);
		let ctx = Ctx { bf: &self.store.bf, fsm: &self.store.fsm, cmp, rng: &self.store.rng };
		lookup::dup_contains(&ctx, &db, key, width, val).map_err(Error::escape_guard)
	}

	pub(crate) fn flags(&self) -> DbFlags {
		self.handle().read().header.flags
	}

	/// Per-level node counts (`c[lvl]` in the on-disk header): how many
	/// nodes currently have a forward pointer at each skip-list level.
	/// Exposed mainly so tests can check level draws against a pinned
	/// PRNG seed.
	pub fn level_counts(&self) -> [u32; SLEVELS] {
		self.handle().read().header.c
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use tempfile::NamedTempFile;

	#[test]
	fn open_create_reopen_same_db() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(7, DbFlags::empty()).unwrap();
		db.put(b"k", b"v", false).unwrap();
		store.close().unwrap();
		drop(store);

		let store2 = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db2 = store2.db(7, DbFlags::empty()).unwrap();
		assert_eq!(db2.get(b"k").unwrap(), b"v");
	}

	#[test]
	fn incompatible_mode_rejected() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let _db = store.db(1, DbFlags::UINT32_KEYS).unwrap();
		assert!(matches!(store.db(1, DbFlags::UINT64_KEYS), Err(Error::IncompatibleDbMode)));
	}

	#[test]
	fn fixed_width_numeric_keys_compare_numerically() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::UINT32_KEYS).unwrap();
		db.put(&10u32.to_be_bytes(), b"ten", false).unwrap();
		db.put(&2u32.to_be_bytes(), b"two", false).unwrap();
		assert_eq!(db.get(&2u32.to_be_bytes()).unwrap(), b"two");
		assert!(matches!(db.put(b"bad", b"v", false), Err(Error::KeyNumValueSize)));
	}

	#[test]
	fn dup_values_stay_sorted_and_support_removal() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::DUP_UINT32_VALS).unwrap();

		db.dup_add(b"k", 5).unwrap();
		db.dup_add(b"k", 2).unwrap();
		db.dup_add(b"k", 5).unwrap();
		db.dup_add(b"k", 9).unwrap();
		assert_eq!(db.dup_num(b"k").unwrap(), 3);
		assert!(db.dup_contains(b"k", 5).unwrap());

		db.dup_rm(b"k", 5).unwrap();
		assert_eq!(db.dup_num(b"k").unwrap(), 2);
		assert!(!db.dup_contains(b"k", 5).unwrap());

		db.dup_rm(b"k", 2).unwrap();
		db.dup_rm(b"k", 9).unwrap();
		assert!(matches!(db.get(b"k"), Err(Error::NotFound)));
		assert!(matches!(db.dup_rm(b"k", 9), Err(Error::NotFound)));
	}

	#[test]
	fn dup_ops_reject_non_dup_database() {
		let f = NamedTempFile::new().unwrap();
		let store = Store::open(f.path(), OpenFlags::empty()).unwrap();
		let db = store.db(1, DbFlags::empty()).unwrap();
		assert!(matches!(db.dup_add(b"k", 1), Err(Error::InvalidArgs(_))));
	}
}
