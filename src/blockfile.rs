//! C1: block-granular persistent storage with memory-mapped windows.
//!
//! The whole file stays mapped for the lifetime of an open store rather
//! than being buffered one block at a time behind `Read`/`Write`/`Seek`,
//! since the skip-list descent and KVBLK compaction both need random,
//! overlapping access to many blocks within a single call.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as _;
use std::path::Path;

use fs4::fs_std::FileExt as Fs4FileExt;
use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{Error, Result, MAX_FILE_SIZE};

/// `IWKV_FSM_BPOW`: block grain is 2^6 = 64 bytes.
pub const BLOCK_POW: u32 = 6;
pub const BLOCK_SIZE: u64 = 1 << BLOCK_POW;

/// System-page alignment used for `PAGE_ALIGNED` allocations and for the
/// FSM bitmap's own placement.
pub const PAGE_SIZE: u64 = 4096;

bitflags::bitflags! {
	/// Store-open flags. `RDONLY` + `TRUNC` together resolve to a
	/// writable store: `TRUNC` always implies write access.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct OpenFlags: u32 {
		const RDONLY  = 1 << 0;
		const TRUNC   = 1 << 1;
		const NOLOCKS = 1 << 2;
	}

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SyncFlags: u32 {
		/// Flush mmap'd pages back to the file.
		const MMAP = 1 << 0;
		/// fsync the file descriptor.
		const FDATASYNC = 1 << 1;
		const FULL = Self::MMAP.bits() | Self::FDATASYNC.bits();
	}

	/// Allocation request modifiers passed down to the free-space manager.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct AllocFlags: u32 {
		const PAGE_ALIGNED   = 1 << 0;
		const NO_OVERALLOCATE = 1 << 1;
		const NO_EXTEND      = 1 << 2;
		const NO_STATS       = 1 << 3;
	}
}

/// Round `blocks` up to the next Fibonacci-like term so growth roughly
/// doubles file size each time without the pathological doubling of a
/// plain `next_power_of_two` once the file is already large.
fn fib_grow(cur_blocks: u64, want_blocks: u64) -> u64 {
	let (mut a, mut b) = (cur_blocks.max(1), cur_blocks.max(1) + cur_blocks.max(1) / 2 + 1);
	while a < want_blocks {
		let next = a + b;
		a = b;
		b = next;
	}
	a.max(want_blocks)
}

pub struct BlockFile {
	file:   File,
	mmap:   RwLock<MmapMut>,
	rdonly: bool,
	locked: bool,
}

impl BlockFile {
	pub fn open(path: &Path, flags: OpenFlags, initial_len: u64) -> Result<Self> {
		let rdonly = flags.contains(OpenFlags::RDONLY) && !flags.contains(OpenFlags::TRUNC);
		let mut opts = OpenOptions::new();
		opts.read(true).write(!rdonly).create(!rdonly);
		if flags.contains(OpenFlags::TRUNC) {
			opts.truncate(true);
		}
		let file = opts.open(path)?;

		let locked = if !flags.contains(OpenFlags::NOLOCKS) {
			if rdonly {
				Fs4FileExt::lock_shared(&file)?;
			} else {
				Fs4FileExt::lock_exclusive(&file)?;
			}
			true
		} else {
			false
		};

		let len = file.metadata()?.len();
		if len < initial_len {
			file.set_len(initial_len)?;
		}
		let mmap = unsafe { MmapMut::map_mut(&file)? };

		Ok(Self {
			file,
			mmap: RwLock::new(mmap),
			rdonly,
			locked,
		})
	}

	pub fn is_rdonly(&self) -> bool {
		self.rdonly
	}

	pub fn len(&self) -> u64 {
		self.mmap.read().len() as u64
	}

	fn assert_rw(&self) -> Result<()> {
		if self.rdonly {
			Err(Error::ReadOnly)
		} else {
			Ok(())
		}
	}

	/// Grow the file so its length is at least `want`, using a
	/// Fibonacci-like growth policy capped at `MAX_FILE_SIZE`.
	pub fn ensure_size(&self, want: u64) -> Result<()> {
		self.assert_rw()?;
		if want > MAX_FILE_SIZE {
			return Err(Error::MaxDbSize);
		}
		let cur = self.len();
		if want <= cur {
			return Ok(());
		}
		let cur_blocks = cur / BLOCK_SIZE;
		let want_blocks = want.div_ceil(BLOCK_SIZE);
		let new_blocks = fib_grow(cur_blocks, want_blocks).min(MAX_FILE_SIZE / BLOCK_SIZE);
		let new_len = (new_blocks * BLOCK_SIZE).min(MAX_FILE_SIZE);
		log::debug!("growing store file from {cur} to {new_len} bytes");

		let mut mmap = self.mmap.write();
		mmap.flush()?;
		self.file.set_len(new_len)?;
		*mmap = unsafe { MmapMut::map_mut(&self.file)? };
		Ok(())
	}

	/// Shrink the file to exactly `new_len` bytes. Used by the FSM's
	/// close-time trim; never grows the file.
	pub fn truncate(&self, new_len: u64) -> Result<()> {
		self.assert_rw()?;
		let mut mmap = self.mmap.write();
		if new_len >= mmap.len() as u64 {
			return Ok(());
		}
		mmap.flush()?;
		self.file.set_len(new_len)?;
		*mmap = unsafe { MmapMut::map_mut(&self.file)? };
		Ok(())
	}

	pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
		let mmap = self.mmap.read();
		let off = off as usize;
		if off >= mmap.len() {
			return Ok(0);
		}
		let n = buf.len().min(mmap.len() - off);
		buf[..n].copy_from_slice(&mmap[off..off + n]);
		Ok(n)
	}

	pub fn write(&self, off: u64, buf: &[u8]) -> Result<usize> {
		self.assert_rw()?;
		self.ensure_size(off + buf.len() as u64)?;
		let mut mmap = self.mmap.write();
		let off = off as usize;
		mmap[off..off + buf.len()].copy_from_slice(buf);
		Ok(buf.len())
	}

	/// Access the reserved custom header without going through the free-space
	/// manager's own locking.
	pub fn readhdr(&self, off: u64, buf: &mut [u8]) -> Result<()> {
		let n = self.read(off, buf)?;
		if n != buf.len() {
			return Err(Error::Corrupted("short header read".into()));
		}
		Ok(())
	}

	pub fn writehdr(&self, off: u64, buf: &[u8]) -> Result<()> {
		self.write(off, buf).map(|_| ())
	}

	/// Borrow the full mmap window read-only.
	pub fn mmap_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		f(&self.mmap.read())
	}

	/// Borrow the full mmap window mutably. The write guard is held only
	/// for the duration of `f`.
	pub fn mmap_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
		self.assert_rw()?;
		Ok(f(&mut self.mmap.write()))
	}

	pub fn sync(&self, flags: SyncFlags) -> Result<()> {
		if flags.contains(SyncFlags::MMAP) {
			self.mmap.read().flush()?;
		}
		if flags.contains(SyncFlags::FDATASYNC) {
			self.file.sync_data()?;
		}
		Ok(())
	}

	/// Positional read that bypasses the mmap window, used only by tests
	/// that want to assert on raw file bytes.
	#[cfg(test)]
	pub(crate) fn pread_raw(&self, off: u64, buf: &mut [u8]) -> Result<()> {
		self.file.read_exact_at(buf, off)?;
		Ok(())
	}
}

impl Drop for BlockFile {
	fn drop(&mut self) {
		if self.locked {
			let _ = Fs4FileExt::unlock(&self.file);
		}
	}
}
