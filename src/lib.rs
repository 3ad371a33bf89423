//! Embedded single-file key/value storage engine backed by a
//! probabilistic skip-list index over a memory-mapped file, with its own
//! free-space manager for block (re)allocation.
//!
//! ```no_run
//! use vaultkv::{DbFlags, OpenFlags, Store};
//!
//! let store = Store::open("example.db".as_ref(), OpenFlags::empty())?;
//! let db = store.db(1, DbFlags::empty())?;
//! db.put(b"hello", b"world", false)?;
//! assert_eq!(db.get(b"hello")?, b"world");
//! store.close()?;
//! # Ok::<(), vaultkv::Error>(())
//! ```

mod blockfile;
mod codec;
mod cursor;
mod db;
mod dupslot;
mod error;
mod fsm;
mod kvblk;
mod lookup;
mod rng;
mod sblk;
mod varint;

pub use blockfile::{OpenFlags, SyncFlags};
pub use cursor::Cursor;
pub use db::{Db, DbFlags, Store};
pub use error::{Error, Result, MAX_FILE_SIZE, MAX_KV_SIZE};
