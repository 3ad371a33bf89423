use std::io;

/// Every fallible operation in this crate returns one of these kinds.
///
/// `KvBlockFull` and `RequireNlevel` are internal-only: the skip-list core
/// (see `lookup`) must recover from them by retrying after a split or by
/// drawing a new level, respectively. If one of the two ever escapes a
/// public entry point it is translated to `Corrupted` and logged.
///
/// "Light" errors (`NotFound`, `KeyExists`, `DupValueSize`) are expected
/// outcomes of normal use and are never logged at the error level.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid arguments: {0}")]
	InvalidArgs(String),

	#[error("invalid state: {0}")]
	InvalidState(String),

	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	#[error("allocation failure: {0}")]
	Alloc(String),

	#[error("threading error: {0}")]
	Threading(String),

	#[error("store is read-only")]
	ReadOnly,

	#[error("access out of bounds")]
	OutOfBounds,

	#[error("not implemented: {0}")]
	NotImplemented(&'static str),

	#[error("on-disk structure corrupted: {0}")]
	Corrupted(String),

	#[error("key not found")]
	NotFound,

	#[error("key already exists")]
	KeyExists,

	#[error("key/value pair exceeds the maximum size of {MAX_KV_SIZE} bytes")]
	MaxKvSize,

	#[error("store would exceed the maximum file size of {MAX_FILE_SIZE} bytes")]
	MaxDbSize,

	#[error("free-space manager has no extent large enough")]
	NoFreeSpace,

	#[error("invalid block size")]
	InvalidBlockSize,

	#[error("extent is not aligned to the requested grain")]
	RangeNotAligned,

	#[error("free-space manager integrity check failed: {0}")]
	Segmentation(String),

	#[error("invalid file metadata: {0}")]
	InvalidFileMeta(String),

	#[error("block is larger than the system page size")]
	PlatformPage,

	#[error("duplicate-value slot rejects a value of this width")]
	DupValueSize,

	#[error("key/value pair is too large for a numeric-duplicate database")]
	KeyNumValueSize,

	#[error("database was opened before with incompatible flags")]
	IncompatibleDbMode,

	/// Internal only: a KVBLK has no free slot / no room left for a pair.
	/// Never returned from a public API.
	#[error("internal: kvblk is full")]
	KvBlockFull,

	/// Internal only: the lookup context must be re-driven with a level
	/// chosen for the node about to be created or removed.
	#[error("internal: caller must supply a new level and redo the descent")]
	RequireNlevel,
}

/// Maximum encoded size of a single key/value pair: 2^28 - 1 bytes.
pub const MAX_KV_SIZE: u64 = 268_435_455;

/// Maximum file size a store will grow to: 255 GiB, block-aligned.
pub const MAX_FILE_SIZE: u64 = 0x3f_ffff_ffc0;

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// Internal-only error codes must never reach a public entry point: if
	/// one of them reaches here it means the skip-list core failed to
	/// recover from it, which is itself a corruption of invariants.
	pub(crate) fn escape_guard(self) -> Error {
		match self {
			Error::KvBlockFull | Error::RequireNlevel => {
				log::error!("internal error code leaked past the skip-list core: {self:?}");
				Error::Corrupted(format!("internal code leaked: {self}"))
			}
			other => other,
		}
	}

	/// Light errors are expected outcomes and stay silent at the logging
	/// layer; only the caller may choose to log them.
	pub(crate) fn is_light(&self) -> bool {
		matches!(self, Error::NotFound | Error::KeyExists | Error::DupValueSize)
	}
}
