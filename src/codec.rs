//! Fixed-layout struct (de)serialization for on-disk headers and nodes,
//! targeting mmap'd byte slices directly rather than a `Read + Seek`
//! stream, since the whole store file stays mapped for the lifetime of
//! an open store instead of being streamed through a block cache.
//!
//! Headers and fixed-size numeric-key comparisons use big-endian so that
//! unsigned integer byte order matches unsigned integer value order.
//! SBLK's own fixed fields are packed by hand in little-endian to match
//! host order on the overwhelmingly common little-endian deployment
//! target, so they don't go through this module at all. The config here
//! is fixed-int (no LEB128) so struct sizes are exact and predictable.

use bincode::config::{self, BigEndian, Configuration, Fixint, NoLimit};
use bincode::{Decode, Encode};

use crate::error::{Error, Result};

pub const BE: Configuration<BigEndian, Fixint, NoLimit> =
	config::standard().with_big_endian().with_fixed_int_encoding();

pub fn decode_be<T: Decode>(buf: &[u8]) -> Result<T> {
	bincode::decode_from_slice(buf, BE)
		.map(|(v, _)| v)
		.map_err(|e| Error::Corrupted(format!("big-endian decode failed: {e}")))
}

pub fn encode_be_into(buf: &mut [u8], v: &impl Encode) -> Result<usize> {
	bincode::encode_into_slice(v, buf, BE)
		.map_err(|e| Error::Corrupted(format!("big-endian encode failed: {e}")))
}
