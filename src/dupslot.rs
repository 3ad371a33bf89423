//! Sorted-duplicate value runs for `DUP_UINT32_VALS`/`DUP_UINT64_VALS`
//! databases. A dup-mode key's stored value is itself a small sorted
//! array: `[count:u32 LE][v0, v1, ...]` ascending, width 4 or 8 bytes per
//! member. This module only computes the next version of that byte
//! blob; callers write it back through the normal `put`/`del` path, so
//! reallocation and persistence are handled exactly like any other
//! value.

use crate::error::{Error, Result};

const COUNT_LEN: usize = 4;

pub fn width_of(uint64: bool) -> usize {
	if uint64 { 8 } else { 4 }
}

pub fn empty_slot() -> Vec<u8> {
	0u32.to_le_bytes().to_vec()
}

fn count(buf: &[u8]) -> usize {
	u32::from_le_bytes(buf[0..COUNT_LEN].try_into().unwrap()) as usize
}

fn value_at(buf: &[u8], idx: usize, width: usize) -> u64 {
	let start = COUNT_LEN + idx * width;
	let bytes = &buf[start..start + width];
	if width == 4 {
		u32::from_be_bytes(bytes.try_into().unwrap()) as u64
	} else {
		u64::from_be_bytes(bytes.try_into().unwrap())
	}
}

fn encode_value(v: u64, width: usize, out: &mut [u8]) {
	if width == 4 {
		out.copy_from_slice(&(v as u32).to_be_bytes());
	} else {
		out.copy_from_slice(&v.to_be_bytes());
	}
}

fn validate(buf: &[u8], width: usize) -> Result<usize> {
	if buf.len() < COUNT_LEN {
		return Err(Error::DupValueSize);
	}
	let n = count(buf);
	if buf.len() != COUNT_LEN + n * width {
		return Err(Error::DupValueSize);
	}
	Ok(n)
}

pub fn decode_values(buf: &[u8], width: usize) -> Result<Vec<u64>> {
	let n = validate(buf, width)?;
	Ok((0..n).map(|i| value_at(buf, i, width)).collect())
}

pub fn num(buf: &[u8], width: usize) -> Result<u32> {
	Ok(validate(buf, width)? as u32)
}

pub fn contains(buf: &[u8], width: usize, v: u64) -> Result<bool> {
	let n = validate(buf, width)?;
	Ok((0..n).any(|i| value_at(buf, i, width) == v))
}

/// Insert `v` in sorted position, skipping a duplicate. `Ok(None)` means
/// `v` was already present and the blob is unchanged.
pub fn insert(buf: &[u8], width: usize, v: u64) -> Result<Option<Vec<u8>>> {
	let n = validate(buf, width)?;
	let mut idx = 0;
	while idx < n {
		match value_at(buf, idx, width).cmp(&v) {
			std::cmp::Ordering::Equal => return Ok(None),
			std::cmp::Ordering::Greater => break,
			std::cmp::Ordering::Less => idx += 1,
		}
	}
	let mut out = Vec::with_capacity(buf.len() + width);
	out.extend_from_slice(&((n + 1) as u32).to_le_bytes());
	out.extend_from_slice(&buf[COUNT_LEN..COUNT_LEN + idx * width]);
	let mut vbuf = vec![0u8; width];
	encode_value(v, width, &mut vbuf);
	out.extend_from_slice(&vbuf);
	out.extend_from_slice(&buf[COUNT_LEN + idx * width..COUNT_LEN + n * width]);
	Ok(Some(out))
}

/// Remove `v` if present. `Ok(None)` means `v` was not in the set.
pub fn remove(buf: &[u8], width: usize, v: u64) -> Result<Option<Vec<u8>>> {
	let n = validate(buf, width)?;
	let Some(idx) = (0..n).find(|&i| value_at(buf, i, width) == v) else {
		return Ok(None);
	};
	let mut out = Vec::with_capacity(buf.len());
	out.extend_from_slice(&((n - 1) as u32).to_le_bytes());
	out.extend_from_slice(&buf[COUNT_LEN..COUNT_LEN + idx * width]);
	out.extend_from_slice(&buf[COUNT_LEN + (idx + 1) * width..COUNT_LEN + n * width]);
	Ok(Some(out))
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn insert_keeps_ascending_order_and_skips_duplicates() {
		let mut slot = empty_slot();
		for v in [5u64, 2, 5, 9] {
			if let Some(next) = insert(&slot, 4, v).unwrap() {
				slot = next;
			}
		}
		assert_eq!(decode_values(&slot, 4).unwrap(), vec![2, 5, 9]);
		assert_eq!(num(&slot, 4).unwrap(), 3);
	}

	#[test]
	fn remove_shrinks_and_is_idempotent() {
		let mut slot = empty_slot();
		for v in [2u64, 5, 9] {
			slot = insert(&slot, 4, v).unwrap().unwrap();
		}
		slot = remove(&slot, 4, 5).unwrap().unwrap();
		assert_eq!(decode_values(&slot, 4).unwrap(), vec![2, 9]);
		assert!(remove(&slot, 4, 5).unwrap().is_none());
	}

	#[test]
	fn width_eight_round_trips() {
		let mut slot = empty_slot();
		for v in [1_000_000_000_000u64, 3, 42] {
			slot = insert(&slot, 8, v).unwrap().unwrap();
		}
		assert_eq!(decode_values(&slot, 8).unwrap(), vec![3, 42, 1_000_000_000_000]);
		assert!(contains(&slot, 8, 42).unwrap());
		assert!(!contains(&slot, 8, 7).unwrap());
	}
}
