//! ULP_TX scatter-gather lists.
//!
//! The first segment sits in the list header next to the command word.
//! The rest are packed in pairs, two lengths followed by two addresses, and
//! a lone final segment leaves the length of its missing partner zeroed.

use smallvec::SmallVec;
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::msg::{S_ULPTX_CMD, ULP_TX_SC_DSGL};
use crate::config::TX_SGL_SEGS;
use crate::mm::DmaSeg;

pub const M_ULPTX_NSGE: u32 = 0xffff;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct UlptxSgl {
	cmd_nsge: U32,
	len0: U32,
	addr0: U64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct UlptxSgePair {
	len: [U32; 2],
	addr: [U64; 2],
}

/// Flits an SGL of `nsegs` segments takes up.
pub const fn nflits(nsegs: usize) -> u32 {
	if nsegs == 0 {
		return 0;
	}
	let n = nsegs - 1;
	((3 * n) / 2 + (n & 1) + 2) as u32
}

/// Size of the largest list a work request can carry.
pub const SGL_MAX_BYTES: usize = nflits(TX_SGL_SEGS) as usize * 8;

/// Encodes `segs` into `out` and returns the bytes used, always a whole
/// number of flits.
pub fn encode(segs: &[DmaSeg], out: &mut [u8; SGL_MAX_BYTES]) -> usize {
	let Some((first, rest)) = segs.split_first() else {
		return 0;
	};
	debug_assert!(segs.len() <= TX_SGL_SEGS);

	let header = UlptxSgl {
		cmd_nsge: U32::new((ULP_TX_SC_DSGL << S_ULPTX_CMD) | segs.len() as u32),
		len0: U32::new(first.len),
		addr0: U64::new(first.addr),
	};
	out[..16].copy_from_slice(header.as_bytes());

	let mut pos = 16;
	for pair in rest.chunks(2) {
		let second = pair.get(1).copied().unwrap_or(DmaSeg { addr: 0, len: 0 });
		let sge = UlptxSgePair {
			len: [U32::new(pair[0].len), U32::new(second.len)],
			addr: [U64::new(pair[0].addr), U64::new(second.addr)],
		};
		// An odd tail stops after the first address.
		let n = if pair.len() == 2 { 24 } else { 16 };
		out[pos..pos + n].copy_from_slice(&sge.as_bytes()[..n]);
		pos += n;
	}

	debug_assert_eq!(pos, nflits(segs.len()) as usize * 8);
	pos
}

/// Reads a list back. Returns `None` if `bytes` is not a well-formed list.
pub fn decode(bytes: &[u8]) -> Option<SmallVec<[DmaSeg; 8]>> {
	let (header, _) = UlptxSgl::read_from_prefix(bytes).ok()?;
	let cmd = header.cmd_nsge.get();
	if cmd >> S_ULPTX_CMD != ULP_TX_SC_DSGL {
		return None;
	}
	let nsge = (cmd & M_ULPTX_NSGE) as usize;
	if nsge == 0 || bytes.len() < nflits(nsge) as usize * 8 {
		return None;
	}

	let mut segs = SmallVec::new();
	segs.push(DmaSeg {
		addr: header.addr0.get(),
		len: header.len0.get(),
	});
	let mut rest = &bytes[16..];
	let mut left = nsge - 1;
	while left > 0 {
		let mut raw = [0u8; 24];
		let n = rest.len().min(24);
		raw[..n].copy_from_slice(&rest[..n]);
		let (pair, _) = UlptxSgePair::read_from_prefix(&raw[..]).ok()?;
		for i in 0..left.min(2) {
			segs.push(DmaSeg {
				addr: pair.addr[i].get(),
				len: pair.len[i].get(),
			});
		}
		left -= left.min(2);
		rest = &rest[n..];
	}
	Some(segs)
}
