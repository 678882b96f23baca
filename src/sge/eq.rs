//! Egress rings: credit accounting, doorbells and the flit writer that
//! lays work requests out in descriptor memory.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{Ordering, fence};

use volatile::map_field;
use zerocopy::{Immutable, IntoBytes};

use super::SgeHw;
use super::error::Busy;
use super::msg::{EqDesc, EqStatus};
use super::ring::{DescRing, ring_add, ring_dist};
use crate::config::{EQ_ESIZE, EQ_ESIZE_FLITS, EQ_SPG_DESCS};
use crate::mm::{DmaAllocator, DmaError};

/// Descriptors handed out by [`EqRing::reserve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRange {
	pub start: u16,
	pub count: u16,
}

pub(crate) struct EqRing {
	cntxt_id: u16,
	ring: DescRing<EqDesc>,
	qsize: u16,
	cidx: u16,
	pidx: u16,
	/// Written but not yet announced with a doorbell.
	pending: u16,
	/// Announced and not yet reclaimed.
	in_flight: u16,
	avail: u16,
}

impl EqRing {
	pub fn new(dma: Arc<dyn DmaAllocator>, qsize: u16) -> Result<Self, DmaError> {
		let ring = DescRing::new(dma, qsize, usize::from(EQ_SPG_DESCS) * EQ_ESIZE)?;
		Ok(Self {
			cntxt_id: 0,
			ring,
			qsize,
			cidx: 0,
			pidx: 0,
			pending: 0,
			in_flight: 0,
			// One descriptor stays empty so that a full ring is not mistaken
			// for an empty one.
			avail: qsize - 1,
		})
	}

	pub fn set_cntxt_id(&mut self, cntxt_id: u16) {
		self.cntxt_id = cntxt_id;
	}

	pub fn cntxt_id(&self) -> u16 {
		self.cntxt_id
	}

	pub fn avail(&self) -> u16 {
		self.avail
	}

	pub fn pending(&self) -> u16 {
		self.pending
	}

	pub fn in_flight(&self) -> u16 {
		self.in_flight
	}

	pub fn cidx(&self) -> u16 {
		self.cidx
	}

	pub fn pidx(&self) -> u16 {
		self.pidx
	}

	pub fn paddr(&self) -> u64 {
		self.ring.paddr()
	}

	fn check_credits(&self) {
		debug_assert_eq!(self.avail + self.pending + self.in_flight, self.qsize - 1);
		debug_assert_eq!(
			ring_dist(self.cidx, self.pidx, self.qsize),
			self.pending + self.in_flight
		);
	}

	pub fn reserve(&mut self, n: u16) -> Result<SlotRange, Busy> {
		if n > self.avail {
			return Err(Busy { needed: n });
		}
		let start = self.pidx;
		self.avail -= n;
		self.pending += n;
		self.pidx = ring_add(self.pidx, n, self.qsize);
		self.check_credits();
		Ok(SlotRange { start, count: n })
	}

	/// Consumer index the device last wrote to the status page.
	pub fn hw_cidx(&self) -> u16 {
		let status = self.ring.trailer::<EqStatus>();
		map_field!(status.cidx).read().get()
	}

	/// Descriptors the device has finished with since the last reclaim.
	pub fn completed(&self) -> u16 {
		let hw_cidx = self.hw_cidx();
		if hw_cidx >= self.qsize {
			warn!("eq {}: bogus hardware cidx {hw_cidx}", self.cntxt_id);
			return 0;
		}
		let done = ring_dist(self.cidx, hw_cidx, self.qsize);
		debug_assert!(done <= self.in_flight);
		done.min(self.in_flight)
	}

	/// Returns `n` completed descriptors to the free pool.
	pub fn retire(&mut self, n: u16) {
		debug_assert!(n <= self.in_flight);
		self.cidx = ring_add(self.cidx, n, self.qsize);
		self.in_flight -= n;
		self.avail += n;
		self.check_credits();
	}

	/// Pending descriptors worth a doorbell. Grows as the ring fills up.
	pub fn db_threshold(&self) -> u16 {
		let cap = self.qsize - 1;
		let used = cap - self.avail;
		if used < cap / 4 {
			1
		} else if used < cap / 2 {
			4
		} else if used < cap / 4 * 3 {
			8
		} else {
			16
		}
	}

	/// Rings the doorbell for everything pending. Returns `false` if there
	/// was nothing to announce.
	pub fn ring_doorbell(&mut self, hw: &dyn SgeHw) -> bool {
		if self.pending == 0 {
			return false;
		}
		fence(Ordering::Release);
		hw.ring_tx_doorbell(self.cntxt_id, self.pending);
		self.in_flight += self.pending;
		self.pending = 0;
		self.check_credits();
		true
	}

	pub fn ring_doorbell_batched(&mut self, hw: &dyn SgeHw) -> bool {
		self.pending >= self.db_threshold() && self.ring_doorbell(hw)
	}

	/// Writer starting at descriptor `desc`.
	pub fn writer(&mut self, desc: u16) -> FlitWriter<'_> {
		self.writer_at(desc, 0)
	}

	/// Writer starting `flits` into descriptor `desc`.
	pub fn writer_at(&mut self, desc: u16, flits: u32) -> FlitWriter<'_> {
		debug_assert!(desc < self.qsize);
		let ring_flits = u32::from(self.qsize) * EQ_ESIZE_FLITS;
		FlitWriter {
			base: self.ring.base().cast(),
			ring_flits,
			pos: (u32::from(desc) * EQ_ESIZE_FLITS + flits) % ring_flits,
			written: 0,
			_ring: PhantomData,
		}
	}

	/// Copies `nflits` flits out of the ring starting at descriptor `desc`.
	#[cfg(test)]
	pub fn read_flits(&self, desc: u16, nflits: u32) -> alloc::vec::Vec<u8> {
		let ring_flits = u32::from(self.qsize) * EQ_ESIZE_FLITS;
		let base = self.ring.base().cast::<[u8; 8]>();
		(0..nflits)
			.flat_map(|i| {
				let pos = (u32::from(desc) * EQ_ESIZE_FLITS + i) % ring_flits;
				unsafe { *base.as_ptr().add(pos as usize) }
			})
			.collect()
	}
}

/// Sequential writer of 8-byte flits into egress descriptor memory.
///
/// Writes never cross a descriptor within one copy and wrap from the last
/// descriptor back to the first.
pub(crate) struct FlitWriter<'a> {
	base: NonNull<u64>,
	ring_flits: u32,
	pos: u32,
	written: u32,
	_ring: PhantomData<&'a mut EqRing>,
}

impl FlitWriter<'_> {
	/// Flits left in the current descriptor.
	pub fn room_in_slot(&self) -> u32 {
		EQ_ESIZE_FLITS - self.pos % EQ_ESIZE_FLITS
	}

	pub fn written(&self) -> u32 {
		self.written
	}

	pub fn put<T: IntoBytes + Immutable>(&mut self, val: &T) {
		self.put_bytes(val.as_bytes());
	}

	/// Copies `bytes`, zero-padding the last flit.
	pub fn put_bytes(&mut self, mut bytes: &[u8]) {
		while !bytes.is_empty() {
			let room = self.room_in_slot() as usize * 8;
			let n = room.min(bytes.len());
			let nflits = n.div_ceil(8);
			unsafe {
				let dst = self.base.as_ptr().add(self.pos as usize).cast::<u8>();
				ptr::copy_nonoverlapping(bytes.as_ptr(), dst, n);
				ptr::write_bytes(dst.add(n), 0, nflits * 8 - n);
			}
			self.advance(nflits as u32);
			bytes = &bytes[n..];
		}
	}

	/// Work requests are a whole number of 16-byte units.
	pub fn pad_to_even(&mut self) {
		if self.written % 2 == 1 {
			self.put_bytes(&[0; 8]);
		}
	}

	fn advance(&mut self, n: u32) {
		self.pos = (self.pos + n) % self.ring_flits;
		self.written += n;
	}
}
