//! Free lists: rings of receive-buffer pointers posted to the device.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::DerefMut;
use core::sync::atomic::{Ordering, fence};

use hermit_sync::SpinMutex;
use zerocopy::big_endian::U64;

use super::SgeHw;
use super::buffer::{RxBuf, RxBufPool, RxView};
use super::error::SgeError;
use super::ring::{DescRing, ring_add};
use super::stats::FlStats;
use crate::config::{FL_PTRS_PER_DESC, SgeParams};
use crate::mm::DmaAllocator;
use crate::net::{Frag, Packet};

/// Geometry of a free list.
#[derive(Clone, Debug)]
pub struct FlConfig {
	/// Ring slots. One hardware descriptor's worth of them is never posted.
	pub capacity: u16,
	/// At or below this many posted buffers the list is starving.
	pub lowat: u16,
	pub pool: RxBufPool,
}

pub(crate) struct FlState {
	cntxt_id: u16,
	ring: DescRing<U64>,
	/// Software shadow of the ring, one buffer reference per slot.
	sdesc: Box<[Option<RxBuf>]>,
	qsize: u16,
	cap: u16,
	/// Next slot the device fills.
	cidx: u16,
	/// Next slot to post.
	pidx: u16,
	/// Buffers owed to the device.
	needed: u16,
	/// Posted but not yet announced with a doorbell.
	pending: u16,
	lowat: u16,
	/// Consumption offset into the buffer at `cidx`.
	rx_offset: u32,
	pool: RxBufPool,
	buf_size: u32,
	pktshift: u32,
	pack: bool,
	pack_boundary: u32,
	copy_threshold: u32,
	db_batch: u16,
	stats: FlStats,
}

impl FlState {
	pub fn is_starving(&self) -> bool {
		self.posted() <= self.lowat
	}

	pub fn posted(&self) -> u16 {
		self.cap - self.needed
	}

	pub fn needed(&self) -> u16 {
		self.needed
	}

	/// Posts up to `n` of the buffers owed to the device.
	///
	/// A slot whose buffer has no outstanding views is re-posted as is.
	/// Allocation failures end the refill early. Returns `true` if the list
	/// is starving afterwards.
	pub fn refill(&mut self, mut n: u32, hw: &dyn SgeHw) -> bool {
		while self.needed > 0 && n > 0 {
			let pidx = usize::from(self.pidx);
			match self.sdesc[pidx].take() {
				Some(buf) if buf.is_unique() => {
					self.sdesc[pidx] = Some(buf);
					self.stats.recycled += 1;
				}
				old => {
					drop(old);
					let Some(buf) = self.pool.alloc() else {
						self.stats.alloc_failed += 1;
						break;
					};
					self.ring.write(self.pidx, U64::new(buf.paddr()));
					self.sdesc[pidx] = Some(buf);
					self.stats.allocated += 1;
				}
			}

			self.needed -= 1;
			self.pending += 1;
			self.pidx = ring_add(self.pidx, 1, self.qsize);
			n -= 1;

			if self.pending >= self.db_batch {
				self.ring_doorbell(hw);
			}
		}

		self.is_starving()
	}

	/// Announces all whole hardware descriptors worth of pending pointers.
	/// A remainder below one descriptor stays pending.
	pub fn ring_doorbell(&mut self, hw: &dyn SgeHw) {
		let ndesc = self.pending / FL_PTRS_PER_DESC;
		if ndesc == 0 {
			return;
		}

		fence(Ordering::Release);
		hw.ring_fl_doorbell(self.cntxt_id, ndesc);
		self.pending -= ndesc * FL_PTRS_PER_DESC;
		self.stats.doorbells += 1;
	}

	/// Claims the payload of a free-list response of `len` bytes (device
	/// padding included).
	///
	/// Short payloads that sit in a single buffer are copied out. Everything
	/// else is handed out as views sharing the buffers. Returns `None` and
	/// leaves the list untouched if a buffer is missing or memory for the
	/// copy cannot be reserved.
	pub fn consume(&mut self, len: u32, newbuf: bool) -> Option<Packet> {
		let mut cidx = self.cidx;
		let mut offset = self.rx_offset;
		let mut used = 0u16;
		if newbuf && offset > 0 {
			cidx = ring_add(cidx, 1, self.qsize);
			offset = 0;
			used += 1;
		}

		let frame_len = len.saturating_sub(self.pktshift);
		let mut pkt = Packet::default();
		let end;
		if frame_len < self.copy_threshold && offset + len <= self.buf_size {
			let buf = self.sdesc[usize::from(cidx)].as_ref()?;
			let mut data = Vec::new();
			data.try_reserve_exact(frame_len as usize).ok()?;
			data.extend_from_slice(unsafe { buf.bytes(offset + self.pktshift, frame_len) });
			pkt.push(Frag::Owned(data));
			end = offset + len;
			self.stats.copied += 1;
		} else {
			let mut remaining = len;
			let mut skip = self.pktshift;
			loop {
				let buf = self.sdesc[usize::from(cidx)].as_ref()?;
				let take = remaining.min(self.buf_size - offset);
				if take > skip {
					pkt.push(Frag::Shared(RxView::new(
						buf.clone(),
						offset + skip,
						take - skip,
					)));
					skip = 0;
				} else {
					skip -= take;
				}
				remaining -= take;
				if remaining == 0 {
					end = offset + take;
					break;
				}
				cidx = ring_add(cidx, 1, self.qsize);
				offset = 0;
				used += 1;
			}
			self.stats.zero_copy += 1;
		}

		// The next payload starts on the following pack boundary, or in the
		// next buffer if that boundary is past the end.
		let next = if self.pack {
			end.next_multiple_of(self.pack_boundary)
		} else {
			self.buf_size
		};
		if next >= self.buf_size {
			cidx = ring_add(cidx, 1, self.qsize);
			offset = 0;
			used += 1;
		} else {
			offset = next;
		}

		debug_assert!(used <= self.posted());
		self.cidx = cidx;
		self.rx_offset = offset;
		self.needed += used;
		Some(pkt)
	}

	/// Buffer references held by the ring's slots.
	#[cfg(test)]
	pub fn held(&self) -> usize {
		self.sdesc.iter().filter(|sd| sd.is_some()).count()
	}
}

/// A free list and its software state.
pub struct FreeList {
	cntxt_id: u16,
	state: SpinMutex<FlState>,
	paddr: u64,
	qsize: u16,
}

impl FreeList {
	pub(crate) fn new(
		dma: Arc<dyn DmaAllocator>,
		cfg: FlConfig,
		params: &SgeParams,
	) -> Result<Self, SgeError> {
		if cfg.capacity < 2 * FL_PTRS_PER_DESC
			|| cfg.capacity % FL_PTRS_PER_DESC != 0
			|| cfg.lowat >= cfg.capacity - FL_PTRS_PER_DESC
		{
			return Err(SgeError::Geometry("free list"));
		}
		if cfg.pool.buf_size() <= u32::from(params.fl_pktshift) {
			return Err(SgeError::Geometry("receive buffer"));
		}
		let qsize = cfg.capacity;

		let ring = DescRing::new(dma, qsize, 0)?;
		let paddr = ring.paddr();
		let state = FlState {
			cntxt_id: 0,
			ring,
			sdesc: (0..qsize).map(|_| None).collect(),
			qsize,
			// One hardware descriptor stays unused to tell a full ring from
			// an empty one.
			cap: qsize - FL_PTRS_PER_DESC,
			cidx: 0,
			pidx: 0,
			needed: qsize - FL_PTRS_PER_DESC,
			pending: 0,
			lowat: cfg.lowat,
			rx_offset: 0,
			buf_size: cfg.pool.buf_size(),
			pool: cfg.pool,
			pktshift: params.fl_pktshift.into(),
			pack: params.fl_pack,
			pack_boundary: params.fl_pack_boundary,
			copy_threshold: params.rx_copy_threshold,
			db_batch: params.fl_db_batch,
			stats: FlStats::default(),
		};

		Ok(Self {
			cntxt_id: 0,
			state: SpinMutex::new(state),
			paddr,
			qsize,
		})
	}

	pub(crate) fn set_cntxt_id(&mut self, cntxt_id: u16) {
		self.cntxt_id = cntxt_id;
		self.state.get_mut().cntxt_id = cntxt_id;
	}

	pub fn cntxt_id(&self) -> u16 {
		self.cntxt_id
	}

	/// Bus address of the pointer ring.
	pub fn ring_paddr(&self) -> u64 {
		self.paddr
	}

	/// Ring entries, the unused gap included.
	pub fn qsize(&self) -> u16 {
		self.qsize
	}

	pub(crate) fn lock(&self) -> impl DerefMut<Target = FlState> + '_ {
		self.state.lock()
	}

	pub fn posted(&self) -> u16 {
		self.state.lock().posted()
	}

	pub fn is_starving(&self) -> bool {
		self.state.lock().is_starving()
	}

	pub fn stats(&self) -> FlStats {
		self.state.lock().stats
	}

	pub(crate) fn note_starving(&self) {
		self.state.lock().stats.starving += 1;
	}

	/// Drops every buffer reference the ring holds.
	pub(crate) fn release_buffers(&self) {
		let mut state = self.state.lock();
		for sd in state.sdesc.iter_mut() {
			sd.take();
		}
		let cap = state.cap;
		state.needed = cap;
		state.pending = 0;
	}
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
	use super::*;
	use crate::mm::IdentityDma;
	use crate::sge::testing::RecordingHw;

	const BUF: u32 = 512;

	fn fl(capacity: u16, lowat: u16, bufs: u32, params: &SgeParams) -> FreeList {
		let dma = Arc::new(IdentityDma::new());
		let pool = RxBufPool::new(dma.clone(), BUF, bufs);
		FreeList::new(
			dma,
			FlConfig {
				capacity,
				lowat,
				pool,
			},
			params,
		)
		.unwrap()
	}

	/// Fills the buffer posted at `idx` the way the device would.
	fn dma_write(state: &FlState, idx: u16, offset: u32, data: &[u8]) {
		let paddr = state.ring.read(idx).get();
		let ptr = core::ptr::with_exposed_provenance_mut::<u8>(paddr as usize);
		unsafe {
			core::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
		}
	}

	#[test]
	fn doorbells_in_whole_descriptors() {
		let hw = RecordingHw::default();
		let params = SgeParams {
			fl_db_batch: 16,
			..SgeParams::default()
		};
		let fl = fl(64, 8, 64, &params);
		let mut st = fl.lock();

		assert!(!st.refill(12, &hw));
		assert!(hw.fl_doorbells().is_empty());
		st.refill(5, &hw);
		assert_eq!(hw.fl_doorbells(), [(0, 2)]);
		assert_eq!(st.pending, 1);
		st.ring_doorbell(&hw);
		assert_eq!(hw.fl_doorbells().len(), 1);
		assert_eq!(st.posted(), 17);
	}

	#[test]
	fn partial_refill_on_pool_exhaustion() {
		let hw = RecordingHw::default();
		let fl = fl(64, 8, 6, &SgeParams::default());
		let mut st = fl.lock();
		assert!(st.refill(64, &hw));
		assert_eq!(st.posted(), 6);
		assert_eq!(st.stats.alloc_failed, 1);
		assert!(st.held() <= 64);
	}

	#[test]
	fn copies_short_frames_and_packs() {
		let hw = RecordingHw::default();
		let params = SgeParams {
			fl_pktshift: 2,
			fl_pack: true,
			fl_pack_boundary: 64,
			rx_copy_threshold: 128,
			..SgeParams::default()
		};
		let fl = fl(16, 2, 32, &params);
		let mut st = fl.lock();
		st.refill(16, &hw);

		dma_write(&st, 0, 2, &[0xab; 60]);
		let pkt = st.consume(62, true).unwrap();
		assert_eq!(pkt.to_vec(), [0xab; 60]);
		assert!(matches!(pkt.frags()[0], Frag::Owned(_)));
		assert_eq!((st.cidx, st.rx_offset, st.needed), (0, 64, 0));

		dma_write(&st, 0, 66, &[0xcd; 10]);
		let pkt = st.consume(12, false).unwrap();
		assert_eq!(pkt.to_vec(), [0xcd; 10]);
		assert_eq!(st.rx_offset, 128);

		// NEWBUF abandons the rest of the buffer.
		drop(st.consume(12, true).unwrap());
		assert_eq!((st.cidx, st.rx_offset, st.needed), (1, 64, 1));
	}

	#[test]
	fn large_frames_share_buffers_across_boundaries() {
		let hw = RecordingHw::default();
		let params = SgeParams {
			fl_pktshift: 2,
			fl_pack: false,
			rx_copy_threshold: 128,
			..SgeParams::default()
		};
		let fl = fl(16, 2, 32, &params);
		let mut st = fl.lock();
		st.refill(16, &hw);

		dma_write(&st, 0, 2, &[1; BUF as usize - 2]);
		dma_write(&st, 1, 0, &[2; 100]);
		let pkt = st.consume(BUF + 100, true).unwrap();
		assert_eq!(pkt.len(), BUF as usize + 98);
		assert_eq!(pkt.frags().len(), 2);
		assert!(pkt.frags().iter().all(|f| matches!(f, Frag::Shared(_))));
		assert_eq!(pkt.frags()[1].as_bytes(), [2; 100]);
		assert_eq!((st.cidx, st.needed), (2, 2));

		// The slots still hold their own reference.
		let pool = st.pool.clone();
		drop(pkt);
		assert_eq!(pool.stats().returned, 0);
	}

	#[test]
	fn viewed_buffers_are_replaced_others_recycled() {
		let hw = RecordingHw::default();
		let params = SgeParams {
			fl_pack: false,
			rx_copy_threshold: 64,
			..SgeParams::default()
		};
		let fl = fl(16, 2, 64, &params);
		let mut st = fl.lock();
		st.refill(8, &hw);
		let first = st.ring.read(0).get();
		let second = st.ring.read(1).get();

		let kept = st.consume(200, true).unwrap();
		for _ in 0..7 {
			drop(st.consume(200, true).unwrap());
		}
		st.refill(8, &hw);
		for _ in 0..8 {
			drop(st.consume(200, true).unwrap());
		}
		// The producer is back at slot 0.
		st.refill(8, &hw);
		assert_ne!(st.ring.read(0).get(), first);
		assert_eq!(st.ring.read(1).get(), second);
		assert_eq!(st.stats.recycled, 7);
		assert!(st.held() <= 16);

		let pool = st.pool.clone();
		assert_eq!(pool.stats().returned, 0);
		drop(kept);
		assert_eq!(pool.stats().returned, 1);
	}

	#[test]
	fn missing_buffer_leaves_state_unchanged() {
		let hw = RecordingHw::default();
		let fl = fl(16, 2, 1, &SgeParams::default());
		let mut st = fl.lock();
		st.refill(16, &hw);
		drop(st.consume(64, true).unwrap());
		let (cidx, offset, needed) = (st.cidx, st.rx_offset, st.needed);
		assert!(st.consume(64, true).is_none());
		assert_eq!((st.cidx, st.rx_offset, st.needed), (cidx, offset, needed));
	}

	#[test]
	fn starving_threshold() {
		let hw = RecordingHw::default();
		let fl = fl(256, 8, 20, &SgeParams::default());
		let mut st = fl.lock();
		st.refill(5, &hw);
		assert!(st.is_starving());
		assert!(!st.refill(15, &hw));
		assert_eq!(st.posted(), 20);
	}
}
