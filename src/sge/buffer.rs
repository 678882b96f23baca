//! Reference-counted receive buffers.
//!
//! Every free-list buffer lives in a slot of a fixed arena. A slot's
//! reference count is owned by the free list while the buffer is posted and
//! by every [`RxView`] handed up the stack afterwards. The slot goes back to
//! the pool exactly once, on the 1 → 0 transition, no matter which holder
//! lets go last.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use hermit_sync::SpinMutex;

use crate::mm::{DmaAllocator, DmaRegion};
use crate::object_pool::{ObjectAllocator, ObjectPool};

/// Buffers are aligned so the low bits of their bus address stay clear for
/// the free-list descriptor flags.
const RX_BUF_ALIGN: usize = 64;

struct BufSlot {
	refcnt: AtomicU32,
	/// Written once by the allocating thread while the slot is unreferenced,
	/// read-only afterwards.
	mem: UnsafeCell<Option<DmaRegion>>,
}

/// Hands out slot indices that were never used before.
struct FreshSlots {
	next: Cell<u32>,
	limit: u32,
}

impl ObjectAllocator<u32> for FreshSlots {
	fn allocate(&self) -> Option<u32> {
		let idx = self.next.get();
		(idx < self.limit).then(|| {
			self.next.set(idx + 1);
			idx
		})
	}
}

#[derive(Default)]
struct PoolCounters {
	handed_out: AtomicU64,
	returned: AtomicU64,
	alloc_failed: AtomicU64,
}

struct PoolInner {
	dma: Arc<dyn DmaAllocator>,
	buf_size: u32,
	slots: Box<[BufSlot]>,
	free: SpinMutex<ObjectPool<u32, FreshSlots>>,
	counters: PoolCounters,
}

// `mem` of a slot is only written while its index is owned exclusively
// (taken from `free`, reference count zero).
unsafe impl Sync for PoolInner {}

impl PoolInner {
	fn slot(&self, idx: u32) -> &BufSlot {
		&self.slots[idx as usize]
	}

	fn region(&self, idx: u32) -> &DmaRegion {
		// A referenced slot always carries memory.
		match unsafe { &*self.slot(idx).mem.get() } {
			Some(region) => region,
			None => unreachable!("referenced receive buffer without memory"),
		}
	}

	fn release(&self, idx: u32) {
		self.free.lock().put(idx);
		self.counters.returned.fetch_add(1, Ordering::Relaxed);
	}
}

impl Drop for PoolInner {
	fn drop(&mut self) {
		for slot in self.slots.iter_mut() {
			if let Some(region) = slot.mem.get_mut().take() {
				unsafe { self.dma.deallocate(region) };
			}
		}
	}
}

/// Snapshot of a pool's accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
	pub handed_out: u64,
	pub returned: u64,
	pub alloc_failed: u64,
	pub cached: usize,
}

impl PoolStats {
	pub fn in_use(&self) -> u64 {
		self.handed_out - self.returned
	}
}

/// Shared pool of equally sized receive buffers.
///
/// Buffer memory is allocated lazily, the first time a slot is used, and
/// kept until the pool and every buffer handed out from it are gone.
#[derive(Clone)]
pub struct RxBufPool(Arc<PoolInner>);

impl RxBufPool {
	pub fn new(dma: Arc<dyn DmaAllocator>, buf_size: u32, max_bufs: u32) -> Self {
		let slots = (0..max_bufs)
			.map(|_| BufSlot {
				refcnt: AtomicU32::new(0),
				mem: UnsafeCell::new(None),
			})
			.collect();

		Self(Arc::new(PoolInner {
			dma,
			buf_size,
			slots,
			free: SpinMutex::new(ObjectPool::new(FreshSlots {
				next: Cell::new(0),
				limit: max_bufs,
			})),
			counters: PoolCounters::default(),
		}))
	}

	pub fn buf_size(&self) -> u32 {
		self.0.buf_size
	}

	/// Takes a buffer out of the pool. Fails when every slot is referenced
	/// or device memory for a fresh slot cannot be allocated.
	pub fn alloc(&self) -> Option<RxBuf> {
		let inner = &self.0;
		let Some(idx) = inner.free.lock().get() else {
			inner.counters.alloc_failed.fetch_add(1, Ordering::Relaxed);
			return None;
		};

		let slot = inner.slot(idx);
		let mem = unsafe { &mut *slot.mem.get() };
		if mem.is_none() {
			match inner
				.dma
				.allocate(inner.buf_size as usize, RX_BUF_ALIGN)
			{
				Ok(region) => *mem = Some(region),
				Err(err) => {
					debug!("Receive buffer allocation failed: {err}");
					inner.free.lock().put(idx);
					inner.counters.alloc_failed.fetch_add(1, Ordering::Relaxed);
					return None;
				}
			}
		}

		slot.refcnt.store(1, Ordering::Relaxed);
		inner.counters.handed_out.fetch_add(1, Ordering::Relaxed);
		Some(RxBuf {
			pool: inner.clone(),
			idx,
		})
	}

	pub fn stats(&self) -> PoolStats {
		let c = &self.0.counters;
		PoolStats {
			handed_out: c.handed_out.load(Ordering::Relaxed),
			returned: c.returned.load(Ordering::Relaxed),
			alloc_failed: c.alloc_failed.load(Ordering::Relaxed),
			cached: self.0.free.lock().cached(),
		}
	}
}

impl fmt::Debug for RxBufPool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RxBufPool")
			.field("buf_size", &self.0.buf_size)
			.field("slots", &self.0.slots.len())
			.finish_non_exhaustive()
	}
}

/// A counted reference to a receive buffer.
pub struct RxBuf {
	pool: Arc<PoolInner>,
	idx: u32,
}

impl RxBuf {
	pub fn paddr(&self) -> u64 {
		self.pool.region(self.idx).paddr()
	}

	pub fn size(&self) -> u32 {
		self.pool.buf_size
	}

	/// `true` if no view of this buffer has escaped, so it may be posted to
	/// the device again as is.
	pub fn is_unique(&self) -> bool {
		self.pool.slot(self.idx).refcnt.load(Ordering::Acquire) == 1
	}

	/// # Safety
	///
	/// The device must have finished writing the range.
	pub(crate) unsafe fn bytes(&self, offset: u32, len: u32) -> &[u8] {
		unsafe {
			self.pool
				.region(self.idx)
				.as_slice(offset as usize, len as usize)
		}
	}
}

impl Clone for RxBuf {
	fn clone(&self) -> Self {
		self.pool
			.slot(self.idx)
			.refcnt
			.fetch_add(1, Ordering::Relaxed);
		Self {
			pool: self.pool.clone(),
			idx: self.idx,
		}
	}
}

impl Drop for RxBuf {
	fn drop(&mut self) {
		if self
			.pool
			.slot(self.idx)
			.refcnt
			.fetch_sub(1, Ordering::Release)
			== 1
		{
			fence(Ordering::Acquire);
			self.pool.release(self.idx);
		}
	}
}

impl fmt::Debug for RxBuf {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RxBuf")
			.field("idx", &self.idx)
			.field(
				"refcnt",
				&self.pool.slot(self.idx).refcnt.load(Ordering::Relaxed),
			)
			.finish()
	}
}

/// Read-only window into a received buffer, handed up the stack without
/// copying.
#[derive(Clone, Debug)]
pub struct RxView {
	buf: RxBuf,
	offset: u32,
	len: u32,
}

impl RxView {
	/// The device must have completed the DMA into the window.
	pub(crate) fn new(buf: RxBuf, offset: u32, len: u32) -> Self {
		debug_assert!(offset + len <= buf.size());
		Self { buf, offset, len }
	}

	pub fn as_bytes(&self) -> &[u8] {
		unsafe { self.buf.bytes(self.offset, self.len) }
	}

	pub fn len(&self) -> usize {
		self.len as usize
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Drops the first `n` bytes of the window.
	pub(crate) fn advance(&mut self, n: u32) {
		let n = n.min(self.len);
		self.offset += n;
		self.len -= n;
	}
}
