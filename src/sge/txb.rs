//! Per-queue transmit copy buffer.
//!
//! Short packets and fragments are copied here instead of being bound for
//! DMA. Space is handed out in ring order and returned in the same order as
//! descriptors complete, so tracking the free byte count is enough.

use alloc::sync::Arc;
use core::ptr;

use crate::mm::{DmaAllocator, DmaError, DmaRegion};

/// Segments stay 8-byte aligned.
const TXB_ALIGN: u32 = 8;

/// Allocation state to roll back to.
///
/// Only the bytes charged after the mark are handed back, so releases that
/// happen in between are kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TxbMark {
	next: u32,
	charged: u32,
}

pub(crate) struct CopyBuf {
	mem: Option<DmaRegion>,
	dma: Arc<dyn DmaAllocator>,
	size: u32,
	next: u32,
	avail: u32,
	/// Running total of bytes charged, wrapping.
	charged: u32,
}

impl CopyBuf {
	pub fn new(dma: Arc<dyn DmaAllocator>, size: u32) -> Result<Self, DmaError> {
		let size = size.next_multiple_of(TXB_ALIGN);
		let mem = dma.allocate(size as usize, TXB_ALIGN as usize)?;
		Ok(Self {
			mem: Some(mem),
			dma,
			size,
			next: 0,
			avail: size,
			charged: 0,
		})
	}

	pub fn avail(&self) -> u32 {
		self.avail
	}

	pub fn size(&self) -> u32 {
		self.size
	}

	pub fn mark(&self) -> TxbMark {
		TxbMark {
			next: self.next,
			charged: self.charged,
		}
	}

	pub fn rollback(&mut self, mark: TxbMark) {
		self.next = mark.next;
		self.avail += self.charged.wrapping_sub(mark.charged);
		self.charged = mark.charged;
		debug_assert!(self.avail <= self.size);
	}

	/// Reserves `len` contiguous bytes. Returns their offset and the bytes
	/// charged, which include any space skipped at the end of the buffer.
	pub fn alloc(&mut self, len: u32) -> Option<(u32, u32)> {
		let need = len.next_multiple_of(TXB_ALIGN);
		if need == 0 || need > self.size {
			return None;
		}
		let (offset, charged) = if self.next + need > self.size {
			(0, self.size - self.next + need)
		} else {
			(self.next, need)
		};
		if charged > self.avail {
			return None;
		}
		self.next = (offset + need) % self.size;
		self.avail -= charged;
		self.charged = self.charged.wrapping_add(charged);
		Some((offset, charged))
	}

	/// Copies `data` to `offset`, which must lie in a reservation.
	pub fn write(&mut self, offset: u32, data: &[u8]) {
		let Some(mem) = self.mem.as_ref() else {
			return;
		};
		debug_assert!(offset as usize + data.len() <= mem.len());
		unsafe {
			ptr::copy_nonoverlapping(
				data.as_ptr(),
				mem.as_ptr().as_ptr().add(offset as usize),
				data.len(),
			);
		}
	}

	pub fn paddr(&self, offset: u32) -> u64 {
		self.mem.as_ref().map_or(0, DmaRegion::paddr) + u64::from(offset)
	}

	pub fn release(&mut self, charged: u32) {
		self.avail += charged;
		debug_assert!(self.avail <= self.size);
	}

	#[cfg(test)]
	pub fn bytes(&self, offset: u32, len: u32) -> &[u8] {
		match self.mem.as_ref() {
			Some(mem) => unsafe { mem.as_slice(offset as usize, len as usize) },
			None => &[],
		}
	}
}

impl Drop for CopyBuf {
	fn drop(&mut self) {
		if let Some(mem) = self.mem.take() {
			unsafe { self.dma.deallocate(mem) };
		}
	}
}
