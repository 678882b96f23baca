//! Rings shared with the device.

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use volatile::VolatilePtr;

use crate::config::RING_ALIGN;
use crate::mm::{DmaAllocator, DmaError, DmaRegion};

/// Generation bit of a ring position.
///
/// Starts out set and toggles every time the position wraps. The device
/// stamps each ingress entry with its own generation, so an entry is new
/// exactly when its stamp matches ours.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Generation(bool);

impl Generation {
	pub fn new() -> Self {
		Generation(true)
	}

	pub fn wrap(&mut self) {
		self.0 = !self.0;
	}

	pub fn get(self) -> bool {
		self.0
	}
}

/// Consumer position in a ring of `size` entries.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RingCursor {
	idx: u16,
	size: u16,
	generation: Generation,
}

impl RingCursor {
	pub fn new(size: u16) -> Self {
		Self {
			idx: 0,
			size,
			generation: Generation::new(),
		}
	}

	pub fn index(&self) -> u16 {
		self.idx
	}

	pub fn generation(&self) -> Generation {
		self.generation
	}

	/// Moves to the next entry. Returns `true` on wrap.
	pub fn advance(&mut self) -> bool {
		self.idx += 1;
		if self.idx == self.size {
			self.idx = 0;
			self.generation.wrap();
			true
		} else {
			false
		}
	}
}

/// Index arithmetic on rings whose size is not a power of two.
pub(crate) fn ring_add(idx: u16, n: u16, size: u16) -> u16 {
	let sum = u32::from(idx) + u32::from(n);
	(sum % u32::from(size)) as u16
}

/// Entries from `from` up to, but not including, `to`.
pub(crate) fn ring_dist(from: u16, to: u16, size: u16) -> u16 {
	if to >= from {
		to - from
	} else {
		size - from + to
	}
}

/// Device-visible array of `len` entries of `T`, optionally followed by
/// `extra` bytes (the status page).
pub(crate) struct DescRing<T> {
	mem: Option<DmaRegion>,
	base: NonNull<T>,
	len: u16,
	dma: Arc<dyn DmaAllocator>,
	_marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for DescRing<T> {}
unsafe impl<T: Sync> Sync for DescRing<T> {}

impl<T: Copy> DescRing<T> {
	pub fn new(dma: Arc<dyn DmaAllocator>, len: u16, extra: usize) -> Result<Self, DmaError> {
		let size = usize::from(len) * size_of::<T>() + extra;
		let mem = dma.allocate(size, RING_ALIGN)?;
		let base = mem.as_ptr().cast::<T>();
		Ok(Self {
			mem: Some(mem),
			base,
			len,
			dma,
			_marker: PhantomData,
		})
	}

	pub fn len(&self) -> u16 {
		self.len
	}

	pub fn paddr(&self) -> u64 {
		self.mem.as_ref().map_or(0, DmaRegion::paddr)
	}

	pub fn entry(&self, idx: u16) -> VolatilePtr<'_, T> {
		assert!(idx < self.len);
		unsafe { VolatilePtr::new(self.base.add(usize::from(idx))) }
	}

	pub fn read(&self, idx: u16) -> T {
		self.entry(idx).read()
	}

	pub fn write(&mut self, idx: u16, val: T) {
		self.entry(idx).write(val);
	}

	/// Start of the array, for writers that work below entry granularity.
	pub fn base(&self) -> NonNull<T> {
		self.base
	}

	/// A `U` placed right behind the last entry.
	pub fn trailer<U: Copy>(&self) -> VolatilePtr<'_, U> {
		let end = unsafe { self.base.add(usize::from(self.len)) };
		debug_assert!(
			usize::from(self.len) * size_of::<T>() + size_of::<U>()
				<= self.mem.as_ref().map_or(0, DmaRegion::len)
		);
		unsafe { VolatilePtr::new(end.cast::<U>()) }
	}
}

impl<T> Drop for DescRing<T> {
	fn drop(&mut self) {
		if let Some(mem) = self.mem.take() {
			unsafe { self.dma.deallocate(mem) };
		}
	}
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
	use super::*;
	use crate::mm::IdentityDma;

	#[test]
	fn cursor_toggles_generation_on_wrap() {
		let mut cursor = RingCursor::new(3);
		assert!(cursor.generation().get());
		assert!(!cursor.advance());
		assert!(!cursor.advance());
		assert!(cursor.advance());
		assert_eq!(cursor.index(), 0);
		assert!(!cursor.generation().get());
	}

	#[test]
	fn distances_wrap() {
		assert_eq!(ring_dist(5, 2, 8), 5);
		assert_eq!(ring_dist(2, 5, 8), 3);
		assert_eq!(ring_add(7, 3, 8), 2);
	}

	#[test]
	fn trailer_sits_behind_entries() {
		let mut ring = DescRing::<u64>::new(Arc::new(IdentityDma::new()), 4, 8).unwrap();
		ring.write(3, 0xdead);
		ring.trailer::<u64>().write(0xbeef);
		assert_eq!(ring.read(3), 0xdead);
		let raw = unsafe { *ring.base().as_ptr().add(4) };
		assert_eq!(raw, 0xbeef);
	}
}
