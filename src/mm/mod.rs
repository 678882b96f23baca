//! Memory shared with the device.
//!
//! The engine never touches physical memory management directly. Rings,
//! receive buffers and the transmit copy buffer come from a [`DmaAllocator`];
//! transmit fragments that are not copied are bound through a [`DmaMapper`].

mod identity;

use core::ptr::NonNull;
use core::slice;

use smallvec::SmallVec;
use thiserror::Error;

pub use self::identity::IdentityDma;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DmaError {
	#[error("out of DMA-capable memory")]
	NoMemory,
	#[error("no DMA handle available")]
	NoHandle,
	#[error("buffer needs {0} segments")]
	TooManySegments(usize),
	#[error("buffer cannot be mapped for device access")]
	Fault,
}

/// A physically contiguous allocation visible to the device.
#[derive(Debug)]
pub struct DmaRegion {
	vaddr: NonNull<u8>,
	paddr: u64,
	len: usize,
	align: usize,
}

// The region is plain memory. Synchronization with the device happens
// through the rings that reference it.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
	/// # Safety
	///
	/// `vaddr` must point to `len` bytes that stay valid until the region is
	/// handed back to the allocator it came from, and `paddr` must be the bus
	/// address of the same memory.
	pub unsafe fn new(vaddr: NonNull<u8>, paddr: u64, len: usize, align: usize) -> Self {
		Self {
			vaddr,
			paddr,
			len,
			align,
		}
	}

	pub fn paddr(&self) -> u64 {
		self.paddr
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn align(&self) -> usize {
		self.align
	}

	pub fn as_ptr(&self) -> NonNull<u8> {
		self.vaddr
	}

	/// # Safety
	///
	/// The device must not be writing to the returned range.
	pub unsafe fn as_slice(&self, offset: usize, len: usize) -> &[u8] {
		assert!(offset + len <= self.len);
		unsafe { slice::from_raw_parts(self.vaddr.as_ptr().add(offset), len) }
	}

	/// # Safety
	///
	/// The range must not be aliased, neither by the device nor by another
	/// reference.
	#[allow(clippy::mut_from_ref)]
	pub unsafe fn as_mut_slice(&self, offset: usize, len: usize) -> &mut [u8] {
		assert!(offset + len <= self.len);
		unsafe { slice::from_raw_parts_mut(self.vaddr.as_ptr().add(offset), len) }
	}
}

/// Source of device-visible memory.
pub trait DmaAllocator: Send + Sync {
	/// Allocates `size` zeroed bytes aligned to `align`.
	fn allocate(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError>;

	/// # Safety
	///
	/// `region` must come from this allocator and the device must no longer
	/// reference it.
	unsafe fn deallocate(&self, region: DmaRegion);
}

/// One contiguous bus-address range of a bound buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaSeg {
	pub addr: u64,
	pub len: u32,
}

/// A buffer bound for device reads. Must be handed back to
/// [`DmaMapper::unbind`] once the device is done with it.
#[derive(Debug)]
pub struct DmaBinding {
	/// Mapper-private identification of the binding.
	pub cookie: usize,
	pub segs: SmallVec<[DmaSeg; 4]>,
}

/// Binds caller memory for device access.
pub trait DmaMapper: Send + Sync {
	fn bind(&self, data: &[u8]) -> Result<DmaBinding, DmaError>;

	fn unbind(&self, binding: DmaBinding);
}
