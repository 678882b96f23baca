use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;

use align_address::Align;
use smallvec::SmallVec;

use super::{DmaAllocator, DmaBinding, DmaError, DmaMapper, DmaRegion, DmaSeg};
use crate::config::PAGE_SIZE;

/// DMA for platforms where the device sees memory at its virtual address.
///
/// Bindings are split at page boundaries, since consecutive virtual pages
/// need not be physically contiguous on such platforms either.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityDma;

impl IdentityDma {
	pub const fn new() -> Self {
		Self
	}
}

impl DmaAllocator for IdentityDma {
	fn allocate(&self, size: usize, align: usize) -> Result<DmaRegion, DmaError> {
		let layout =
			Layout::from_size_align(size.max(1), align.max(1)).map_err(|_| DmaError::NoMemory)?;
		let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(DmaError::NoMemory)?;
		let paddr = ptr.as_ptr().expose_provenance() as u64;
		Ok(unsafe { DmaRegion::new(ptr, paddr, size, layout.align()) })
	}

	unsafe fn deallocate(&self, region: DmaRegion) {
		match Layout::from_size_align(region.len().max(1), region.align()) {
			Ok(layout) => unsafe { dealloc(region.as_ptr().as_ptr(), layout) },
			Err(_) => error!("Leaking DMA region with invalid layout: {region:?}"),
		}
	}
}

impl DmaMapper for IdentityDma {
	fn bind(&self, data: &[u8]) -> Result<DmaBinding, DmaError> {
		let mut segs = SmallVec::new();
		let mut addr = data.as_ptr().expose_provenance();
		let end = addr + data.len();
		while addr < end {
			let page_end = (addr + 1).align_up(PAGE_SIZE).min(end);
			segs.push(DmaSeg {
				addr: addr as u64,
				len: (page_end - addr) as u32,
			});
			addr = page_end;
		}
		Ok(DmaBinding { cookie: 0, segs })
	}

	fn unbind(&self, _binding: DmaBinding) {}
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
	use alloc::vec;

	use super::*;

	#[test]
	fn allocations_are_zeroed_and_aligned() {
		let dma = IdentityDma::new();
		let region = dma.allocate(256, 64).unwrap();
		assert_eq!(region.paddr() % 64, 0);
		assert!(unsafe { region.as_slice(0, 256) }.iter().all(|b| *b == 0));
		unsafe { dma.deallocate(region) };
	}

	#[test]
	fn bind_splits_at_page_boundaries() {
		let dma = IdentityDma::new();
		let buf = vec![0u8; 3 * PAGE_SIZE];
		let start = PAGE_SIZE - (buf.as_ptr().expose_provenance() % PAGE_SIZE) + 100;
		let data = &buf[start..start + PAGE_SIZE];

		let binding = dma.bind(data).unwrap();
		assert_eq!(binding.segs.len(), 2);
		assert_eq!(binding.segs[0].len, (PAGE_SIZE - 100) as u32);
		assert_eq!(binding.segs[1].len, 100);
		assert_eq!(
			binding.segs[0].addr,
			data.as_ptr().expose_provenance() as u64
		);
		dma.unbind(binding);
	}
}
