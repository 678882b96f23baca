use alloc::vec::Vec;

/// Allocator for new [`ObjectPool`] items.
pub(crate) trait ObjectAllocator<T> {
	/// Allocates a new object, or `None` once the backing source is exhausted.
	fn allocate(&self) -> Option<T>;
}

/// A generic object pool that is manually managed.
///
/// Objects are retrieved via [`ObjectPool::get`] and need to be manually
/// returned via [`ObjectPool::put`]. Returned objects are handed out again
/// most recently returned first.
pub(crate) struct ObjectPool<T, A: ObjectAllocator<T>> {
	/// Underlying allocator that is used as a fallback source of items.
	allocator: A,
	/// Cache of items that were already allocated in the past and returned.
	cache: Vec<T>,
}

impl<T, A> ObjectPool<T, A>
where
	A: ObjectAllocator<T>,
{
	/// Creates a new object pool with the given backing allocator.
	pub fn new(allocator: A) -> Self {
		Self {
			allocator,
			cache: Vec::new(),
		}
	}

	/// Retrieve an object from the pool. This will take items from the cache
	/// if any are available, otherwise it will ask the allocator for a new
	/// item.
	pub fn get(&mut self) -> Option<T> {
		self.cache.pop().or_else(|| self.allocator.allocate())
	}

	/// Returns an item back to the object pool.
	pub fn put(&mut self, item: T) {
		self.cache.push(item);
	}

	/// Number of items sitting in the cache.
	pub fn cached(&self) -> usize {
		self.cache.len()
	}
}

#[cfg(not(target_os = "none"))]
#[cfg(test)]
mod tests {
	use core::cell::Cell;

	use super::*;

	struct Counter {
		next: Cell<u32>,
		limit: u32,
	}

	impl ObjectAllocator<u32> for Counter {
		fn allocate(&self) -> Option<u32> {
			let n = self.next.get();
			(n < self.limit).then(|| {
				self.next.set(n + 1);
				n
			})
		}
	}

	#[test]
	fn reuses_returned_items_before_allocating() {
		let mut pool = ObjectPool::new(Counter {
			next: Cell::new(0),
			limit: 2,
		});
		assert_eq!(pool.get(), Some(0));
		assert_eq!(pool.get(), Some(1));
		assert_eq!(pool.get(), None);

		pool.put(1);
		pool.put(0);
		assert_eq!(pool.cached(), 2);
		assert_eq!(pool.get(), Some(0));
		assert_eq!(pool.get(), Some(1));
		assert_eq!(pool.get(), None);
	}
}
