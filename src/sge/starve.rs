//! Free lists that could not be refilled from the service loop.
//!
//! A queue whose free list ran dry stops producing responses, so nothing
//! would refill it again. Such queues are put on a list that a periodic
//! timer walks, posting a few buffers each time until the list is healthy.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::Sge;
use super::iq::{IngressQueue, IqState};

#[derive(Default)]
pub(crate) struct StarvingList {
	queues: Vec<Arc<IngressQueue>>,
}

impl StarvingList {
	/// Returns `false` if `iq` was already listed.
	fn insert(&mut self, iq: &Arc<IngressQueue>) -> bool {
		if self.contains(iq) {
			return false;
		}
		self.queues.push(iq.clone());
		true
	}

	fn contains(&self, iq: &Arc<IngressQueue>) -> bool {
		self.queues.iter().any(|q| Arc::ptr_eq(q, iq))
	}

	pub fn remove(&mut self, iq: &Arc<IngressQueue>) {
		self.queues.retain(|q| !Arc::ptr_eq(q, iq));
	}

	pub fn len(&self) -> usize {
		self.queues.len()
	}

	pub fn is_empty(&self) -> bool {
		self.queues.is_empty()
	}
}

impl Sge {
	/// Puts the free list of `iq` under the care of the starvation timer.
	pub(crate) fn add_starving(&self, iq: &Arc<IngressQueue>) {
		let mut list = self.starving.lock();
		if list.insert(iq) {
			if let Some(fl) = iq.free_list() {
				fl.note_starving();
				debug!("fl {}: starving with {} buffers posted", fl.cntxt_id(), fl.posted());
			}
			if list.len() == 1 {
				self.timer.arm(self.params.starve_period_ms);
			}
		}
	}

	/// Number of free lists waiting for the starvation timer.
	pub fn starving_count(&self) -> usize {
		self.starving.lock().len()
	}

	/// Starvation timer callback.
	///
	/// Posts up to `starve_refill` buffers to every listed free list and
	/// drops those that are healthy again. The timer is cancelled once the
	/// list is empty and otherwise stays armed.
	pub fn starvation_tick(&self) {
		let hw = &*self.hw;
		let mut list = self.starving.lock();
		list.queues.retain(|iq| {
			if iq.state() == IqState::Disabled {
				return false;
			}
			let Some(fl) = iq.free_list() else {
				return false;
			};
			let mut fls = fl.lock();
			let starving = fls.refill(self.params.starve_refill, hw);
			fls.ring_doorbell(hw);
			trace!("fl {}: {} buffers posted by the starvation timer", fl.cntxt_id(), fls.posted());
			starving
		});

		if list.is_empty() {
			self.timer.cancel();
		}
	}
}
