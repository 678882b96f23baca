//! The scatter-gather engine: the data path between host memory and the
//! adapter.
//!
//! The adapter reports received frames and control messages on ingress
//! queues, takes receive buffers from free lists and reads transmit work
//! requests from egress queues. [`Sge`] owns the software side of all of
//! these rings. Register writes, DMA memory and the starvation timer are
//! supplied by the driver through [`SgeHw`], [`DmaAllocator`],
//! [`DmaMapper`] and [`Timer`]; received packets and notifications go back
//! up through [`SgeHandler`].

mod buffer;
mod eq;
mod error;
mod fl;
mod iq;
pub mod msg;
pub mod offload;
mod ring;
pub mod sgl;
mod starve;
mod stats;
#[cfg(test)]
pub(crate) mod testing;
mod txb;
mod txinfo;
mod txpkts;
mod txq;

use alloc::collections::BTreeMap;
use alloc::collections::btree_map::Entry;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hermit_sync::{RwSpinLock, SpinMutex};

pub use self::buffer::{PoolStats, RxBuf, RxBufPool, RxView};
pub use self::error::{Busy, Exhausted, SgeError, TxError};
pub use self::fl::{FlConfig, FreeList};
pub use self::iq::{IngressQueue, IntrParams, IqConfig, IqIds, IqSetup, IqState, ServiceResult};
pub use self::stats::{FlStats, RxqStats, TxqStats};
pub use self::txq::{EqConfig, EqSetup, TxQueue};
use self::ring::DescRing;
use self::starve::StarvingList;
use crate::config::SgeParams;
use crate::mm::{DmaAllocator, DmaMapper};
use crate::net::Packet;

/// Register writes of the data path.
pub trait SgeHw: Send + Sync {
	/// Returns `cidx_inc` entries of ingress queue `iq` to the device and
	/// applies `params` to its next interrupt.
	fn gts(&self, iq: u16, cidx_inc: u16, params: IntrParams);

	/// Announces `ndesc` hardware descriptors of new buffer pointers on free
	/// list `fl`.
	fn ring_fl_doorbell(&self, fl: u16, ndesc: u16);

	/// Announces `ndesc` new descriptors on egress queue `eq`.
	fn ring_tx_doorbell(&self, eq: u16, ndesc: u16);
}

/// A `CPL_FW4_MSG` or `CPL_FW6_MSG` from the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FwMessage {
	pub opcode: u8,
	pub kind: u8,
	pub data: [u64; 4],
}

/// Upper layer of the data path.
pub trait SgeHandler: Send + Sync {
	/// A frame arrived for receive queue `rxq`.
	fn rx_packet(&self, rxq: u16, pkt: Packet);

	fn fw_message(&self, iq: u16, msg: FwMessage) {
		debug!("Ignoring firmware message {:#x} on iq {iq}", msg.opcode);
	}

	/// Transmit queue `txq` has room again after refusing packets.
	fn tx_resume(&self, _txq: u16) {}

	fn error_interrupt(&self) {}
}

/// Periodic timer driving [`Sge::starvation_tick`].
pub trait Timer: Send + Sync {
	/// Starts firing every `period_ms` milliseconds unless already running.
	fn arm(&self, period_ms: u32);

	fn cancel(&self);
}

pub struct Sge {
	params: SgeParams,
	hw: Arc<dyn SgeHw>,
	dma: Arc<dyn DmaAllocator>,
	mapper: Arc<dyn DmaMapper>,
	handler: Arc<dyn SgeHandler>,
	timer: Arc<dyn Timer>,
	iqs: RwSpinLock<BTreeMap<u16, Arc<IngressQueue>>>,
	txqs: RwSpinLock<BTreeMap<u16, Arc<TxQueue>>>,
	fwq: RwSpinLock<Option<Arc<IngressQueue>>>,
	starving: SpinMutex<StarvingList>,
}

impl Sge {
	pub fn new(
		params: SgeParams,
		hw: Arc<dyn SgeHw>,
		dma: Arc<dyn DmaAllocator>,
		mapper: Arc<dyn DmaMapper>,
		handler: Arc<dyn SgeHandler>,
		timer: Arc<dyn Timer>,
	) -> Result<Self, SgeError> {
		params.validate()?;
		debug!("SGE parameters: {params:?}");
		Ok(Self {
			params,
			hw,
			dma,
			mapper,
			handler,
			timer,
			iqs: RwSpinLock::new(BTreeMap::new()),
			txqs: RwSpinLock::new(BTreeMap::new()),
			fwq: RwSpinLock::new(None),
			starving: SpinMutex::new(StarvingList::default()),
		})
	}

	pub fn params(&self) -> &SgeParams {
		&self.params
	}

	/// Ingress queue with context id `cntxt_id`.
	pub fn iq(&self, cntxt_id: u16) -> Option<Arc<IngressQueue>> {
		self.iqs.read().get(&cntxt_id).cloned()
	}

	/// Egress queue with context id `cntxt_id`.
	pub fn txq(&self, cntxt_id: u16) -> Option<Arc<TxQueue>> {
		self.txqs.read().get(&cntxt_id).cloned()
	}

	pub fn fwq(&self) -> Option<Arc<IngressQueue>> {
		self.fwq.read().clone()
	}

	/// Creates an ingress queue. `create` asks the firmware for the
	/// context and returns its ids.
	fn alloc_iq(
		&self,
		cfg: &IqConfig,
		rxq_index: Option<u16>,
		fl: Option<FreeList>,
		create: impl FnOnce(&IqSetup) -> Result<IqIds, SgeError>,
	) -> Result<Arc<IngressQueue>, SgeError> {
		if cfg.qsize < 2 {
			return Err(SgeError::Geometry("ingress queue"));
		}
		let ring = DescRing::new(self.dma.clone(), cfg.qsize, 0)?;
		let mut iq = IngressQueue::new(ring, cfg, rxq_index, fl);
		let ids = create(&iq.setup())?;
		iq.set_ids(ids);
		let iq = Arc::new(iq);

		match self.iqs.write().entry(ids.cntxt_id) {
			Entry::Vacant(entry) => {
				entry.insert(iq.clone());
			}
			Entry::Occupied(_) => return Err(SgeError::Duplicate(ids.cntxt_id)),
		}

		if let Some(fl) = iq.free_list() {
			let mut fls = fl.lock();
			let needed = u32::from(fls.needed());
			let starving = fls.refill(needed, &*self.hw);
			fls.ring_doorbell(&*self.hw);
			drop(fls);
			if starving {
				self.add_starving(&iq);
			}
		}
		if !cfg.polling {
			self.hw.gts(ids.cntxt_id, 0, cfg.intr_params);
		}

		debug!(
			"Created iq {} (abs {}) with {} entries",
			ids.cntxt_id, ids.abs_id, cfg.qsize
		);
		Ok(iq)
	}

	/// Creates the firmware event queue. Interrupts of other queues may be
	/// forwarded through it.
	pub fn alloc_fwq(
		&self,
		cfg: &IqConfig,
		create: impl FnOnce(&IqSetup) -> Result<IqIds, SgeError>,
	) -> Result<Arc<IngressQueue>, SgeError> {
		if let Some(fwq) = self.fwq() {
			return Err(SgeError::Duplicate(fwq.cntxt_id()));
		}
		let iq = self.alloc_iq(cfg, None, None, create)?;
		*self.fwq.write() = Some(iq.clone());
		Ok(iq)
	}

	/// Creates an Ethernet receive queue delivering to upper-layer queue
	/// `index`, together with its free list.
	pub fn alloc_rxq(
		&self,
		index: u16,
		cfg: &IqConfig,
		fl: FlConfig,
		create: impl FnOnce(&IqSetup) -> Result<IqIds, SgeError>,
	) -> Result<Arc<IngressQueue>, SgeError> {
		let fl = FreeList::new(self.dma.clone(), fl, &self.params)?;
		self.alloc_iq(cfg, Some(index), Some(fl), create)
	}

	/// Creates an Ethernet transmit queue for upper-layer queue `index`.
	/// `create` asks the firmware for the context and returns its id.
	pub fn alloc_txq(
		&self,
		index: u16,
		cfg: &EqConfig,
		create: impl FnOnce(&EqSetup) -> Result<u16, SgeError>,
	) -> Result<Arc<TxQueue>, SgeError> {
		let mut txq = TxQueue::new(self.dma.clone(), self.mapper.clone(), index, cfg, &self.params)?;
		let cntxt_id = create(&txq.setup(cfg))?;
		txq.set_cntxt_id(cntxt_id);
		let txq = Arc::new(txq);

		match self.txqs.write().entry(cntxt_id) {
			Entry::Vacant(entry) => {
				entry.insert(txq.clone());
			}
			Entry::Occupied(_) => return Err(SgeError::Duplicate(cntxt_id)),
		}

		debug!("Created eq {cntxt_id} with {} descriptors", cfg.qsize);
		Ok(txq)
	}

	/// Stops `txq` and releases everything it holds. The device must have
	/// been told to stop reading the ring.
	pub fn free_txq(&self, txq: &Arc<TxQueue>) {
		{
			let mut txqs = self.txqs.write();
			if let Entry::Occupied(entry) = txqs.entry(txq.cntxt_id())
				&& Arc::ptr_eq(entry.get(), txq)
			{
				entry.remove();
			}
		}
		let unsent = txq.disable();
		if !unsent.is_empty() {
			debug!("eq {}: dropping {} unsent packets", txq.cntxt_id(), unsent.len());
		}
	}

	/// Stops `iq`, waiting for a running service pass to finish, and
	/// releases the buffers of its free list.
	pub fn free_rxq(&self, iq: &Arc<IngressQueue>) {
		iq.state.disable();
		{
			let mut iqs = self.iqs.write();
			if let Entry::Occupied(entry) = iqs.entry(iq.cntxt_id())
				&& Arc::ptr_eq(entry.get(), iq)
			{
				entry.remove();
			}
		}
		self.starving.lock().remove(iq);
		if let Some(fl) = iq.free_list() {
			fl.release_buffers();
		}
	}

	pub fn free_fwq(&self) {
		let fwq = self.fwq.write().take();
		if let Some(fwq) = fwq {
			self.free_rxq(&fwq);
		}
	}

	/// Interrupt of a queue with its own vector.
	pub fn intr(&self, iq: &Arc<IngressQueue>) {
		self.service(iq, 0);
	}

	/// Interrupt of the single shared vector. Everything is forwarded
	/// through the firmware event queue.
	pub fn intr_all(&self) {
		match self.fwq() {
			Some(fwq) => {
				self.service(&fwq, 0);
			}
			None => warn!("Interrupt without a firmware event queue"),
		}
	}

	/// Error interrupt.
	pub fn intr_err(&self) {
		error!("SGE error interrupt");
		self.handler.error_interrupt();
	}

	/// Services `iq` outside interrupt context, at most `budget` entries per
	/// pass.
	pub fn poll(&self, iq: &Arc<IngressQueue>, budget: u32) -> ServiceResult {
		self.service(iq, budget)
	}

	/// Logs the geometry and counters of every queue.
	pub fn dump(&self) {
		infoheader!(" SGE ");
		infoentry!("Chip", "{:?}", self.params.chip);
		infoentry!("Ingress queues", self.iqs.read().len());
		infoentry!("Egress queues", self.txqs.read().len());
		infoentry!("Starving free lists", self.starving_count());

		let iqs: Vec<_> = self.iqs.read().values().cloned().collect();
		let txqs: Vec<_> = self.txqs.read().values().cloned().collect();

		for iq in iqs {
			let stats = iq.stats();
			infoentry!(
				"iq",
				"{} abs {} size {} state {:?} rx {} pkts {} bytes",
				iq.cntxt_id(),
				iq.abs_id(),
				iq.qsize(),
				iq.state(),
				stats.rx_pkts,
				stats.rx_bytes
			);
			if let Some(fl) = iq.free_list() {
				infoentry!(
					"  fl",
					"{} size {} posted {} starving {}",
					fl.cntxt_id(),
					fl.qsize(),
					fl.posted(),
					fl.is_starving()
				);
			}
		}
		for txq in txqs {
			let stats = txq.stats();
			infoentry!(
				"eq",
				"{} size {} avail {} corked {} tx {} pkts {} drops",
				txq.cntxt_id(),
				txq.qsize(),
				txq.avail(),
				txq.is_corked(),
				stats.tx_pkts,
				stats.drops
			);
		}
		infofooter!();
	}
}
