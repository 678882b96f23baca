//! Stand-ins for the driver side of the engine in unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{FwMessage, IntrParams, Sge, SgeHandler, SgeHw, Timer};
use crate::config::SgeParams;
use crate::mm::{DmaBinding, DmaError, DmaMapper, IdentityDma};
use crate::net::Packet;

/// Records every register write.
#[derive(Default)]
pub(crate) struct RecordingHw {
	gts: Mutex<Vec<(u16, u16, IntrParams)>>,
	fl_doorbells: Mutex<Vec<(u16, u16)>>,
	tx_doorbells: Mutex<Vec<(u16, u16)>>,
}

impl RecordingHw {
	pub fn gts(&self) -> Vec<(u16, u16, IntrParams)> {
		self.gts.lock().unwrap().clone()
	}

	pub fn fl_doorbells(&self) -> Vec<(u16, u16)> {
		self.fl_doorbells.lock().unwrap().clone()
	}

	pub fn tx_doorbells(&self) -> Vec<(u16, u16)> {
		self.tx_doorbells.lock().unwrap().clone()
	}
}

impl SgeHw for RecordingHw {
	fn gts(&self, iq: u16, cidx_inc: u16, params: IntrParams) {
		self.gts.lock().unwrap().push((iq, cidx_inc, params));
	}

	fn ring_fl_doorbell(&self, fl: u16, ndesc: u16) {
		self.fl_doorbells.lock().unwrap().push((fl, ndesc));
	}

	fn ring_tx_doorbell(&self, eq: u16, ndesc: u16) {
		self.tx_doorbells.lock().unwrap().push((eq, ndesc));
	}
}

/// Identity mapping that counts bindings.
#[derive(Default)]
pub(crate) struct CountingMapper {
	bound: AtomicUsize,
	unbound: AtomicUsize,
	/// Status page and consumer index to report on the next bind.
	complete_on_bind: Mutex<Option<(u64, u16)>>,
}

impl CountingMapper {
	/// Has the device finish `txq` up to `cidx` while the next fragment is
	/// being bound.
	pub fn complete_on_next_bind(&self, txq: &super::TxQueue, cidx: u16) {
		*self.complete_on_bind.lock().unwrap() = Some((txq.status_paddr(), cidx));
	}

	pub fn bound(&self) -> usize {
		self.bound.load(Ordering::Relaxed)
	}

	pub fn unbound(&self) -> usize {
		self.unbound.load(Ordering::Relaxed)
	}
}

impl DmaMapper for CountingMapper {
	fn bind(&self, data: &[u8]) -> Result<DmaBinding, DmaError> {
		let binding = IdentityDma.bind(data)?;
		self.bound.fetch_add(1, Ordering::Relaxed);
		if let Some((status, cidx)) = self.complete_on_bind.lock().unwrap().take() {
			write_cidx(status, cidx);
		}
		Ok(binding)
	}

	fn unbind(&self, binding: DmaBinding) {
		self.unbound.fetch_add(1, Ordering::Relaxed);
		IdentityDma.unbind(binding);
	}
}

#[derive(Default)]
pub(crate) struct FakeTimer {
	armed: AtomicUsize,
	cancelled: AtomicUsize,
}

impl FakeTimer {
	pub fn armed(&self) -> usize {
		self.armed.load(Ordering::Relaxed)
	}

	pub fn cancelled(&self) -> usize {
		self.cancelled.load(Ordering::Relaxed)
	}
}

impl Timer for FakeTimer {
	fn arm(&self, _period_ms: u32) {
		self.armed.fetch_add(1, Ordering::Relaxed);
	}

	fn cancel(&self) {
		self.cancelled.fetch_add(1, Ordering::Relaxed);
	}
}

#[derive(Default)]
pub(crate) struct CollectingHandler {
	pub rx: Mutex<Vec<(u16, Packet)>>,
	pub fw: Mutex<Vec<(u16, FwMessage)>>,
	pub resumed: Mutex<Vec<u16>>,
}

impl SgeHandler for CollectingHandler {
	fn rx_packet(&self, rxq: u16, pkt: Packet) {
		self.rx.lock().unwrap().push((rxq, pkt));
	}

	fn fw_message(&self, iq: u16, msg: FwMessage) {
		self.fw.lock().unwrap().push((iq, msg));
	}

	fn tx_resume(&self, txq: u16) {
		self.resumed.lock().unwrap().push(txq);
	}
}

/// An engine wired to recording stand-ins.
pub(crate) struct TestSge {
	pub sge: Sge,
	pub hw: Arc<RecordingHw>,
	pub mapper: Arc<CountingMapper>,
	pub timer: Arc<FakeTimer>,
	pub handler: Arc<CollectingHandler>,
}

impl TestSge {
	pub fn new(params: SgeParams) -> Self {
		let hw = Arc::new(RecordingHw::default());
		let mapper = Arc::new(CountingMapper::default());
		let timer = Arc::new(FakeTimer::default());
		let handler = Arc::new(CollectingHandler::default());
		let sge = Sge::new(
			params,
			hw.clone(),
			Arc::new(IdentityDma::new()),
			mapper.clone(),
			handler.clone(),
			timer.clone(),
		)
		.unwrap();
		Self {
			sge,
			hw,
			mapper,
			timer,
			handler,
		}
	}
}

/// Reports `cidx` as the consumer index of `txq` on its status page.
pub(crate) fn complete_eq(txq: &super::TxQueue, cidx: u16) {
	write_cidx(txq.status_paddr(), cidx);
}

fn write_cidx(status_paddr: u64, cidx: u16) {
	let status = core::ptr::with_exposed_provenance_mut::<u8>(status_paddr as usize);
	let bytes = cidx.to_be_bytes();
	unsafe {
		core::ptr::write_volatile(status.add(4), bytes[0]);
		core::ptr::write_volatile(status.add(5), bytes[1]);
	}
}
