//! A simulated adapter for integration tests.
//!
//! Memory is identity mapped, so the "device" writes responses straight
//! into the rings at their bus addresses and reads buffer pointers back
//! from the free lists.

#![allow(dead_code)]

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering, fence};
use std::sync::{Arc, Mutex};

use sge::config::IQ_ESIZE;
use sge::mm::IdentityDma;
use sge::net::Packet;
use sge::sge::msg::{
	CplFwMsg, CplOpcode, CplRxPkt, CplSgeEgrUpdate, F_RSPD_GEN, F_RSPD_NEWBUF,
	F_RXPKT_CSUM_CALC, F_RXPKT_VLAN_EX, IqDesc, RspType, S_RSPD_TYPE,
};
use sge::sge::{FreeList, IngressQueue, IqSetup, RxBufPool, TxQueue};
use sge::{FwMessage, IntrParams, IqConfig, IqIds, Sge, SgeError, SgeHandler, SgeHw, SgeParams, Timer};
use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromZeros, IntoBytes};

pub const RSS_HASH: u32 = 0x1234_5678;

fn device_ptr(paddr: u64) -> *mut u8 {
	ptr::with_exposed_provenance_mut(paddr as usize)
}

/// Register file of the adapter.
#[derive(Default)]
pub struct Adapter {
	gts: Mutex<Vec<(u16, u16, IntrParams)>>,
	fl_doorbells: Mutex<Vec<(u16, u16)>>,
	tx_doorbells: Mutex<Vec<(u16, u16)>>,
}

impl Adapter {
	pub fn gts(&self) -> Vec<(u16, u16, IntrParams)> {
		self.gts.lock().unwrap().clone()
	}

	pub fn last_gts(&self) -> Option<(u16, u16, IntrParams)> {
		self.gts.lock().unwrap().last().copied()
	}

	pub fn fl_doorbells(&self) -> Vec<(u16, u16)> {
		self.fl_doorbells.lock().unwrap().clone()
	}

	/// Descriptors announced on egress queue `eq` so far.
	pub fn tx_announced(&self, eq: u16) -> u32 {
		self.tx_doorbells
			.lock()
			.unwrap()
			.iter()
			.filter(|(id, _)| *id == eq)
			.map(|(_, n)| u32::from(*n))
			.sum()
	}
}

impl SgeHw for Adapter {
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

/// The device's side of an ingress queue.
pub struct IqProducer {
	paddr: u64,
	size: u16,
	pidx: u16,
	generation: bool,
}

impl IqProducer {
	pub fn new(iq: &IngressQueue) -> Self {
		Self {
			paddr: iq.ring_paddr(),
			size: iq.qsize(),
			pidx: 0,
			generation: true,
		}
	}

	/// Writes `desc` at the producer index. The generation byte lands last.
	pub fn push(&mut self, desc: IqDesc, rsp_type: RspType) {
		self.push_raw(desc, rsp_type.into());
	}

	/// Like `push`, with any value in the two response type bits.
	pub fn push_raw(&mut self, mut desc: IqDesc, rsp_type: u8) {
		desc.ctrl.type_gen = (rsp_type << S_RSPD_TYPE) | if self.generation { F_RSPD_GEN } else { 0 };
		let bytes = desc.as_bytes();
		let dst = device_ptr(self.paddr + u64::from(self.pidx) * IQ_ESIZE as u64);
		let (body, tail) = bytes.split_at(IQ_ESIZE - 8);
		unsafe {
			for (i, b) in body.iter().enumerate() {
				ptr::write_volatile(dst.add(i), *b);
			}
			fence(Ordering::Release);
			for (i, b) in tail.iter().enumerate() {
				ptr::write_volatile(dst.add(body.len() + i), *b);
			}
		}

		self.pidx += 1;
		if self.pidx == self.size {
			self.pidx = 0;
			self.generation = !self.generation;
		}
	}
}

/// The device's side of a free list without buffer packing: every payload
/// goes to a fresh buffer.
pub struct FlConsumer {
	paddr: u64,
	size: u16,
	cidx: u16,
	pktshift: usize,
}

impl FlConsumer {
	pub fn new(fl: &FreeList, params: &SgeParams) -> Self {
		Self {
			paddr: fl.ring_paddr(),
			size: fl.qsize(),
			cidx: 0,
			pktshift: params.fl_pktshift.into(),
		}
	}

	/// DMAs `frame` into the next posted buffer and returns the length the
	/// response reports.
	pub fn fill(&mut self, frame: &[u8]) -> u32 {
		let slot = device_ptr(self.paddr + u64::from(self.cidx) * 8);
		let mut addr = [0u8; 8];
		unsafe {
			for (i, b) in addr.iter_mut().enumerate() {
				*b = ptr::read_volatile(slot.add(i));
			}
		}
		let buf = device_ptr(u64::from_be_bytes(addr));
		assert!(!buf.is_null(), "no buffer posted at slot {}", self.cidx);
		unsafe {
			for i in 0..self.pktshift {
				ptr::write_volatile(buf.add(i), 0);
			}
			for (i, b) in frame.iter().enumerate() {
				ptr::write_volatile(buf.add(self.pktshift + i), *b);
			}
		}

		self.cidx = (self.cidx + 1) % self.size;
		(self.pktshift + frame.len()) as u32
	}
}

/// A `CPL_RX_PKT` for a payload of `len` bytes in a new buffer.
pub fn rx_pkt(len: u32, csum_ok: bool, vlan: Option<u16>) -> IqDesc {
	let mut desc = IqDesc::new_zeroed();
	desc.rss.opcode = CplOpcode::RxPkt.into();
	desc.rss.hash_val = U32::new(RSS_HASH);
	let mut flags = F_RXPKT_CSUM_CALC;
	if vlan.is_some() {
		flags |= F_RXPKT_VLAN_EX;
	}
	let cpl = CplRxPkt {
		opcode: CplOpcode::RxPkt.into(),
		flags,
		csum: U16::new(if csum_ok { 0xffff } else { 0x1d2c }),
		vlan: U16::new(vlan.unwrap_or(0)),
		len: U16::new(len as u16),
		l2info: U32::ZERO,
		hdr_len: U16::ZERO,
		err_vec: U16::ZERO,
	};
	cpl.write_to_prefix(&mut desc.cpl).unwrap();
	desc.ctrl.pldbuflen_qid = U32::new(F_RSPD_NEWBUF | len);
	desc
}

/// A `CPL_SGE_EGR_UPDATE` for egress queue `eq`.
pub fn egr_update(eq: u16) -> IqDesc {
	let opcode = CplOpcode::SgeEgrUpdate;
	let mut desc = IqDesc::new_zeroed();
	desc.rss.opcode = opcode.into();
	let cpl = CplSgeEgrUpdate {
		opcode_qid: U32::new((u32::from(u8::from(opcode)) << 24) | u32::from(eq)),
		cidx: U16::ZERO,
		pidx: U16::ZERO,
	};
	cpl.write_to_prefix(&mut desc.cpl).unwrap();
	desc
}

pub fn fw_msg(kind: u8, data: [u64; 4]) -> IqDesc {
	let opcode = CplOpcode::Fw6Msg;
	let mut desc = IqDesc::new_zeroed();
	desc.rss.opcode = opcode.into();
	let cpl = CplFwMsg {
		opcode: opcode.into(),
		kind,
		rsvd0: U16::ZERO,
		rsvd1: U32::ZERO,
		data: data.map(U64::new),
	};
	cpl.write_to_prefix(&mut desc.cpl).unwrap();
	desc
}

/// A CPL nobody understands.
pub fn unknown_cpl(opcode: u8) -> IqDesc {
	let mut desc = IqDesc::new_zeroed();
	desc.rss.opcode = opcode;
	desc.cpl[0] = opcode;
	desc
}

/// An interrupt forwarded from ingress queue `qid`.
pub fn forwarded(qid: u16) -> IqDesc {
	let mut desc = IqDesc::new_zeroed();
	desc.ctrl.pldbuflen_qid = U32::new(qid.into());
	desc
}

/// Reports `cidx` as the consumer index of `txq` on its status page.
pub fn complete_eq(txq: &TxQueue, cidx: u16) {
	let status = device_ptr(txq.status_paddr());
	let bytes = cidx.to_be_bytes();
	unsafe {
		ptr::write_volatile(status.add(4), bytes[0]);
		ptr::write_volatile(status.add(5), bytes[1]);
	}
}

/// Completes everything announced on `txq`.
pub fn complete_all(adapter: &Adapter, txq: &TxQueue) {
	let pidx = adapter.tx_announced(txq.cntxt_id()) % u32::from(txq.qsize());
	complete_eq(txq, pidx as u16);
}

#[derive(Default)]
pub struct Stack {
	pub rx: Mutex<Vec<(u16, Packet)>>,
	pub fw: Mutex<Vec<(u16, FwMessage)>>,
	pub resumed: Mutex<Vec<u16>>,
	pub errors: AtomicUsize,
}

impl SgeHandler for Stack {
	fn rx_packet(&self, rxq: u16, pkt: Packet) {
		self.rx.lock().unwrap().push((rxq, pkt));
	}

	fn fw_message(&self, iq: u16, msg: FwMessage) {
		self.fw.lock().unwrap().push((iq, msg));
	}

	fn tx_resume(&self, txq: u16) {
		self.resumed.lock().unwrap().push(txq);
	}

	fn error_interrupt(&self) {
		self.errors.fetch_add(1, Ordering::Relaxed);
	}
}

#[derive(Default)]
pub struct Ticker {
	armed: AtomicUsize,
	cancelled: AtomicUsize,
}

impl Ticker {
	pub fn armed(&self) -> usize {
		self.armed.load(Ordering::Relaxed)
	}

	pub fn cancelled(&self) -> usize {
		self.cancelled.load(Ordering::Relaxed)
	}
}

impl Timer for Ticker {
	fn arm(&self, _period_ms: u32) {
		self.armed.fetch_add(1, Ordering::Relaxed);
	}

	fn cancel(&self) {
		self.cancelled.fetch_add(1, Ordering::Relaxed);
	}
}

pub struct Harness {
	pub sge: Sge,
	pub adapter: Arc<Adapter>,
	pub stack: Arc<Stack>,
	pub ticker: Arc<Ticker>,
}

impl Harness {
	pub fn new(params: SgeParams) -> Self {
		let adapter = Arc::new(Adapter::default());
		let stack = Arc::new(Stack::default());
		let ticker = Arc::new(Ticker::default());
		let sge = Sge::new(
			params,
			adapter.clone(),
			Arc::new(IdentityDma::new()),
			Arc::new(IdentityDma::new()),
			stack.clone(),
			ticker.clone(),
		)
		.unwrap();
		Self {
			sge,
			adapter,
			stack,
			ticker,
		}
	}

	pub fn pool(&self, buf_size: u32, max_bufs: u32) -> RxBufPool {
		RxBufPool::new(Arc::new(IdentityDma::new()), buf_size, max_bufs)
	}

	pub fn fwq(&self, cntxt_id: u16) -> Arc<IngressQueue> {
		self.sge
			.alloc_fwq(&iq_config(64), ids(cntxt_id, None))
			.unwrap()
	}

	pub fn received(&self) -> Vec<(u16, Packet)> {
		std::mem::take(&mut *self.stack.rx.lock().unwrap())
	}
}

/// Parameters the simulated free lists understand.
pub fn params() -> SgeParams {
	SgeParams {
		fl_pack: false,
		..SgeParams::default()
	}
}

pub fn iq_config(qsize: u16) -> IqConfig {
	IqConfig {
		qsize,
		intr_params: IntrParams::default(),
		polling: false,
	}
}

/// A firmware reply handing out the given context ids.
pub fn ids(
	cntxt_id: u16,
	fl_cntxt_id: Option<u16>,
) -> impl FnOnce(&IqSetup) -> Result<IqIds, SgeError> {
	move |setup| {
		assert_ne!(setup.iq_paddr, 0);
		assert_eq!(setup.fl_paddr.is_some(), fl_cntxt_id.is_some());
		Ok(IqIds {
			cntxt_id,
			abs_id: cntxt_id + 0x100,
			fl_cntxt_id,
		})
	}
}

pub fn frame(len: usize, seed: u8) -> Vec<u8> {
	(0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}
