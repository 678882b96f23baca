//! Ingress queues and the response processor that drains them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, Ordering, fence};

use crossbeam_utils::CachePadded;
use hermit_sync::SpinMutex;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use volatile::map_field;
use zerocopy::FromBytes;

use super::fl::FreeList;
use super::msg::{
	CplFwMsg, CplOpcode, CplRxPkt, CplSgeEgrUpdate, F_RSPD_NEWBUF, F_RXPKT_CSUM_CALC,
	F_RXPKT_VLAN_EX, IqDesc, M_EGR_QID, M_RSPD_LEN, M_RSPD_QID, RspType,
};
use super::ring::{DescRing, RingCursor};
use super::stats::{FlStats, RxqStats};
use super::{FwMessage, Sge};
use crate::config::{FWD_RETRY_DEPTH, IQ_CIDX_UPDATE};
use crate::net::Packet;

/// Holdoff settings applied when an ingress queue is re-armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntrParams {
	/// Index into the adapter's holdoff timer table.
	pub timer_idx: u8,
	/// Also interrupt once the packet-count threshold is reached.
	pub pktc: bool,
}

impl IntrParams {
	/// Timer index that only returns credits and leaves the queue disarmed.
	pub const X_TIMERREG_UPDATE_CIDX: u8 = 7;

	/// Returns credits without arming an interrupt.
	pub const UPDATE_ONLY: Self = Self {
		timer_idx: Self::X_TIMERREG_UPDATE_CIDX,
		pktc: false,
	};

	/// Longest holdoff, used when a queue stopped on an empty free list.
	pub const STARVED: Self = Self {
		timer_idx: 5,
		pktc: false,
	};

	pub const fn new(timer_idx: u8, pktc: bool) -> Self {
		Self { timer_idx, pktc }
	}

	/// The `SEINTARM` field of a GTS write.
	pub fn seintarm(self) -> u32 {
		(u32::from(self.timer_idx) << 1) | u32::from(self.pktc)
	}

	pub fn arms(self) -> bool {
		self.timer_idx != Self::X_TIMERREG_UPDATE_CIDX
	}
}

impl Default for IntrParams {
	fn default() -> Self {
		Self::new(1, true)
	}
}

/// Processing state of an ingress queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum IqState {
	Idle = 0,
	/// Someone is draining the queue.
	Busy = 1,
	/// Busy, and the owner has to take another pass before going idle.
	PendingRetry = 2,
	/// Torn down. Never claimed again.
	Disabled = 3,
}

pub(crate) struct IqStateCell(CachePadded<AtomicU8>);

impl IqStateCell {
	fn new() -> Self {
		Self(CachePadded::new(AtomicU8::new(IqState::Idle.into())))
	}

	pub fn get(&self) -> IqState {
		IqState::try_from(self.0.load(Ordering::Relaxed)).unwrap_or(IqState::Disabled)
	}

	fn transition(&self, from: IqState, to: IqState) -> Result<(), IqState> {
		self.0
			.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire)
			.map(drop)
			.map_err(|v| IqState::try_from(v).unwrap_or(IqState::Disabled))
	}

	/// Idle to busy.
	pub fn try_claim(&self) -> bool {
		self.transition(IqState::Idle, IqState::Busy).is_ok()
	}

	/// Claims the queue or, if someone else holds it, makes them take
	/// another pass. Returns `true` if the caller now owns the queue.
	pub fn claim_or_defer(&self) -> bool {
		loop {
			match self.transition(IqState::Idle, IqState::Busy) {
				Ok(()) => return true,
				Err(IqState::Busy) => {
					if self.transition(IqState::Busy, IqState::PendingRetry).is_ok() {
						return false;
					}
				}
				Err(IqState::PendingRetry | IqState::Disabled) => return false,
				Err(IqState::Idle) => {}
			}
		}
	}

	/// Gives the queue up. Returns `false`, with the queue still owned by
	/// the caller, if another pass was requested meanwhile.
	pub fn release(&self) -> bool {
		match self.transition(IqState::Busy, IqState::Idle) {
			Ok(()) => true,
			Err(state) => {
				debug_assert_eq!(state, IqState::PendingRetry);
				if let Err(state) = self.transition(IqState::PendingRetry, IqState::Busy) {
					warn!("Ingress queue left {state:?} while owned");
				}
				false
			}
		}
	}

	/// Waits for the current owner, if any, and retires the queue.
	pub fn disable(&self) {
		loop {
			match self.transition(IqState::Idle, IqState::Disabled) {
				Ok(()) | Err(IqState::Disabled) => return,
				Err(_) => spin_loop(),
			}
		}
	}
}

/// Geometry and interrupt behaviour of an ingress queue.
#[derive(Clone, Copy, Debug)]
pub struct IqConfig {
	pub qsize: u16,
	pub intr_params: IntrParams,
	/// Serviced through [`Sge::poll`] only; never re-armed.
	pub polling: bool,
}

/// What the firmware needs to create an ingress queue (and its free list).
#[derive(Clone, Copy, Debug)]
pub struct IqSetup {
	pub iq_paddr: u64,
	pub iq_size: u16,
	pub fl_paddr: Option<u64>,
	pub fl_size: u16,
}

/// Handles the firmware returned for a new ingress queue.
#[derive(Clone, Copy, Debug, Default)]
pub struct IqIds {
	pub cntxt_id: u16,
	pub abs_id: u16,
	pub fl_cntxt_id: Option<u16>,
}

/// Whether a service pass emptied the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceResult {
	Done,
	/// The budget ran out with responses possibly still pending.
	MoreWork,
}

pub(crate) struct IqInner {
	ring: DescRing<IqDesc>,
	cursor: RingCursor,
	/// Entries consumed but not yet returned with a GTS write.
	uncredited: u16,
	intr_params: IntrParams,
	polling: bool,
	stats: RxqStats,
}

impl IqInner {
	/// The entry at the cursor, if the device has written it.
	fn next_response(&self) -> Option<IqDesc> {
		let ptr = self.ring.entry(self.cursor.index());
		let ctrl = map_field!(ptr.ctrl).read();
		if ctrl.generation() != self.cursor.generation().get() {
			return None;
		}
		fence(Ordering::Acquire);
		Some(ptr.read())
	}

	fn advance(&mut self) {
		self.cursor.advance();
		self.uncredited += 1;
	}

	fn take_uncredited(&mut self) -> u16 {
		core::mem::take(&mut self.uncredited)
	}
}

pub struct IngressQueue {
	cntxt_id: u16,
	abs_id: u16,
	/// Upper-layer receive queue this one delivers to.
	rxq_index: Option<u16>,
	paddr: u64,
	qsize: u16,
	pub(crate) state: IqStateCell,
	pub(crate) inner: SpinMutex<IqInner>,
	pub(crate) fl: Option<FreeList>,
}

impl IngressQueue {
	pub(crate) fn new(
		ring: DescRing<IqDesc>,
		cfg: &IqConfig,
		rxq_index: Option<u16>,
		fl: Option<FreeList>,
	) -> Self {
		Self {
			cntxt_id: 0,
			abs_id: 0,
			rxq_index,
			paddr: ring.paddr(),
			qsize: ring.len(),
			state: IqStateCell::new(),
			inner: SpinMutex::new(IqInner {
				ring,
				cursor: RingCursor::new(cfg.qsize),
				uncredited: 0,
				intr_params: cfg.intr_params,
				polling: cfg.polling,
				stats: RxqStats::default(),
			}),
			fl,
		}
	}

	pub(crate) fn setup(&self) -> IqSetup {
		IqSetup {
			iq_paddr: self.paddr,
			iq_size: self.qsize,
			fl_paddr: self.fl.as_ref().map(FreeList::ring_paddr),
			fl_size: self.fl.as_ref().map_or(0, FreeList::qsize),
		}
	}

	pub(crate) fn set_ids(&mut self, ids: IqIds) {
		self.cntxt_id = ids.cntxt_id;
		self.abs_id = ids.abs_id;
		if let (Some(fl), Some(id)) = (self.fl.as_mut(), ids.fl_cntxt_id) {
			fl.set_cntxt_id(id);
		}
	}

	pub fn cntxt_id(&self) -> u16 {
		self.cntxt_id
	}

	pub fn abs_id(&self) -> u16 {
		self.abs_id
	}

	pub fn rxq_index(&self) -> Option<u16> {
		self.rxq_index
	}

	pub fn qsize(&self) -> u16 {
		self.qsize
	}

	/// Bus address of the response ring.
	pub fn ring_paddr(&self) -> u64 {
		self.paddr
	}

	pub fn state(&self) -> IqState {
		self.state.get()
	}

	pub fn free_list(&self) -> Option<&FreeList> {
		self.fl.as_ref()
	}

	pub fn stats(&self) -> RxqStats {
		self.inner.lock().stats
	}

	pub fn fl_stats(&self) -> Option<FlStats> {
		self.fl.as_ref().map(FreeList::stats)
	}

	pub fn set_intr_params(&self, params: IntrParams) {
		self.inner.lock().intr_params = params;
	}
}

enum Retry {
	/// Found busy; has to be claimed first.
	Busy(Arc<IngressQueue>),
	/// Already claimed by this pass.
	Claimed(Arc<IngressQueue>),
}

/// Forwarded queues that could not be serviced on the spot.
pub(crate) struct RetryList {
	items: heapless::Vec<Retry, FWD_RETRY_DEPTH>,
	spill: Vec<Retry>,
}

impl RetryList {
	pub fn new() -> Self {
		Self {
			items: heapless::Vec::new(),
			spill: Vec::new(),
		}
	}

	fn push(&mut self, item: Retry) {
		if let Err(item) = self.items.push(item) {
			debug!("Forward retry list full, spilling");
			self.spill.push(item);
		}
	}

	fn pop(&mut self) -> Option<Retry> {
		self.spill.pop().or_else(|| self.items.pop())
	}
}

impl Sge {
	/// Claims `iq` and drains it, `budget` entries per pass (0 for no
	/// limit), until nobody asks for another pass.
	pub(crate) fn service(&self, iq: &Arc<IngressQueue>, budget: u32) -> ServiceResult {
		if !iq.state.claim_or_defer() {
			return ServiceResult::Done;
		}

		let mut retry = RetryList::new();
		loop {
			let result = self.service_iq(iq, budget, &mut retry, true);
			self.drain_retry(&mut retry);
			if iq.state.release() {
				return result;
			}
		}
	}

	/// One pass over the new entries of a claimed queue.
	///
	/// Forwarded queues are serviced on the spot if `dispatch` is set and
	/// they can be claimed, and are queued on `retry` otherwise.
	pub(crate) fn service_iq(
		&self,
		iq: &Arc<IngressQueue>,
		budget: u32,
		retry: &mut RetryList,
		dispatch: bool,
	) -> ServiceResult {
		let limit = if budget == 0 { u32::MAX } else { budget };
		let mut inner = iq.inner.lock();
		let mut processed = 0u32;
		let mut starved = false;
		let mut result = ServiceResult::Done;

		while let Some(d) = inner.next_response() {
			match RspType::try_from(d.ctrl.rsp_type()) {
				Ok(RspType::FlBuf) => match iq.fl.as_ref() {
					Some(fl) => {
						let lq = d.ctrl.pldbuflen_qid.get();
						let mut fls = fl.lock();
						let Some(pkt) = fls.consume(lq & M_RSPD_LEN, lq & F_RSPD_NEWBUF != 0)
						else {
							// Leave the entry for when a buffer can be had.
							inner.stats.nobuf += 1;
							starved = true;
							break;
						};
						if u32::from(fls.needed()) >= self.params.fl_refill_batch {
							fls.refill(self.params.fl_refill_batch, &*self.hw);
						}
						drop(fls);
						self.handle_cpl(iq, &mut inner, &d, Some(pkt));
					}
					None => {
						warn!("Free-list response on iq {} without a free list", iq.cntxt_id);
						inner.stats.unknown_rsp += 1;
					}
				},
				Ok(RspType::Cpl) => self.handle_cpl(iq, &mut inner, &d, None),
				Ok(RspType::Intr) => {
					inner.stats.forwarded += 1;
					self.forward(&d, retry, dispatch);
				}
				Err(_) => {
					warn!(
						"Unexpected response type {} on iq {}",
						d.ctrl.rsp_type(),
						iq.cntxt_id
					);
					inner.stats.unknown_rsp += 1;
				}
			}

			inner.advance();
			if inner.uncredited >= IQ_CIDX_UPDATE {
				let n = inner.take_uncredited();
				self.hw.gts(iq.cntxt_id, n, IntrParams::UPDATE_ONLY);
			}

			processed += 1;
			if processed >= limit {
				result = ServiceResult::MoreWork;
				break;
			}
		}

		if let Some(fl) = iq.fl.as_ref() {
			let mut fls = fl.lock();
			let needed = u32::from(fls.needed());
			let starving = fls.refill(needed, &*self.hw);
			fls.ring_doorbell(&*self.hw);
			drop(fls);
			if starving || starved {
				self.add_starving(iq);
			}
		}

		let params = if starved {
			IntrParams::STARVED
		} else if result == ServiceResult::MoreWork || inner.polling {
			IntrParams::UPDATE_ONLY
		} else {
			inner.intr_params
		};
		let n = inner.take_uncredited();
		self.hw.gts(iq.cntxt_id, n, params);

		result
	}

	fn handle_cpl(
		&self,
		iq: &IngressQueue,
		inner: &mut IqInner,
		d: &IqDesc,
		payload: Option<Packet>,
	) {
		let opcode = d.rss.opcode;
		match CplOpcode::try_from(opcode) {
			Ok(CplOpcode::RxPkt) => {
				let (Some(mut pkt), Ok((cpl, _))) = (payload, CplRxPkt::read_from_prefix(&d.cpl))
				else {
					warn!("CPL_RX_PKT without payload on iq {}", iq.cntxt_id);
					return;
				};
				pkt.rx.rss_hash = d.rss.hash_val.get();
				pkt.rx.csum_ok = cpl.flags & F_RXPKT_CSUM_CALC != 0
					&& cpl.err_vec.get() == 0
					&& cpl.csum.get() == 0xffff;
				if cpl.flags & F_RXPKT_VLAN_EX != 0 {
					pkt.rx.vlan = Some(cpl.vlan.get());
					inner.stats.vlan_ex += 1;
				}

				inner.stats.rx_pkts += 1;
				inner.stats.rx_bytes += pkt.len() as u64;
				inner.stats.csum_ok += u64::from(pkt.rx.csum_ok);
				trace!("iq {}: received {} bytes", iq.cntxt_id, pkt.len());

				match iq.rxq_index {
					Some(index) => self.handler.rx_packet(index, pkt),
					None => debug!("Dropping packet received on iq {}", iq.cntxt_id),
				}
			}
			Ok(CplOpcode::SgeEgrUpdate) => {
				let Ok((cpl, _)) = CplSgeEgrUpdate::read_from_prefix(&d.cpl) else {
					return;
				};
				let qid = cpl.opcode_qid.get() & M_EGR_QID;
				match u16::try_from(qid).ok().and_then(|id| self.txq(id)) {
					Some(txq) => self.egress_update(&txq),
					None => warn!("Egress update for unknown eq {qid}"),
				}
			}
			Ok(CplOpcode::Fw4Msg | CplOpcode::Fw6Msg) => {
				let Ok((cpl, _)) = CplFwMsg::read_from_prefix(&d.cpl) else {
					return;
				};
				inner.stats.fw_msgs += 1;
				let msg = FwMessage {
					opcode,
					kind: cpl.kind,
					data: cpl.data.map(|flit| flit.get()),
				};
				self.handler.fw_message(iq.cntxt_id, msg);
			}
			_ => {
				warn!("Unexpected CPL opcode {opcode:#x} on iq {}", iq.cntxt_id);
				inner.stats.unknown_cpl += 1;
			}
		}
	}

	fn forward(&self, d: &IqDesc, retry: &mut RetryList, dispatch: bool) {
		let qid = d.ctrl.pldbuflen_qid.get() & M_RSPD_QID;
		let Some(iq) = u16::try_from(qid).ok().and_then(|id| self.iq(id)) else {
			warn!("Interrupt forwarded from unknown iq {qid}");
			return;
		};

		if dispatch && iq.state.try_claim() {
			self.run_forwarded(iq, retry);
		} else {
			retry.push(Retry::Busy(iq));
		}
	}

	/// Services a claimed forwarded queue once. It stays claimed on the
	/// retry list if it has more to do.
	fn run_forwarded(&self, iq: Arc<IngressQueue>, retry: &mut RetryList) {
		match self.service_iq(&iq, self.params.fwd_budget, retry, false) {
			ServiceResult::Done if iq.state.release() => {}
			_ => retry.push(Retry::Claimed(iq)),
		}
	}

	fn drain_retry(&self, retry: &mut RetryList) {
		while let Some(item) = retry.pop() {
			let iq = match item {
				Retry::Claimed(iq) => iq,
				Retry::Busy(iq) => {
					if !iq.state.claim_or_defer() {
						continue;
					}
					iq
				}
			};
			self.run_forwarded(iq, retry);
		}
	}
}
