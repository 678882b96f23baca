//! Ethernet transmit queues.
//!
//! A transmit call writes one work request per packet, or one per batch of
//! coalesced packets, and rings the doorbell in growing batches as the ring
//! fills up. Descriptors and the resources behind them are reclaimed as the
//! device reports progress through the status page and egress updates.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::DerefMut;

use bitflags::bitflags;
use hermit_sync::SpinMutex;
use smallvec::SmallVec;
use zerocopy::big_endian::{U16, U32, U64};

use super::error::{Exhausted, SgeError, TxError};
use super::eq::{EqRing, SlotRange};
use super::msg::{
	CplOpcode, CplTxPktCore, F_FW_WR_EQUEQ, F_FW_WR_EQUIQ, FwEqFlushWr, FwEthTxPktWr, FwWrOpcode,
	S_TXPKT_INTF, S_TXPKT_OPCODE, S_TXPKT_PF, fw_wr_immdlen, fw_wr_len16, fw_wr_op,
};
use super::offload;
use super::sgl::{self, SGL_MAX_BYTES};
use super::stats::TxqStats;
use super::txb::CopyBuf;
use super::txinfo::{TxInfo, TxResources};
use super::txpkts::TxPkts;
use super::{Sge, SgeHw};
use crate::config::{
	CPL_FLITS, EQ_ESIZE, EQ_ESIZE_FLITS, EQ_SPG_DESCS, SGE_MAX_WR_FLITS, SgeParams, TX_RECLAIM_MAX,
	TXPKT_WR_HDR_FLITS,
};
use crate::mm::{DmaAllocator, DmaBinding, DmaMapper};
use crate::net::Packet;

/// Largest immediate payload, bounded by the 8-bit length field.
const IMM_MAX: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EqConfig {
	/// Descriptors, the status page excluded.
	pub qsize: u16,
	/// Transmit channel (port) of the queue.
	pub tx_chan: u8,
	/// Ingress queue that receives the egress updates.
	pub iqid: u16,
}

/// What the firmware needs to create the egress context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EqSetup {
	pub paddr: u64,
	/// Descriptors, the status page included.
	pub qsize: u16,
	pub iqid: u16,
	pub tx_chan: u8,
}

bitflags! {
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub(crate) struct EqFlags: u8 {
		/// Out of descriptors or transmit resources; waiting for an update.
		const CORKED = 1 << 0;
		/// A work request asked the device for an egress update.
		const UPDATE_PENDING = 1 << 1;
		const DISABLED = 1 << 2;
	}
}

/// Shadow of a work request: the packets it carries and what they hold.
#[derive(Default)]
pub(crate) struct TxSdesc {
	pub packets: SmallVec<[Packet; 1]>,
	/// Descriptors of the work request, zero for unused slots.
	pub desc_used: u16,
	pub txb_used: u32,
	pub bindings: SmallVec<[DmaBinding; 2]>,
}

pub(crate) struct TxqInner {
	eq: EqRing,
	/// One entry per descriptor, filled at the first descriptor of each
	/// work request.
	sdesc: Box<[TxSdesc]>,
	res: TxResources,
	batch: TxPkts,
	flags: EqFlags,
	ctrl0: u32,
	iqid: u16,
	coalesce: bool,
	update_lowat: u16,
	stats: TxqStats,
}

impl TxqInner {
	/// Reclaims up to `max` completed descriptors, moving their packets to
	/// `done`. Returns the number of descriptors reclaimed.
	fn reclaim(&mut self, max: u16, done: &mut Vec<Packet>) -> u16 {
		let completed = self.eq.completed();
		let mut reclaimed = 0;
		while reclaimed < completed.min(max) {
			let sd = &mut self.sdesc[usize::from(self.eq.cidx())];
			let ndesc = sd.desc_used;
			if ndesc == 0 {
				warn!("eq {}: completion without a work request", self.eq.cntxt_id());
				break;
			}
			if reclaimed + ndesc > completed {
				break;
			}
			let sd = core::mem::take(sd);
			self.res.release(sd.txb_used, sd.bindings);
			done.extend(sd.packets);
			self.eq.retire(ndesc);
			reclaimed += ndesc;
		}
		reclaimed
	}

	/// `EQUEQ | EQUIQ` if a work request of `ndesc` descriptors should ask
	/// for an update.
	fn update_flags(&mut self, ndesc: u16) -> u32 {
		if self.eq.avail().saturating_sub(ndesc) < self.update_lowat
			&& !self.flags.contains(EqFlags::UPDATE_PENDING)
		{
			self.flags.insert(EqFlags::UPDATE_PENDING);
			F_FW_WR_EQUEQ | F_FW_WR_EQUIQ
		} else {
			0
		}
	}

	fn commit(&mut self, range: SlotRange, sd: TxSdesc) {
		debug_assert_eq!(self.sdesc[usize::from(range.start)].desc_used, 0);
		self.sdesc[usize::from(range.start)] = sd;
	}

	fn ring_doorbell(&mut self, hw: &dyn SgeHw, batched: bool) {
		let rang = if batched {
			self.eq.ring_doorbell_batched(hw)
		} else {
			self.eq.ring_doorbell(hw)
		};
		self.stats.doorbells += u64::from(rang);
	}

	/// Adds `pkt` to the open batch, closing the batch and starting another
	/// one if it is full.
	fn add_to_batch(
		&mut self,
		hw: &dyn SgeHw,
		pkt: Packet,
		txinfo: TxInfo,
	) -> Result<(), (Packet, TxInfo)> {
		match self
			.batch
			.try_add(&mut self.eq, self.ctrl0, self.iqid, pkt, txinfo)
		{
			Err((pkt, txinfo)) if self.batch.is_open() => {
				self.close_batch(hw);
				self.batch
					.try_add(&mut self.eq, self.ctrl0, self.iqid, pkt, txinfo)
			}
			res => res,
		}
	}

	fn close_batch(&mut self, hw: &dyn SgeHw) {
		if !self.batch.is_open() {
			return;
		}
		let npkt = self.batch.npkt();
		let flags = self.update_flags(self.batch.ndesc());
		match self.batch.close(&mut self.eq, flags) {
			Ok((range, sd)) => {
				trace!("eq {}: {npkt} packets in one work request", self.eq.cntxt_id());
				self.stats.txpkts_wrs += 1;
				self.commit(range, sd);
				self.ring_doorbell(hw, true);
			}
			Err(sd) => {
				error!("eq {}: lost the room of a coalesced work request", self.eq.cntxt_id());
				if flags != 0 {
					self.flags.remove(EqFlags::UPDATE_PENDING);
				}
				self.stats.drops += u64::from(npkt);
				self.res.release(sd.txb_used, sd.bindings);
			}
		}
	}

	/// Writes a `fw_eth_tx_pkt_wr` for `pkt`.
	fn write_txpkt(&mut self, pkt: Packet, mut txinfo: TxInfo) -> Result<(), (Packet, TxInfo)> {
		let lso_flits = match &txinfo.lso {
			Some(plan) if plan.tunnel.is_some() => 2 * CPL_FLITS,
			Some(_) => CPL_FLITS,
			None => 0,
		};
		let body = if txinfo.imm {
			txinfo.len.div_ceil(8)
		} else {
			txinfo.nflits()
		};
		let nflits = TXPKT_WR_HDR_FLITS + lso_flits + CPL_FLITS + body;
		debug_assert!(nflits <= SGE_MAX_WR_FLITS);
		let ndesc = nflits.div_ceil(EQ_ESIZE_FLITS) as u16;
		let Ok(range) = self.eq.reserve(ndesc) else {
			return Err((pkt, txinfo));
		};
		let flags = self.update_flags(0);

		let mut immdlen = (lso_flits + CPL_FLITS) * 8;
		if txinfo.imm {
			immdlen += txinfo.len;
		}
		let mut w = self.eq.writer(range.start);
		w.put(&FwEthTxPktWr {
			op_immdlen: U32::new(fw_wr_op(FwWrOpcode::EthTxPkt) | fw_wr_immdlen(immdlen)),
			equiq_to_len16: U32::new(fw_wr_len16(nflits) | flags),
			r3: U64::new(0),
		});
		if let Some(plan) = &txinfo.lso {
			if let Some(tunnel) = &plan.tunnel {
				w.put(&offload::tnl_lso_cpl(tunnel));
			}
			w.put(&offload::lso_cpl(plan, txinfo.req.mss, txinfo.len));
		}
		w.put(&CplTxPktCore {
			ctrl0: U32::new(self.ctrl0),
			pack: U16::new(0),
			len: U16::new(txinfo.len as u16),
			ctrl1: U64::new(txinfo.ctrl1),
		});
		if txinfo.imm {
			let mut data = [0u8; IMM_MAX];
			let n = pkt.copy_prefix(&mut data);
			w.put_bytes(&data[..n]);
		} else {
			let mut list = [0u8; SGL_MAX_BYTES];
			let n = sgl::encode(&txinfo.segs, &mut list);
			w.put_bytes(&list[..n]);
		}
		w.pad_to_even();

		let sd = TxSdesc::single(pkt, &mut txinfo, ndesc);
		self.commit(range, sd);
		Ok(())
	}

	/// Asks the device for an egress update with an otherwise empty work
	/// request unless one is already on its way.
	fn request_update(&mut self, hw: &dyn SgeHw) {
		if self.flags.contains(EqFlags::UPDATE_PENDING) {
			return;
		}
		let Ok(range) = self.eq.reserve(1) else {
			// Everything is in flight and one of those asked for an update.
			return;
		};
		self.flags.insert(EqFlags::UPDATE_PENDING);
		let mut w = self.eq.writer(range.start);
		w.put(&FwEqFlushWr {
			opcode: FwWrOpcode::EqFlush.into(),
			r1: [0; 3],
			equiq_to_len16: U32::new(F_FW_WR_EQUEQ | F_FW_WR_EQUIQ | fw_wr_len16(2)),
			r3: U64::new(0),
		});
		self.commit(
			range,
			TxSdesc {
				desc_used: 1,
				..TxSdesc::default()
			},
		);
		self.stats.flush_wrs += 1;
		self.ring_doorbell(hw, false);
	}

	/// Stops the queue until an egress update makes room.
	fn cork(&mut self, hw: &dyn SgeHw) {
		self.close_batch(hw);
		if !self.flags.contains(EqFlags::CORKED) {
			self.flags.insert(EqFlags::CORKED);
			self.stats.corked += 1;
		}
		self.ring_doorbell(hw, false);
		self.request_update(hw);
	}

	/// Takes everything still held by the ring, written or not.
	fn drain(&mut self, done: &mut Vec<Packet>) {
		if self.batch.is_open() {
			let sd = core::mem::take(&mut self.batch).into_sdesc();
			self.res.release(sd.txb_used, sd.bindings);
			done.extend(sd.packets);
		}
		for sd in self.sdesc.iter_mut() {
			let sd = core::mem::take(sd);
			self.res.release(sd.txb_used, sd.bindings);
			done.extend(sd.packets);
		}
	}
}

impl Drop for TxqInner {
	fn drop(&mut self) {
		let mut done = Vec::new();
		self.drain(&mut done);
	}
}

/// An Ethernet transmit queue.
pub struct TxQueue {
	index: u16,
	cntxt_id: u16,
	paddr: u64,
	qsize: u16,
	pub(crate) inner: SpinMutex<TxqInner>,
}

impl TxQueue {
	pub(crate) fn new(
		dma: Arc<dyn DmaAllocator>,
		mapper: Arc<dyn DmaMapper>,
		index: u16,
		cfg: &EqConfig,
		params: &SgeParams,
	) -> Result<Self, SgeError> {
		if cfg.qsize < 2 {
			return Err(SgeError::Geometry("egress queue needs at least two descriptors"));
		}
		let eq = EqRing::new(dma.clone(), cfg.qsize)?;
		let txb = CopyBuf::new(dma, params.txb_size)?;
		let sdesc = (0..cfg.qsize).map(|_| TxSdesc::default()).collect();
		let ctrl0 = (u32::from(u8::from(CplOpcode::TxPktXt)) << S_TXPKT_OPCODE)
			| (u32::from(cfg.tx_chan) << S_TXPKT_INTF)
			| (u32::from(params.pf) << S_TXPKT_PF);

		Ok(Self {
			index,
			cntxt_id: 0,
			paddr: eq.paddr(),
			qsize: cfg.qsize,
			inner: SpinMutex::new(TxqInner {
				eq,
				sdesc,
				res: TxResources::new(txb, mapper, params),
				batch: TxPkts::default(),
				flags: EqFlags::empty(),
				ctrl0,
				iqid: cfg.iqid,
				coalesce: params.tx_coalesce,
				update_lowat: params.eq_update_lowat,
				stats: TxqStats::default(),
			}),
		})
	}

	pub(crate) fn setup(&self, cfg: &EqConfig) -> EqSetup {
		EqSetup {
			paddr: self.paddr,
			qsize: self.qsize + EQ_SPG_DESCS,
			iqid: cfg.iqid,
			tx_chan: cfg.tx_chan,
		}
	}

	pub(crate) fn set_cntxt_id(&mut self, cntxt_id: u16) {
		self.cntxt_id = cntxt_id;
		self.inner.get_mut().eq.set_cntxt_id(cntxt_id);
	}

	pub(crate) fn lock(&self) -> impl DerefMut<Target = TxqInner> + '_ {
		self.inner.lock()
	}

	/// Upper-layer transmit queue this one serves.
	pub fn index(&self) -> u16 {
		self.index
	}

	pub fn cntxt_id(&self) -> u16 {
		self.cntxt_id
	}

	/// Descriptors, the status page excluded.
	pub fn qsize(&self) -> u16 {
		self.qsize
	}

	pub fn ring_paddr(&self) -> u64 {
		self.paddr
	}

	/// Bus address of the status page the device reports progress in.
	pub fn status_paddr(&self) -> u64 {
		self.paddr + (usize::from(self.qsize) * EQ_ESIZE) as u64
	}

	pub fn stats(&self) -> TxqStats {
		self.lock().stats
	}

	/// Free descriptors.
	pub fn avail(&self) -> u16 {
		self.lock().eq.avail()
	}

	pub fn is_corked(&self) -> bool {
		self.lock().flags.contains(EqFlags::CORKED)
	}

	pub fn dhdl_avail(&self) -> u32 {
		self.lock().res.dhdl_avail()
	}

	pub fn txb_avail(&self) -> u32 {
		self.lock().res.txb.avail()
	}

	/// Stops the queue and returns every packet it still holds.
	pub(crate) fn disable(&self) -> Vec<Packet> {
		let mut done = Vec::new();
		let mut q = self.lock();
		q.flags.insert(EqFlags::DISABLED);
		q.drain(&mut done);
		done
	}
}

impl Sge {
	/// Hands `pkts` to the device in order.
	///
	/// Returns the packets that were not consumed because the queue ran out
	/// of descriptors or transmit resources. The queue is then corked and
	/// [`SgeHandler::tx_resume`](super::SgeHandler::tx_resume) is called
	/// once it has room again. Packets that can never be sent are dropped
	/// and counted.
	pub fn transmit(&self, txq: &TxQueue, mut pkts: VecDeque<Packet>) -> Option<VecDeque<Packet>> {
		let hw = &*self.hw;
		let mut done = Vec::new();
		let mut q = txq.lock();

		if q.flags.contains(EqFlags::DISABLED) {
			return (!pkts.is_empty()).then_some(pkts);
		}
		q.reclaim(TX_RECLAIM_MAX, &mut done);
		if q.flags.contains(EqFlags::CORKED) {
			return (!pkts.is_empty()).then_some(pkts);
		}

		while let Some(mut pkt) = pkts.pop_front() {
			let coalescing = q.coalesce && (q.batch.is_open() || !pkts.is_empty());
			let txinfo = match q.res.build(&mut pkt, coalescing) {
				Ok(txinfo) => txinfo,
				Err(TxError::Retryable(what)) => {
					debug!("eq {}: out of {what:?}", txq.cntxt_id);
					q.stats.note_exhausted(what);
					pkts.push_front(pkt);
					q.cork(hw);
					break;
				}
				Err(err) => {
					debug!("eq {}: dropping a {}-byte packet: {err}", txq.cntxt_id, pkt.len());
					q.stats.drops += 1;
					done.push(pkt);
					continue;
				}
			};

			let sent = txinfo.summary();
			let (pkt, txinfo) = if coalescing && !txinfo.is_lso() {
				match q.add_to_batch(hw, pkt, txinfo) {
					Ok(()) => {
						q.stats.record(&sent, true);
						continue;
					}
					Err(rejected) => rejected,
				}
			} else {
				(pkt, txinfo)
			};

			q.close_batch(hw);
			let res = match q.write_txpkt(pkt, txinfo) {
				Err((pkt, txinfo)) => {
					// Make room from whatever finished meanwhile and try once more.
					q.reclaim(u16::MAX, &mut done);
					q.write_txpkt(pkt, txinfo)
				}
				ok => ok,
			};
			match res {
				Ok(()) => {
					q.stats.record(&sent, false);
					q.ring_doorbell(hw, true);
				}
				Err((pkt, mut txinfo)) => {
					q.res.unwind(&mut txinfo);
					q.stats.note_exhausted(Exhausted::Credits);
					pkts.push_front(pkt);
					q.cork(hw);
					break;
				}
			}
		}

		q.close_batch(hw);
		q.ring_doorbell(hw, false);
		drop(q);
		drop(done);
		(!pkts.is_empty()).then_some(pkts)
	}

	/// Processes an egress update for `txq`: reclaims what the device has
	/// finished with and resumes the queue if it was corked and has room.
	pub(crate) fn egress_update(&self, txq: &Arc<TxQueue>) {
		let hw = &*self.hw;
		let mut done = Vec::new();
		let resume = {
			let mut q = txq.lock();
			q.stats.egr_updates += 1;
			q.flags.remove(EqFlags::UPDATE_PENDING);
			q.reclaim(u16::MAX, &mut done);

			if !q.flags.contains(EqFlags::CORKED) || q.flags.contains(EqFlags::DISABLED) {
				false
			} else if q.eq.avail() > q.update_lowat || q.eq.in_flight() + q.eq.pending() == 0 {
				q.flags.remove(EqFlags::CORKED);
				true
			} else {
				q.request_update(hw);
				false
			}
		};
		drop(done);

		if resume {
			trace!("eq {}: resuming", txq.cntxt_id);
			self.handler.tx_resume(txq.index);
		}
	}

	/// Reclaims completed descriptors of `txq` without waiting for an
	/// egress update. Returns the number of descriptors reclaimed.
	pub fn tx_reclaim(&self, txq: &TxQueue) -> u16 {
		let mut done = Vec::new();
		let n = txq.lock().reclaim(u16::MAX, &mut done);
		drop(done);
		n
	}
}
