//! Per-attempt transmit resources.
//!
//! [`TxResources::build`] turns a packet into either immediate data or a
//! scatter-gather list backed by the copy buffer and bound DMA handles.
//! Whatever an attempt acquired is either committed to a descriptor slot
//! together with the packet or handed back with [`TxResources::unwind`].

use alloc::sync::Arc;

use smallvec::SmallVec;

use super::error::{Exhausted, TxError};
use super::msg::{F_TXPKT_VLAN_VLD, S_TXPKT_VLAN};
use super::offload::{self, CsumOutcome, LsoPlan, PacketHeaders};
use super::sgl;
use super::txb::{CopyBuf, TxbMark};
use crate::config::{ChipVersion, SgeParams, TX_HDR_PREFIX, TX_SGL_SEGS};
use crate::mm::{DmaBinding, DmaMapper, DmaSeg};
use crate::net::{Packet, TxOffloads, TxRequest};

pub(crate) struct TxInfo {
	pub len: u32,
	pub req: TxRequest,
	pub hdrs: Option<PacketHeaders>,
	pub lso: Option<LsoPlan>,
	/// LSO was asked for but the packet cannot be segmented.
	pub lso_failed: bool,
	/// Sent inline in the work request.
	pub imm: bool,
	pub pulled_up: bool,
	pub segs: SmallVec<[DmaSeg; 8]>,
	pub bindings: SmallVec<[DmaBinding; 2]>,
	/// Copy-buffer bytes charged, wrap-around waste included.
	pub txb_used: u32,
	pub ctrl1: u64,
	pub csum: CsumOutcome,
	mark: Option<TxbMark>,
}

impl TxInfo {
	/// Inspects `pkt`'s headers and offload requests.
	pub fn new(pkt: &Packet, chip: ChipVersion) -> Self {
		let mut prefix = [0u8; TX_HDR_PREFIX];
		let n = pkt.copy_prefix(&mut prefix);
		let req = pkt.tx;
		let hdrs = offload::parse(&prefix[..n]);
		let wants_lso = req.offloads.contains(TxOffloads::LSO);
		let lso = if wants_lso && req.mss > 0 {
			offload::plan_lso(hdrs.as_ref(), chip)
		} else {
			None
		};

		Self {
			len: pkt.len() as u32,
			req,
			hdrs,
			lso,
			lso_failed: wants_lso && lso.is_none(),
			imm: false,
			pulled_up: false,
			segs: SmallVec::new(),
			bindings: SmallVec::new(),
			txb_used: 0,
			ctrl1: 0,
			csum: CsumOutcome::Ignored,
			mark: None,
		}
	}

	pub fn nsegs(&self) -> usize {
		self.segs.len()
	}

	/// Flits of the scatter-gather list.
	pub fn nflits(&self) -> u32 {
		sgl::nflits(self.segs.len())
	}

	pub fn is_lso(&self) -> bool {
		self.lso.is_some()
	}

	pub fn summary(&self) -> TxSummary {
		TxSummary {
			len: self.len,
			csum: self.csum,
			imm: self.imm,
			bound: !self.bindings.is_empty(),
			pulled_up: self.pulled_up,
			lso: self.is_lso(),
		}
	}
}

/// What a committed packet adds to the queue counters.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TxSummary {
	pub len: u32,
	pub csum: CsumOutcome,
	pub imm: bool,
	pub bound: bool,
	pub pulled_up: bool,
	pub lso: bool,
}

/// Adds `seg` to an SGL, merging it into the previous segment if the two
/// are adjacent.
fn push_seg(segs: &mut SmallVec<[DmaSeg; 8]>, seg: DmaSeg) -> Result<(), TxError> {
	if let Some(last) = segs.last_mut()
		&& last.addr + u64::from(last.len) == seg.addr
		&& let Some(len) = last.len.checked_add(seg.len)
	{
		last.len = len;
		return Ok(());
	}
	if segs.len() == TX_SGL_SEGS {
		return Err(TxError::Permanent);
	}
	segs.push(seg);
	Ok(())
}

/// Copy buffer and DMA handles of one transmit queue.
pub(crate) struct TxResources {
	pub txb: CopyBuf,
	mapper: Arc<dyn DmaMapper>,
	dhdl_avail: u32,
	dhdl_total: u32,
	imm_max: u32,
	copy_threshold: u32,
	chip: ChipVersion,
}

impl TxResources {
	pub fn new(txb: CopyBuf, mapper: Arc<dyn DmaMapper>, params: &SgeParams) -> Self {
		Self {
			txb,
			mapper,
			dhdl_avail: params.tx_dhdl,
			dhdl_total: params.tx_dhdl,
			imm_max: params.tx_imm_max,
			copy_threshold: params.tx_copy_threshold,
			chip: params.chip,
		}
	}

	pub fn dhdl_avail(&self) -> u32 {
		self.dhdl_avail
	}

	/// Works out how `pkt` is handed to the device.
	///
	/// Packets that can be coalesced never go out as immediate data. A
	/// packet that needs too many segments is made contiguous once and
	/// tried again.
	pub fn build(&mut self, pkt: &mut Packet, coalescing: bool) -> Result<TxInfo, TxError> {
		// The CPL length field is 16 bits wide.
		if pkt.is_empty() || pkt.len() > usize::from(u16::MAX) {
			return Err(TxError::Permanent);
		}

		let mut txinfo = TxInfo::new(pkt, self.chip);
		(txinfo.ctrl1, txinfo.csum) = offload::decide(&txinfo, self.chip);
		if let Some(vlan) = txinfo.req.vlan {
			txinfo.ctrl1 |= F_TXPKT_VLAN_VLD | (u64::from(vlan) << S_TXPKT_VLAN);
		}
		if let Some(LsoPlan {
			tunnel: Some(tunnel),
			..
		}) = txinfo.lso
		{
			offload::fix_outer_ipv4_csum(pkt, &tunnel.outer)
				.map_err(|_| TxError::Retryable(Exhausted::Memory))?;
		}

		if !coalescing && !txinfo.is_lso() && txinfo.len <= self.imm_max {
			txinfo.imm = true;
			return Ok(txinfo);
		}

		match self.assemble(pkt, &mut txinfo) {
			Err(TxError::Permanent) => {
				trace!("Pulling up a {}-fragment packet", pkt.frags().len());
				pkt.pullup()
					.map_err(|_| TxError::Retryable(Exhausted::Memory))?;
				txinfo.pulled_up = true;
				self.assemble(pkt, &mut txinfo)?;
			}
			res => res?,
		}
		Ok(txinfo)
	}

	fn assemble(&mut self, pkt: &Packet, txinfo: &mut TxInfo) -> Result<(), TxError> {
		txinfo.mark = Some(self.txb.mark());
		let res = self.assemble_segs(pkt, txinfo);
		if res.is_err() {
			self.unwind(txinfo);
		}
		res
	}

	fn assemble_segs(&mut self, pkt: &Packet, txinfo: &mut TxInfo) -> Result<(), TxError> {
		if txinfo.len <= self.copy_threshold
			&& let Some((offset, charged)) = self.txb.alloc(txinfo.len)
		{
			let mut pos = offset;
			for frag in pkt.frags() {
				self.txb.write(pos, frag.as_bytes());
				pos += frag.len() as u32;
			}
			txinfo.txb_used += charged;
			return push_seg(
				&mut txinfo.segs,
				DmaSeg {
					addr: self.txb.paddr(offset),
					len: txinfo.len,
				},
			);
		}

		for frag in pkt.frags() {
			let bytes = frag.as_bytes();
			let len = bytes.len() as u32;
			if len <= self.copy_threshold
				&& let Some((offset, charged)) = self.txb.alloc(len)
			{
				self.txb.write(offset, bytes);
				txinfo.txb_used += charged;
				push_seg(
					&mut txinfo.segs,
					DmaSeg {
						addr: self.txb.paddr(offset),
						len,
					},
				)?;
				continue;
			}

			if self.dhdl_avail == 0 {
				return Err(TxError::Retryable(Exhausted::DmaHandles));
			}
			let binding = self.mapper.bind(bytes)?;
			self.dhdl_avail -= 1;
			let segs = binding.segs.clone();
			txinfo.bindings.push(binding);
			for seg in segs {
				push_seg(&mut txinfo.segs, seg)?;
			}
		}
		Ok(())
	}

	/// Returns everything `txinfo` acquired. Only valid for the most recent
	/// attempt.
	pub fn unwind(&mut self, txinfo: &mut TxInfo) {
		if let Some(mark) = txinfo.mark.take() {
			self.txb.rollback(mark);
		}
		self.release(0, txinfo.bindings.drain(..));
		txinfo.segs.clear();
		txinfo.txb_used = 0;
	}

	/// Returns the resources of completed work.
	pub fn release(&mut self, txb_used: u32, bindings: impl IntoIterator<Item = DmaBinding>) {
		self.txb.release(txb_used);
		for binding in bindings {
			self.mapper.unbind(binding);
			self.dhdl_avail += 1;
		}
		debug_assert!(self.dhdl_avail <= self.dhdl_total);
	}
}
