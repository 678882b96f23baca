//! Coalescing of several packets into one `fw_eth_tx_pkts_wr`.
//!
//! Packets are written into the ring behind a not yet reserved header as
//! they arrive. Closing the batch writes the header in front of them and
//! takes the descriptors.

use core::mem::size_of;

use smallvec::smallvec;
use zerocopy::big_endian::{U16, U32, U64};

use super::eq::{EqRing, SlotRange};
use super::msg::{
	CplTxPktCore, FwEthTxPktsWr, FwWrOpcode, S_ULP_TXPKT_FID, S_ULPTX_CMD, ULP_TX_PKT,
	ULP_TX_SC_IMM, UlpTxPkt, UlptxIdata, fw_wr_len16, fw_wr_op,
};
use super::sgl::{self, SGL_MAX_BYTES};
use super::txinfo::TxInfo;
use super::txq::TxSdesc;
use crate::config::{
	EQ_ESIZE_FLITS, SGE_MAX_WR_FLITS, TXPKTS_MAX_NPKT, TXPKTS_MAX_PLEN, TXPKTS_PKT_HDR_FLITS,
	TXPKTS_WR_HDR_FLITS,
};
use crate::net::Packet;

/// An open coalesced work request.
#[derive(Default)]
pub(crate) struct TxPkts {
	npkt: u8,
	/// Flits written so far, header included.
	nflits: u32,
	plen: u32,
	/// Descriptor the work request starts at.
	start: u16,
	sd: TxSdesc,
}

impl TxPkts {
	pub fn is_open(&self) -> bool {
		self.npkt > 0
	}

	pub fn npkt(&self) -> u8 {
		self.npkt
	}

	#[cfg(test)]
	pub fn plen(&self) -> u32 {
		self.plen
	}

	/// Descriptors the batch takes once closed.
	pub fn ndesc(&self) -> u16 {
		self.nflits.div_ceil(EQ_ESIZE_FLITS) as u16
	}

	/// Gives up the batch without writing its header.
	pub fn into_sdesc(self) -> TxSdesc {
		self.sd
	}

	/// Flits a packet adds to the batch.
	fn pkt_flits(txinfo: &TxInfo) -> u32 {
		TXPKTS_PKT_HDR_FLITS + txinfo.nflits().next_multiple_of(2)
	}

	/// Appends `pkt` to the batch, opening one if needed. The packet is
	/// handed back if it does not fit.
	pub fn try_add(
		&mut self,
		eq: &mut EqRing,
		ctrl0: u32,
		fid: u16,
		pkt: Packet,
		mut txinfo: TxInfo,
	) -> Result<(), (Packet, TxInfo)> {
		if txinfo.is_lso() || txinfo.imm || txinfo.nsegs() == 0 {
			return Err((pkt, txinfo));
		}

		let pkt_flits = Self::pkt_flits(&txinfo);
		let (offset, plen) = if self.is_open() {
			(self.nflits, self.plen)
		} else {
			(TXPKTS_WR_HDR_FLITS, 0)
		};
		let nflits = offset + pkt_flits;
		let plen = plen + txinfo.len;
		if self.npkt == TXPKTS_MAX_NPKT
			|| nflits > SGE_MAX_WR_FLITS
			|| nflits.div_ceil(EQ_ESIZE_FLITS) > u32::from(eq.avail())
			|| plen > TXPKTS_MAX_PLEN
		{
			return Err((pkt, txinfo));
		}

		if !self.is_open() {
			self.start = eq.pidx();
		}
		let mut w = eq.writer_at(self.start, offset);
		w.put(&UlpTxPkt {
			cmd_dest: U32::new((ULP_TX_PKT << S_ULPTX_CMD) | (u32::from(fid) << S_ULP_TXPKT_FID)),
			len: U32::new(pkt_flits / 2),
		});
		w.put(&UlptxIdata {
			cmd_more: U32::new(ULP_TX_SC_IMM << S_ULPTX_CMD),
			len: U32::new(size_of::<CplTxPktCore>() as u32),
		});
		w.put(&CplTxPktCore {
			ctrl0: U32::new(ctrl0),
			pack: U16::new(0),
			len: U16::new(txinfo.len as u16),
			ctrl1: U64::new(txinfo.ctrl1),
		});
		let mut list = [0u8; SGL_MAX_BYTES];
		let n = sgl::encode(&txinfo.segs, &mut list);
		w.put_bytes(&list[..n]);
		w.pad_to_even();
		debug_assert_eq!(w.written(), pkt_flits);

		self.npkt += 1;
		self.nflits = nflits;
		self.plen = plen;
		self.sd.packets.push(pkt);
		self.sd.txb_used += txinfo.txb_used;
		self.sd.bindings.extend(txinfo.bindings.drain(..));
		Ok(())
	}

	/// Writes the header and takes the descriptors of the batch.
	///
	/// `flags` are or-ed into the length word. Returns the slot to record
	/// in the shadow ring, or the packets if the ring lost the room it had
	/// when they were added.
	pub fn close(&mut self, eq: &mut EqRing, flags: u32) -> Result<(SlotRange, TxSdesc), TxSdesc> {
		debug_assert!(self.is_open());
		let batch = core::mem::take(self);
		let ndesc = batch.ndesc();
		debug_assert_eq!(batch.start, eq.pidx());
		let Ok(range) = eq.reserve(ndesc) else {
			return Err(batch.sd);
		};

		let mut w = eq.writer(range.start);
		w.put(&FwEthTxPktsWr {
			op_pkd: U32::new(fw_wr_op(FwWrOpcode::EthTxPkts)),
			equiq_to_len16: U32::new(fw_wr_len16(batch.nflits) | flags),
			r3: U32::new(0),
			plen: U16::new(batch.plen as u16),
			npkt: batch.npkt,
			kind: 0,
		});

		let mut sd = batch.sd;
		sd.desc_used = ndesc;
		Ok((range, sd))
	}
}

impl TxSdesc {
	pub(crate) fn single(pkt: Packet, txinfo: &mut TxInfo, desc_used: u16) -> Self {
		Self {
			packets: smallvec![pkt],
			desc_used,
			txb_used: txinfo.txb_used,
			bindings: txinfo.bindings.drain(..).collect(),
		}
	}
}
