//! Queue counters. Every queue keeps its own under its lock; callers get
//! copies.

use super::error::Exhausted;
use super::offload::CsumOutcome;
use super::txinfo::TxSummary;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxqStats {
	pub rx_pkts: u64,
	pub rx_bytes: u64,
	/// Frames whose checksums the device verified.
	pub csum_ok: u64,
	pub vlan_ex: u64,
	/// Times draining stopped because a payload buffer was unavailable.
	pub nobuf: u64,
	pub fw_msgs: u64,
	pub unknown_rsp: u64,
	pub unknown_cpl: u64,
	pub forwarded: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlStats {
	pub allocated: u64,
	pub recycled: u64,
	pub alloc_failed: u64,
	pub doorbells: u64,
	pub copied: u64,
	pub zero_copy: u64,
	/// Times the list was put on the starving list.
	pub starving: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxqStats {
	pub tx_pkts: u64,
	pub tx_bytes: u64,
	pub imm_pkts: u64,
	pub txb_pkts: u64,
	pub dma_pkts: u64,
	pub txpkts_wrs: u64,
	pub txpkts_pkts: u64,
	pub pullups: u64,
	pub csum_applied: u64,
	pub csum_failed: u64,
	pub lso: u64,
	pub drops: u64,
	pub corked: u64,
	pub txb_full: u64,
	pub dhdl_full: u64,
	pub nomem: u64,
	pub credits_full: u64,
	pub flush_wrs: u64,
	pub egr_updates: u64,
	pub doorbells: u64,
}

impl TxqStats {
	pub(crate) fn record(&mut self, sent: &TxSummary, coalesced: bool) {
		self.tx_pkts += 1;
		self.tx_bytes += u64::from(sent.len);
		if sent.imm {
			self.imm_pkts += 1;
		} else if sent.bound {
			self.dma_pkts += 1;
		} else {
			self.txb_pkts += 1;
		}
		self.txpkts_pkts += u64::from(coalesced);
		self.pullups += u64::from(sent.pulled_up);
		self.lso += u64::from(sent.lso);
		match sent.csum {
			CsumOutcome::Applied => self.csum_applied += 1,
			CsumOutcome::Failed => self.csum_failed += 1,
			CsumOutcome::Ignored => {}
		}
	}

	pub(crate) fn note_exhausted(&mut self, what: Exhausted) {
		match what {
			Exhausted::CopyBuffer => self.txb_full += 1,
			Exhausted::DmaHandles => self.dhdl_full += 1,
			Exhausted::Memory => self.nomem += 1,
			Exhausted::Credits => self.credits_full += 1,
		}
	}
}
