//! Hardware constants and the tunables of the data path.

use alloc::string::String;
use core::str::FromStr;

use thiserror::Error;

/// Size of an ingress queue entry in bytes.
pub const IQ_ESIZE: usize = 64;

/// Size of an egress queue descriptor in bytes.
pub const EQ_ESIZE: usize = 64;

/// An egress descriptor is made of eight 64-bit flits.
pub const EQ_ESIZE_FLITS: u32 = (EQ_ESIZE / 8) as u32;

/// Number of egress descriptors reserved for the status page at the end of
/// the ring.
pub const EQ_SPG_DESCS: u16 = 1;

/// Buffer pointers per free-list hardware descriptor. Doorbells are rung in
/// units of this many pointers.
pub const FL_PTRS_PER_DESC: u16 = 8;

/// Largest work request the egress engine accepts, in flits (512 bytes).
pub const SGE_MAX_WR_FLITS: u32 = 64;

/// Upper bound on scatter-gather segments in a single work request.
pub const TX_SGL_SEGS: usize = 36;

/// `fw_eth_tx_pkt_wr` header.
pub(crate) const TXPKT_WR_HDR_FLITS: u32 = 2;

/// `fw_eth_tx_pkts_wr` header.
pub(crate) const TXPKTS_WR_HDR_FLITS: u32 = 2;

/// `ulp_txpkt` + `ulptx_idata` + `cpl_tx_pkt_core` in front of every packet
/// of a coalesced work request.
pub(crate) const TXPKTS_PKT_HDR_FLITS: u32 = 4;

/// `cpl_tx_pkt_core` or `cpl_tx_pkt_lso_core`.
pub(crate) const CPL_FLITS: u32 = 2;

/// Payload-length limit of a coalesced work request.
pub(crate) const TXPKTS_MAX_PLEN: u32 = 0xffff;

/// Packets are never coalesced beyond this count.
pub(crate) const TXPKTS_MAX_NPKT: u8 = u8::MAX;

/// Credits are returned to the ingress queue at least this often while a
/// long batch of responses is being processed.
pub(crate) const IQ_CIDX_UPDATE: u16 = 32;

/// Descriptors reclaimed opportunistically at the start of a transmit call.
pub(crate) const TX_RECLAIM_MAX: u16 = 32;

/// Depth of the deferred-forwarding list of a single interrupt pass.
pub(crate) const FWD_RETRY_DEPTH: usize = 16;

/// Bytes of a transmit packet inspected for offload decisions.
pub(crate) const TX_HDR_PREFIX: usize = 128;

/// Granularity of the identity DMA mapper.
pub const PAGE_SIZE: usize = 4096;

/// Ring memory alignment.
pub(crate) const RING_ALIGN: usize = PAGE_SIZE;

/// Chip generation. Some `ctrl1` fields moved between generations and only
/// T6 can checksum the inner headers of tunnelled traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChipVersion {
	T4,
	T5,
	T6,
}

impl ChipVersion {
	pub fn supports_tunnel_offload(self) -> bool {
		self >= Self::T6
	}
}

impl FromStr for ChipVersion {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"t4" | "T4" => Ok(Self::T4),
			"t5" | "T5" => Ok(Self::T5),
			"t6" | "T6" => Ok(Self::T6),
			_ => Err(()),
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
	#[error("malformed parameter string")]
	Syntax,
	#[error("malformed value for `{0}`")]
	Value(String),
	#[error("`{0}` is out of range")]
	Invalid(&'static str),
}

/// Tunables of the data path.
///
/// Defaults are taken from `SGE_*` variables at build time and may be
/// overridden per adapter with [`SgeParams::parse`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SgeParams {
	pub chip: ChipVersion,
	/// Physical function used in `cpl_tx_pkt` control words.
	pub pf: u8,
	/// Padding the hardware inserts in front of every received frame.
	pub fl_pktshift: u8,
	/// Pack several frames into one free-list buffer.
	pub fl_pack: bool,
	/// Alignment of frame starts within a packed buffer.
	pub fl_pack_boundary: u32,
	/// Refilled pointers accumulate until at least this many are pending.
	pub fl_db_batch: u16,
	/// The service loop tops up a free list once this many buffers are
	/// needed.
	pub fl_refill_batch: u32,
	/// Received frames shorter than this are copied out of the free-list
	/// buffer.
	pub rx_copy_threshold: u32,
	/// Frames up to this length are carried inside the work request.
	pub tx_imm_max: u32,
	/// Frames and fragments up to this length are copied into the transmit
	/// copy buffer instead of being DMA-mapped.
	pub tx_copy_threshold: u32,
	pub tx_coalesce: bool,
	/// Size of the per-queue transmit copy buffer.
	pub txb_size: u32,
	/// DMA handles available per transmit queue.
	pub tx_dhdl: u32,
	/// Work requests ask for an egress update once free descriptors drop
	/// below this.
	pub eq_update_lowat: u16,
	/// Descriptors a forwarded queue may consume per pass.
	pub fwd_budget: u32,
	pub starve_period_ms: u32,
	/// Buffers the starvation timer posts to a free list per tick.
	pub starve_refill: u32,
}

impl Default for SgeParams {
	fn default() -> Self {
		Self {
			chip: sge_var_or!("SGE_CHIP", ChipVersion::T5),
			pf: sge_var_or!("SGE_PF", 0),
			fl_pktshift: sge_var_or!("SGE_FL_PKTSHIFT", 2),
			fl_pack: sge_var_or!("SGE_FL_PACK", true),
			fl_pack_boundary: sge_var_or!("SGE_FL_PACK_BOUNDARY", 64),
			fl_db_batch: sge_var_or!("SGE_FL_DB_BATCH", 8),
			fl_refill_batch: sge_var_or!("SGE_FL_REFILL_BATCH", 32),
			rx_copy_threshold: sge_var_or!("SGE_RX_COPY_THRESHOLD", 256),
			tx_imm_max: sge_var_or!("SGE_TX_IMM_MAX", 128),
			tx_copy_threshold: sge_var_or!("SGE_TX_COPY_THRESHOLD", 256),
			tx_coalesce: sge_var_or!("SGE_TX_COALESCE", true),
			txb_size: sge_var_or!("SGE_TXB_SIZE", 32 * 1024),
			tx_dhdl: sge_var_or!("SGE_TX_DHDL", 256),
			eq_update_lowat: sge_var_or!("SGE_EQ_UPDATE_LOWAT", 16),
			fwd_budget: sge_var_or!("SGE_FWD_BUDGET", 64),
			starve_period_ms: sge_var_or!("SGE_STARVE_PERIOD_MS", 200),
			starve_refill: sge_var_or!("SGE_STARVE_REFILL", 64),
		}
	}
}

impl SgeParams {
	/// Applies `key=value` overrides from a command line to the defaults.
	///
	/// Tokens are split like a shell would split them. Unknown keys are
	/// reported and skipped.
	pub fn parse(cmdline: &str) -> Result<Self, ParamError> {
		let mut params = Self::default();
		let tokens = shell_words::split(cmdline).map_err(|_| ParamError::Syntax)?;
		debug!("Got SGE parameter tokens as {tokens:?}");

		for token in tokens {
			let Some((key, value)) = token.split_once('=') else {
				warn!("Ignoring SGE parameter without value: {token}");
				continue;
			};
			params.set(key, value)?;
		}

		params.validate()?;
		Ok(params)
	}

	fn set(&mut self, key: &str, value: &str) -> Result<(), ParamError> {
		fn val<T: FromStr>(key: &str, value: &str) -> Result<T, ParamError> {
			value.parse().map_err(|_| ParamError::Value(key.into()))
		}

		match key {
			"chip" => self.chip = val(key, value)?,
			"pf" => self.pf = val(key, value)?,
			"fl_pktshift" => self.fl_pktshift = val(key, value)?,
			"fl_pack" => self.fl_pack = val(key, value)?,
			"fl_pack_boundary" => self.fl_pack_boundary = val(key, value)?,
			"fl_db_batch" => self.fl_db_batch = val(key, value)?,
			"fl_refill_batch" => self.fl_refill_batch = val(key, value)?,
			"rx_copy_threshold" => self.rx_copy_threshold = val(key, value)?,
			"tx_imm_max" => self.tx_imm_max = val(key, value)?,
			"tx_copy_threshold" => self.tx_copy_threshold = val(key, value)?,
			"tx_coalesce" => self.tx_coalesce = val(key, value)?,
			"txb_size" => self.txb_size = val(key, value)?,
			"tx_dhdl" => self.tx_dhdl = val(key, value)?,
			"eq_update_lowat" => self.eq_update_lowat = val(key, value)?,
			"fwd_budget" => self.fwd_budget = val(key, value)?,
			"starve_period_ms" => self.starve_period_ms = val(key, value)?,
			"starve_refill" => self.starve_refill = val(key, value)?,
			_ => warn!("Unknown SGE parameter: {key}={value}"),
		}
		Ok(())
	}

	pub fn validate(&self) -> Result<(), ParamError> {
		ensure_param!(self.fl_pktshift <= 7, "fl_pktshift");
		ensure_param!(
			self.fl_pack_boundary.is_power_of_two() && (16..=4096).contains(&self.fl_pack_boundary),
			"fl_pack_boundary"
		);
		ensure_param!(
			self.fl_db_batch > 0 && self.fl_db_batch % FL_PTRS_PER_DESC == 0,
			"fl_db_batch"
		);
		ensure_param!(self.fl_refill_batch > 0, "fl_refill_batch");
		// The immediate length field of a work request is eight bits wide and
		// also covers two CPL headers.
		ensure_param!(self.tx_imm_max <= 0xff - 32, "tx_imm_max");
		ensure_param!(
			self.txb_size >= self.tx_copy_threshold.next_multiple_of(8),
			"txb_size"
		);
		ensure_param!(self.eq_update_lowat > 0, "eq_update_lowat");
		ensure_param!(self.fwd_budget > 0, "fwd_budget");
		ensure_param!(self.starve_refill > 0, "starve_refill");
		Ok(())
	}
}

/// Parses `val` if present, falling back to `default`.
pub(crate) fn parse_or<T: FromStr>(val: Option<&str>, default: T) -> T {
	match val.map(str::parse) {
		Some(Ok(v)) => v,
		Some(Err(_)) => {
			warn!("Ignoring malformed build-time SGE parameter");
			default
		}
		None => default,
	}
}
