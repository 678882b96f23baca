//! Descriptor, CPL message and work-request layouts.
//!
//! Everything the device reads or writes is big-endian.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// CPL opcodes the data path produces or consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CplOpcode {
	RxPkt = 0x3b,
	SgeEgrUpdate = 0xa5,
	Fw4Msg = 0xc0,
	Fw6Msg = 0xe0,
	TxTnlLso = 0xec,
	TxPktLso = 0xed,
	TxPktXt = 0xee,
}

/// Firmware work-request opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FwWrOpcode {
	EthTxPkt = 0x08,
	EthTxPkts = 0x09,
	EqFlush = 0x1b,
}

/// Kind of an ingress queue entry, from `type_gen`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RspType {
	/// Payload delivered through the free list.
	FlBuf = 0,
	/// CPL message carried entirely in the descriptor.
	Cpl = 1,
	/// Interrupt forwarded from another ingress queue.
	Intr = 2,
}

pub const S_RSPD_GEN: u8 = 7;
pub const F_RSPD_GEN: u8 = 1 << S_RSPD_GEN;
pub const S_RSPD_TYPE: u8 = 4;
pub const M_RSPD_TYPE: u8 = 0x3;

/// Payload starts in a fresh free-list buffer.
pub const F_RSPD_NEWBUF: u32 = 1 << 31;
pub const M_RSPD_LEN: u32 = 0x7fff_ffff;
pub const M_RSPD_QID: u32 = 0x7fff_ffff;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RssHeader {
	pub opcode: u8,
	pub flags: u8,
	pub qid: U16,
	pub hash_val: U32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct RspCtrl {
	pub hdrbuflen_pidx: U32,
	/// Payload length and NEWBUF for free-list responses, the forwarding
	/// queue for interrupt responses.
	pub pldbuflen_qid: U32,
	pub type_gen: u8,
	pub rsvd: [u8; 7],
}

impl RspCtrl {
	pub fn generation(&self) -> bool {
		self.type_gen & F_RSPD_GEN != 0
	}

	pub fn rsp_type(&self) -> u8 {
		(self.type_gen >> S_RSPD_TYPE) & M_RSPD_TYPE
	}

	pub fn type_gen(rsp_type: RspType, generation: bool) -> u8 {
		(u8::from(rsp_type) << S_RSPD_TYPE) | if generation { F_RSPD_GEN } else { 0 }
	}
}

/// Size of the CPL area between the RSS header and the response control.
pub const IQ_CPL_LEN: usize = 40;

/// One ingress queue entry.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IqDesc {
	pub rss: RssHeader,
	pub cpl: [u8; IQ_CPL_LEN],
	pub ctrl: RspCtrl,
}

pub const F_RXPKT_CSUM_CALC: u8 = 1 << 4;
pub const F_RXPKT_VLAN_EX: u8 = 1 << 6;
pub const F_RXPKT_IP_FRAG: u8 = 1 << 7;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CplRxPkt {
	pub opcode: u8,
	pub flags: u8,
	pub csum: U16,
	pub vlan: U16,
	pub len: U16,
	pub l2info: U32,
	pub hdr_len: U16,
	pub err_vec: U16,
}

pub const M_EGR_QID: u32 = 0x1ffff;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CplSgeEgrUpdate {
	pub opcode_qid: U32,
	pub cidx: U16,
	pub pidx: U16,
}

/// Layout shared by `cpl_fw4_msg` and `cpl_fw6_msg`.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CplFwMsg {
	pub opcode: u8,
	pub kind: u8,
	pub rsvd0: U16,
	pub rsvd1: U32,
	pub data: [U64; 4],
}

/// Egress status page, written by the device at the end of the ring.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct EqStatus {
	pub qid: U32,
	pub cidx: U16,
	pub pidx: U16,
	pub rsvd: [u8; 56],
}

/// Raw egress descriptor.
pub type EqDesc = [u8; 64];

pub const S_FW_WR_OP: u32 = 24;
pub const S_FW_WR_IMMDLEN: u32 = 0;
pub const M_FW_WR_IMMDLEN: u32 = 0xff;
pub const F_FW_WR_EQUIQ: u32 = 1 << 31;
pub const F_FW_WR_EQUEQ: u32 = 1 << 30;
pub const M_FW_WR_LEN16: u32 = 0xff;

pub fn fw_wr_op(op: FwWrOpcode) -> u32 {
	u32::from(u8::from(op)) << S_FW_WR_OP
}

pub fn fw_wr_immdlen(len: u32) -> u32 {
	(len & M_FW_WR_IMMDLEN) << S_FW_WR_IMMDLEN
}

/// Work request length in 16-byte units, from a length in flits.
pub fn fw_wr_len16(nflits: u32) -> u32 {
	nflits.div_ceil(2) & M_FW_WR_LEN16
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FwEthTxPktWr {
	pub op_immdlen: U32,
	pub equiq_to_len16: U32,
	pub r3: U64,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FwEthTxPktsWr {
	pub op_pkd: U32,
	pub equiq_to_len16: U32,
	pub r3: U32,
	pub plen: U16,
	pub npkt: u8,
	pub kind: u8,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FwEqFlushWr {
	pub opcode: u8,
	pub r1: [u8; 3],
	pub equiq_to_len16: U32,
	pub r3: U64,
}

pub const S_TXPKT_OPCODE: u32 = 24;
pub const S_TXPKT_INTF: u32 = 16;
pub const S_TXPKT_PF: u32 = 8;

pub const S_TXPKT_IPHDR_LEN: u64 = 0;
pub const M_TXPKT_IPHDR_LEN: u64 = 0x3ff;
pub const S_TXPKT_ETHHDR_LEN: u64 = 34;
pub const M_TXPKT_ETHHDR_LEN: u64 = 0x3f;
pub const S_T6_TXPKT_ETHHDR_LEN: u64 = 32;
pub const M_T6_TXPKT_ETHHDR_LEN: u64 = 0xff;
pub const S_TXPKT_CSUM_LOC: u64 = 30;
pub const M_TXPKT_CSUM_LOC: u64 = 0x3ff;
pub const S_TXPKT_CSUM_START: u64 = 20;
pub const M_TXPKT_CSUM_START: u64 = 0x3ff;
pub const S_TXPKT_CSUM_TYPE: u64 = 40;
pub const S_TXPKT_VLAN: u64 = 44;
pub const F_TXPKT_VLAN_VLD: u64 = 1 << 60;
pub const F_TXPKT_IPCSUM_DIS: u64 = 1 << 62;
pub const F_TXPKT_L4CSUM_DIS: u64 = 1 << 63;

/// Checksum types of `ctrl1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum TxCsumType {
	/// Generic: sum from `CSUM_START`, store at `CSUM_LOC`.
	Partial = 0,
	TcpIp = 8,
	UdpIp = 9,
	TcpIp6 = 10,
	UdpIp6 = 11,
	Ip = 12,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CplTxPktCore {
	pub ctrl0: U32,
	pub pack: U16,
	pub len: U16,
	pub ctrl1: U64,
}

pub const S_LSO_TCPHDR_LEN: u32 = 0;
pub const S_LSO_IPHDR_LEN: u32 = 4;
pub const S_LSO_ETHHDR_LEN: u32 = 16;
pub const F_LSO_IPV6: u32 = 1 << 20;
pub const F_LSO_LAST_SLICE: u32 = 1 << 22;
pub const F_LSO_FIRST_SLICE: u32 = 1 << 23;
pub const S_LSO_OPCODE: u32 = 24;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CplTxPktLsoCore {
	pub lso_ctrl: U32,
	pub ipid_ofst: U16,
	pub mss: U16,
	pub seqno_offset: U32,
	pub len: U32,
}

pub const S_TNL_LSO_OUT_IPHDR_LEN: u32 = 4;
pub const S_TNL_LSO_OUT_ETHHDR_LEN: u32 = 16;
pub const F_TNL_LSO_OUT_IPV6: u32 = 1 << 20;

/// Outer-header description of a tunnelled LSO request, followed by a
/// [`CplTxPktLsoCore`] for the inner headers.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct CplTxTnlLso {
	pub op_to_iphdr_len: U32,
	/// Bytes of UDP plus tunnel header between the outer IP header and the
	/// inner Ethernet header.
	pub tnl_hdr_len: U16,
	pub rsvd0: U16,
	pub rsvd1: U64,
}

pub const ULP_TX_PKT: u32 = 4;
pub const ULP_TX_SC_IMM: u32 = 0x81;
pub const ULP_TX_SC_DSGL: u32 = 0x82;
pub const S_ULPTX_CMD: u32 = 24;
pub const S_ULP_TXPKT_DEST: u32 = 16;
pub const S_ULP_TXPKT_FID: u32 = 4;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UlpTxPkt {
	pub cmd_dest: U32,
	/// Length of the packet's part of the work request in 16-byte units,
	/// this header included.
	pub len: U32,
}

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct UlptxIdata {
	pub cmd_more: U32,
	pub len: U32,
}
