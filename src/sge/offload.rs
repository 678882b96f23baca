//! Checksum and segmentation offload decisions.
//!
//! The device is told where the headers it has to fix up start; this
//! module finds them in the first bytes of an outgoing frame and turns the
//! stack's requests into `ctrl1` and LSO CPL words.

use alloc::collections::TryReserveError;

use smoltcp::wire::{
	EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket,
};
use zerocopy::big_endian::{U16, U32, U64};

use super::msg::{
	CplOpcode, CplTxPktLsoCore, CplTxTnlLso, F_LSO_FIRST_SLICE, F_LSO_IPV6, F_LSO_LAST_SLICE,
	F_TNL_LSO_OUT_IPV6, F_TXPKT_IPCSUM_DIS, F_TXPKT_L4CSUM_DIS, M_T6_TXPKT_ETHHDR_LEN,
	M_TXPKT_CSUM_LOC, M_TXPKT_CSUM_START, M_TXPKT_ETHHDR_LEN, M_TXPKT_IPHDR_LEN,
	S_LSO_ETHHDR_LEN, S_LSO_IPHDR_LEN, S_LSO_OPCODE, S_LSO_TCPHDR_LEN, S_T6_TXPKT_ETHHDR_LEN,
	S_TNL_LSO_OUT_ETHHDR_LEN, S_TNL_LSO_OUT_IPHDR_LEN, S_TXPKT_CSUM_LOC, S_TXPKT_CSUM_START,
	S_TXPKT_CSUM_TYPE, S_TXPKT_ETHHDR_LEN, S_TXPKT_IPHDR_LEN, TxCsumType,
};
use super::txinfo::TxInfo;
use crate::config::ChipVersion;
use crate::net::{Packet, TxOffloads};

const ETH_HLEN: u16 = 14;
const ETHERTYPE_VLAN: u16 = 0x8100;
const UDP_HLEN: u16 = 8;
const VXLAN_HLEN: u16 = 8;
pub const VXLAN_PORT: u16 = 4789;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpVersion {
	V4,
	V6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Proto {
	Tcp,
	Udp,
}

/// Header lengths of one Ethernet frame, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Headers {
	pub l2_len: u16,
	pub ip: IpVersion,
	pub l3_len: u16,
	/// `None` for protocols without offload support and for non-first
	/// fragments.
	pub l4: Option<L4Proto>,
	pub l4_len: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tunnel {
	/// Bytes in front of the inner Ethernet header.
	pub encap_len: u16,
	/// `None` if the inner headers did not fit the inspected prefix.
	pub inner: Option<Headers>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeaders {
	pub outer: Headers,
	pub tunnel: Option<Tunnel>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsumOutcome {
	Applied,
	/// Nothing was requested.
	Ignored,
	/// Something was requested that the device cannot be told to do. The
	/// packet goes out as is.
	Failed,
}

/// Headers one LSO request describes to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LsoPlan {
	/// The headers replicated into every segment.
	pub hdrs: Headers,
	pub tunnel: Option<TunnelLso>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TunnelLso {
	pub outer: Headers,
	/// UDP and VXLAN between the outer IP header and the inner frame.
	pub tnl_hdr_len: u16,
}

/// Parses the Ethernet, IP and TCP/UDP headers at the start of `frame`,
/// following one level of VXLAN encapsulation.
pub fn parse(frame: &[u8]) -> Option<PacketHeaders> {
	let (outer, udp_dport) = parse_frame(frame)?;
	let tunnel = (udp_dport == Some(VXLAN_PORT)).then(|| {
		let encap_len = outer.l2_len + outer.l3_len + UDP_HLEN + VXLAN_HLEN;
		let inner = frame
			.get(usize::from(encap_len)..)
			.and_then(parse_frame)
			.map(|(hdrs, _)| hdrs);
		Tunnel { encap_len, inner }
	});
	Some(PacketHeaders { outer, tunnel })
}

fn parse_frame(frame: &[u8]) -> Option<(Headers, Option<u16>)> {
	let eth = EthernetFrame::new_checked(frame).ok()?;
	let mut l2_len = ETH_HLEN;
	let mut ethertype = u16::from(eth.ethertype());
	if ethertype == ETHERTYPE_VLAN {
		let tag = frame.get(16..18)?;
		ethertype = u16::from_be_bytes([tag[0], tag[1]]);
		l2_len += 4;
	}

	let l3 = &frame[usize::from(l2_len)..];
	let (ip, l3_len, proto, first_fragment) = match EthernetProtocol::from(ethertype) {
		EthernetProtocol::Ipv4 => {
			if l3.len() < 20 {
				return None;
			}
			let ip = Ipv4Packet::new_unchecked(l3);
			let hlen = u16::from(ip.header_len());
			if hlen < 20 || l3.len() < usize::from(hlen) {
				return None;
			}
			(IpVersion::V4, hlen, ip.next_header(), ip.frag_offset() == 0)
		}
		EthernetProtocol::Ipv6 => {
			if l3.len() < 40 {
				return None;
			}
			let ip = Ipv6Packet::new_unchecked(l3);
			(IpVersion::V6, 40, ip.next_header(), true)
		}
		_ => return None,
	};

	let l4 = &l3[usize::from(l3_len)..];
	let mut udp_dport = None;
	let (proto, l4_len) = match proto {
		_ if !first_fragment => (None, 0),
		IpProtocol::Tcp if l4.len() >= 20 => {
			let hlen = u16::from(TcpPacket::new_unchecked(l4).header_len());
			if hlen < 20 || l4.len() < usize::from(hlen) {
				(None, 0)
			} else {
				(Some(L4Proto::Tcp), hlen)
			}
		}
		IpProtocol::Udp if l4.len() >= usize::from(UDP_HLEN) => {
			udp_dport = Some(UdpPacket::new_unchecked(l4).dst_port());
			(Some(L4Proto::Udp), UDP_HLEN)
		}
		_ => (None, 0),
	};

	let hdrs = Headers {
		l2_len,
		ip,
		l3_len,
		l4: proto,
		l4_len,
	};
	Some((hdrs, udp_dport))
}

fn ethhdr_len_field(chip: ChipVersion, l2_len: u16) -> Option<u64> {
	let extra = u64::from(l2_len.checked_sub(ETH_HLEN)?);
	match chip {
		ChipVersion::T6 => (extra <= M_T6_TXPKT_ETHHDR_LEN).then(|| extra << S_T6_TXPKT_ETHHDR_LEN),
		ChipVersion::T4 | ChipVersion::T5 => {
			(extra <= M_TXPKT_ETHHDR_LEN).then(|| extra << S_TXPKT_ETHHDR_LEN)
		}
	}
}

/// Headers the checksum request applies to, with the bytes in front of
/// their Ethernet header.
fn csum_target(hdrs: &PacketHeaders, chip: ChipVersion, want_l4: bool) -> Option<(Headers, u16)> {
	match hdrs.tunnel {
		None => Some((hdrs.outer, 0)),
		Some(tunnel) if chip.supports_tunnel_offload() => {
			tunnel.inner.map(|inner| (inner, tunnel.encap_len))
		}
		Some(_) if !want_l4 => Some((hdrs.outer, 0)),
		Some(_) => None,
	}
}

const CSUM_DISABLED: u64 = F_TXPKT_IPCSUM_DIS | F_TXPKT_L4CSUM_DIS;

/// Generic mode: sum from `csum_start` to the end and store at
/// `csum_stuff`.
fn partial_csum(txinfo: &TxInfo) -> (u64, CsumOutcome) {
	let start = u64::from(txinfo.req.csum_start);
	let stuff = u64::from(txinfo.req.csum_stuff);
	if start > M_TXPKT_CSUM_START || stuff > M_TXPKT_CSUM_LOC {
		return (CSUM_DISABLED, CsumOutcome::Failed);
	}
	let ctrl1 = (u64::from(u8::from(TxCsumType::Partial)) << S_TXPKT_CSUM_TYPE)
		| (start << S_TXPKT_CSUM_START)
		| (stuff << S_TXPKT_CSUM_LOC)
		| F_TXPKT_IPCSUM_DIS;
	(ctrl1, CsumOutcome::Applied)
}

/// Computes the checksum part of `ctrl1` for a packet.
pub(crate) fn decide(txinfo: &TxInfo, chip: ChipVersion) -> (u64, CsumOutcome) {
	if txinfo.lso_failed {
		return (CSUM_DISABLED, CsumOutcome::Failed);
	}

	let offloads = txinfo.req.offloads;
	let lso = txinfo.lso.is_some();
	let want_ip = offloads.contains(TxOffloads::IPV4_CSUM) || lso;
	let want_l4 = offloads.contains(TxOffloads::L4_CSUM) || lso;
	let partial = offloads.contains(TxOffloads::L4_PARTIAL);
	if !(want_ip || want_l4 || partial) {
		return (CSUM_DISABLED, CsumOutcome::Ignored);
	}

	let Some((l, base)) = txinfo
		.hdrs
		.as_ref()
		.and_then(|hdrs| csum_target(hdrs, chip, want_l4 || partial))
	else {
		return if partial {
			partial_csum(txinfo)
		} else {
			(CSUM_DISABLED, CsumOutcome::Failed)
		};
	};

	let csum_type = if want_l4 || partial {
		match (l.ip, l.l4) {
			(IpVersion::V4, Some(L4Proto::Tcp)) => TxCsumType::TcpIp,
			(IpVersion::V4, Some(L4Proto::Udp)) => TxCsumType::UdpIp,
			(IpVersion::V6, Some(L4Proto::Tcp)) => TxCsumType::TcpIp6,
			(IpVersion::V6, Some(L4Proto::Udp)) => TxCsumType::UdpIp6,
			(_, None) if partial => return partial_csum(txinfo),
			(_, None) => return (CSUM_DISABLED, CsumOutcome::Failed),
		}
	} else if l.ip == IpVersion::V4 {
		TxCsumType::Ip
	} else {
		return (CSUM_DISABLED, CsumOutcome::Failed);
	};

	let Some(ethhdr) = ethhdr_len_field(chip, base + l.l2_len) else {
		return (CSUM_DISABLED, CsumOutcome::Failed);
	};
	if u64::from(l.l3_len) > M_TXPKT_IPHDR_LEN {
		return (CSUM_DISABLED, CsumOutcome::Failed);
	}

	let mut ctrl1 = (u64::from(u8::from(csum_type)) << S_TXPKT_CSUM_TYPE)
		| ethhdr | (u64::from(l.l3_len) << S_TXPKT_IPHDR_LEN);
	if !(want_ip && l.ip == IpVersion::V4) {
		ctrl1 |= F_TXPKT_IPCSUM_DIS;
	}
	if csum_type == TxCsumType::Ip {
		ctrl1 |= F_TXPKT_L4CSUM_DIS;
	}
	(ctrl1, CsumOutcome::Applied)
}

/// Headers an LSO request can use, or `None` if the packet is not TCP or
/// its headers could not be found.
pub(crate) fn plan_lso(hdrs: Option<&PacketHeaders>, chip: ChipVersion) -> Option<LsoPlan> {
	let hdrs = hdrs?;
	match hdrs.tunnel {
		None => (hdrs.outer.l4 == Some(L4Proto::Tcp)).then_some(LsoPlan {
			hdrs: hdrs.outer,
			tunnel: None,
		}),
		Some(tunnel) if chip.supports_tunnel_offload() => {
			let inner = tunnel.inner?;
			(inner.l4 == Some(L4Proto::Tcp)).then(|| LsoPlan {
				hdrs: inner,
				tunnel: Some(TunnelLso {
					outer: hdrs.outer,
					tnl_hdr_len: tunnel.encap_len - hdrs.outer.l2_len - hdrs.outer.l3_len,
				}),
			})
		}
		Some(_) => None,
	}
}

pub(crate) fn lso_cpl(plan: &LsoPlan, mss: u16, len: u32) -> CplTxPktLsoCore {
	let h = plan.hdrs;
	let mut ctrl = (u32::from(u8::from(CplOpcode::TxPktLso)) << S_LSO_OPCODE)
		| F_LSO_FIRST_SLICE
		| F_LSO_LAST_SLICE
		| (u32::from((h.l2_len - ETH_HLEN) / 4) << S_LSO_ETHHDR_LEN)
		| (u32::from(h.l3_len / 4) << S_LSO_IPHDR_LEN)
		| (u32::from(h.l4_len / 4) << S_LSO_TCPHDR_LEN);
	if h.ip == IpVersion::V6 {
		ctrl |= F_LSO_IPV6;
	}
	CplTxPktLsoCore {
		lso_ctrl: U32::new(ctrl),
		ipid_ofst: U16::new(0),
		mss: U16::new(mss),
		seqno_offset: U32::new(0),
		len: U32::new(len),
	}
}

pub(crate) fn tnl_lso_cpl(tunnel: &TunnelLso) -> CplTxTnlLso {
	let o = tunnel.outer;
	let mut ctrl = (u32::from(u8::from(CplOpcode::TxTnlLso)) << S_LSO_OPCODE)
		| F_LSO_FIRST_SLICE
		| F_LSO_LAST_SLICE
		| (u32::from((o.l2_len - ETH_HLEN) / 4) << S_TNL_LSO_OUT_ETHHDR_LEN)
		| (u32::from(o.l3_len / 4) << S_TNL_LSO_OUT_IPHDR_LEN);
	if o.ip == IpVersion::V6 {
		ctrl |= F_TNL_LSO_OUT_IPV6;
	}
	CplTxTnlLso {
		op_to_iphdr_len: U32::new(ctrl),
		tnl_hdr_len: U16::new(tunnel.tnl_hdr_len),
		rsvd0: U16::new(0),
		rsvd1: U64::new(0),
	}
}

/// Prepares the outer IPv4 header of a tunnelled LSO packet.
///
/// The device rewrites the total length of every segment but only adjusts
/// the outer checksum by that length, so the header must carry the
/// un-inverted sum taken with a zero total length.
pub(crate) fn fix_outer_ipv4_csum(pkt: &mut Packet, outer: &Headers) -> Result<(), TryReserveError> {
	if outer.ip != IpVersion::V4 {
		return Ok(());
	}
	let l2 = usize::from(outer.l2_len);
	let head = pkt.head_mut(l2 + usize::from(outer.l3_len))?;
	let mut ip = Ipv4Packet::new_unchecked(&mut head[l2..]);
	let total_len = ip.total_len();
	ip.set_total_len(0);
	ip.fill_checksum();
	let csum = ip.checksum();
	ip.set_checksum(!csum);
	ip.set_total_len(total_len);
	Ok(())
}
