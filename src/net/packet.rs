use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::sge::RxView;

bitflags! {
	/// Offloads the stack asks for on transmit.
	#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
	pub struct TxOffloads: u16 {
		/// Fill in the IPv4 header checksum.
		const IPV4_CSUM = 1 << 0;
		/// Fill in the TCP/UDP checksum.
		const L4_CSUM = 1 << 1;
		/// Checksum from `csum_start` to the end of the frame and store the
		/// result at `csum_stuff`.
		const L4_PARTIAL = 1 << 2;
		/// TCP segmentation with `mss`.
		const LSO = 1 << 3;
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxRequest {
	pub offloads: TxOffloads,
	pub mss: u16,
	pub csum_start: u16,
	pub csum_stuff: u16,
	/// VLAN tag the device inserts.
	pub vlan: Option<u16>,
}

/// What the device reported about a received frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxMeta {
	/// The device verified the L3/L4 checksums.
	pub csum_ok: bool,
	/// VLAN tag extracted by the device.
	pub vlan: Option<u16>,
	pub rss_hash: u32,
}

/// One contiguous piece of a packet.
#[derive(Clone, Debug)]
pub enum Frag {
	Owned(Vec<u8>),
	/// Zero-copy window into a receive buffer.
	Shared(RxView),
}

impl Frag {
	pub fn as_bytes(&self) -> &[u8] {
		match self {
			Self::Owned(v) => v.as_slice(),
			Self::Shared(view) => view.as_bytes(),
		}
	}

	pub fn len(&self) -> usize {
		match self {
			Self::Owned(v) => v.len(),
			Self::Shared(view) => view.len(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn advance(&mut self, n: usize) {
		match self {
			Self::Owned(v) => {
				v.drain(..n.min(v.len()));
			}
			Self::Shared(view) => view.advance(n as u32),
		}
	}
}

/// A network frame made of one or more fragments.
#[derive(Clone, Debug, Default)]
pub struct Packet {
	frags: SmallVec<[Frag; 2]>,
	len: usize,
	pub tx: TxRequest,
	pub rx: RxMeta,
}

impl Packet {
	pub fn new(data: Vec<u8>) -> Self {
		let mut pkt = Self::default();
		pkt.push(Frag::Owned(data));
		pkt
	}

	pub fn from_frags(frags: impl IntoIterator<Item = Frag>) -> Self {
		let mut pkt = Self::default();
		for frag in frags {
			pkt.push(frag);
		}
		pkt
	}

	/// Appends a fragment. Empty fragments are dropped.
	pub fn push(&mut self, frag: Frag) {
		if !frag.is_empty() {
			self.len += frag.len();
			self.frags.push(frag);
		}
	}

	pub fn with_offloads(mut self, tx: TxRequest) -> Self {
		self.tx = tx;
		self
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn frags(&self) -> &[Frag] {
		&self.frags
	}

	/// Copies as much of the packet's head as fits into `dst`.
	pub fn copy_prefix(&self, dst: &mut [u8]) -> usize {
		let mut copied = 0;
		for frag in &self.frags {
			if copied == dst.len() {
				break;
			}
			let bytes = frag.as_bytes();
			let n = bytes.len().min(dst.len() - copied);
			dst[copied..copied + n].copy_from_slice(&bytes[..n]);
			copied += n;
		}
		copied
	}

	pub fn to_vec(&self) -> Vec<u8> {
		let mut v = vec![0; self.len];
		self.copy_prefix(&mut v);
		v
	}

	/// Collapses the packet into a single owned fragment.
	pub fn pullup(&mut self) -> Result<(), TryReserveError> {
		if let [Frag::Owned(_)] = self.frags.as_slice() {
			return Ok(());
		}
		let mut data = Vec::new();
		data.try_reserve_exact(self.len)?;
		for frag in &self.frags {
			data.extend_from_slice(frag.as_bytes());
		}
		self.frags.clear();
		self.frags.push(Frag::Owned(data));
		Ok(())
	}

	/// Makes the first `n` bytes writable and contiguous, leaving the rest of
	/// the packet where it is.
	pub fn head_mut(&mut self, n: usize) -> Result<&mut [u8], TryReserveError> {
		let n = n.min(self.len);
		if n == 0 {
			return Ok(&mut []);
		}
		let in_place = matches!(self.frags.first(), Some(Frag::Owned(v)) if v.len() >= n);
		if !in_place {
			let mut head = Vec::new();
			head.try_reserve_exact(n)?;
			while head.len() < n {
				let want = n - head.len();
				let frag = &mut self.frags[0];
				let bytes = frag.as_bytes();
				let take = bytes.len().min(want);
				head.extend_from_slice(&bytes[..take]);
				if take == frag.len() {
					self.frags.remove(0);
				} else {
					frag.advance(take);
				}
			}
			self.frags.insert(0, Frag::Owned(head));
		}

		match self.frags.first_mut() {
			Some(Frag::Owned(v)) => Ok(&mut v[..n]),
			_ => Ok(&mut []),
		}
	}
}
