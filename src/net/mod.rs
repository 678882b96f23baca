//! Packets as exchanged with the network stack.

mod packet;

pub use self::packet::{Frag, Packet, RxMeta, TxOffloads, TxRequest};
