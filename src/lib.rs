//! Data-path engine for T4-class network adapters.
//!
//! The engine drives the descriptor rings shared with the adapter: ingress
//! queues carrying receive completions and control messages, free lists of
//! receive buffers, and egress queues of transmit work requests. Everything
//! above the rings (firmware mailbox, link management, the network stack)
//! belongs to the embedding driver, which plugs in through the traits of
//! [`sge`] and [`mm`].

#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]
#![no_std]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;
#[cfg(test)]
extern crate std;

#[macro_use]
mod macros;

#[macro_use]
mod logging;

pub mod config;
pub mod mm;
pub mod net;
mod object_pool;
pub mod sge;

pub use crate::config::{ChipVersion, ParamError, SgeParams};
pub use crate::logging::{init as init_logging, max_level};
pub use crate::sge::{
	EqConfig, FlConfig, FwMessage, IntrParams, IqConfig, IqIds, Sge, SgeError, SgeHandler, SgeHw,
	Timer, TxError,
};
