use thiserror::Error;

use crate::config::ParamError;
use crate::mm::DmaError;

#[derive(Debug, Error)]
pub enum SgeError {
	#[error("invalid {0} geometry")]
	Geometry(&'static str),
	#[error(transparent)]
	Dma(#[from] DmaError),
	#[error(transparent)]
	Param(#[from] ParamError),
	#[error("queue context {0} is already registered")]
	Duplicate(u16),
	#[error("firmware refused to create the ring")]
	Firmware,
}

/// The egress queue lacks free descriptors.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("egress queue has no room for {needed} descriptors")]
pub struct Busy {
	pub needed: u16,
}

/// Transmit resource that ran out.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Exhausted {
	#[error("copy buffer")]
	CopyBuffer,
	#[error("DMA handles")]
	DmaHandles,
	#[error("memory")]
	Memory,
	#[error("descriptors")]
	Credits,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TxError {
	/// Try again once completions have returned resources.
	#[error("out of {0}")]
	Retryable(Exhausted),
	/// The packet needs more scatter-gather segments than a work request
	/// can carry, even after being made contiguous.
	#[error("packet does not fit a work request")]
	Permanent,
	/// The packet's memory cannot be made visible to the device.
	#[error("packet memory cannot be mapped")]
	Fatal,
}

impl From<DmaError> for TxError {
	fn from(err: DmaError) -> Self {
		match err {
			DmaError::NoHandle => Self::Retryable(Exhausted::DmaHandles),
			DmaError::NoMemory => Self::Retryable(Exhausted::Memory),
			DmaError::TooManySegments(_) => Self::Permanent,
			DmaError::Fault => Self::Fatal,
		}
	}
}
