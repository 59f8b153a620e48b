//! The ISO 15765-2 segmentation-and-reassembly engine.

pub mod engine;
pub mod pci;
pub mod pool;
pub mod recv_ctx;
pub mod send_ctx;
pub mod timer;

pub use engine::IsoTpEngine;

use crate::can::{CanId, NodeId};
use thiserror::Error;

/// Addressing scheme for an ISO-TP session, paired with the rx/tx ids it
/// derives from. Mirrors `isotp_fast_get_addr_sender`/`_recipient` in the
/// original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    Normal,
    Fixed29,
    Extended1Byte,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpAddr {
    pub rx_id: CanId,
    pub tx_id: CanId,
    pub mode: AddressingMode,
}

impl IsoTpAddr {
    /// Builds the (rx, tx) pair for fixed-29-bit addressing, deriving tx from
    /// rx by swapping target and source.
    pub fn fixed(rx_id: CanId) -> Self {
        IsoTpAddr {
            rx_id,
            tx_id: rx_id.swap_target_source(),
            mode: AddressingMode::Fixed29,
        }
    }

    pub fn peer(&self) -> NodeId {
        self.rx_id.source()
    }
}

/// Per-session send/receive options, set at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoTpOpts {
    /// Block size this side advertises in the FC frames it sends.
    pub bs: u8,
    /// STmin (raw ISO encoding) this side advertises.
    pub stmin: u8,
    pub addressing_mode: AddressingMode,
}

impl Default for IsoTpOpts {
    fn default() -> Self {
        IsoTpOpts {
            bs: 8,
            stmin: 0,
            addressing_mode: AddressingMode::Fixed29,
        }
    }
}

/// The full ISO 15765-2 error taxonomy (spec.md §7), shared by send and
/// receive sessions. `Ok` is represented by `Result::Ok(())`, never a variant
/// here.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("N_As expired waiting for frame TX completion")]
    TimeoutA,
    #[error("N_Bs expired waiting for flow control")]
    TimeoutBs,
    #[error("N_Cr expired waiting for the next consecutive frame")]
    TimeoutCr,
    #[error("consecutive frame sequence number mismatch")]
    WrongSn,
    #[error("flow control frame carried an unrecognized flow status")]
    InvalidFs,
    #[error("unexpected PDU type for the current session state")]
    UnexpPdu,
    #[error("too many consecutive FC(WAIT) frames")]
    WftOvrn,
    #[error("declared message length exceeds receiver capacity")]
    BufferOverflw,
    #[error("no send/receive context left in the pool")]
    NoCtxLeft,
    #[error("no reassembly buffer left in the pool")]
    NoNetBufLeft,
    #[error("CAN driver failure")]
    DriverErr,
}

impl From<crate::can::CanError> for Error {
    fn from(_: crate::can::CanError) -> Self {
        Error::DriverErr
    }
}
