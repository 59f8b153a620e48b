//! Node addressing layer: bus address claim, periodic reports, and
//! request/response dispatch on top of the ISO-TP engine.

pub mod claim;
pub mod reqresp;
pub mod report;

use thiserror::Error;

/// Message-type subfield values used in the fixed-29-bit CAN id layout
/// (spec.md §6). Grounded on `THINGSET_CAN_TYPE_*` in original_source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Network = 0x00,
    Channel = 0x01,
    Report = 0x02,
    PacketizedReport = 0x03,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    #[error(transparent)]
    Isotp(#[from] crate::isotp::Error),
    #[error(transparent)]
    Can(#[from] crate::can::CanError),
    #[error("no free NodeId found after exhausting claim retries")]
    ClaimExhausted,
    #[error("request exceeded the local receive buffer")]
    RequestTooLarge,
    #[error("request processor returned no response body")]
    InternalServerErr,
}
