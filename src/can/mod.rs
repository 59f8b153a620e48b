//! The CAN Endpoint abstraction.
//!
//! This crate does not talk to real CAN hardware. A [`CanEndpoint`] is the
//! external collaborator the ISO-TP engine and node layer are built against;
//! applications provide their own implementation (a SocketCAN binding, a
//! bench adapter, a simulator, ...). [`loopback::LoopbackEndpoint`] is a
//! minimal in-process implementation used by the test suite and demos.

pub mod loopback;

use thiserror::Error;

pub use loopback::LoopbackEndpoint;

/// Maximum payload of a classical CAN frame.
pub const CAN_MAX_DLEN: usize = 8;

/// Maximum payload of a CAN-FD frame.
pub const CANFD_MAX_DLEN: usize = 64;

/// A 1-byte bus-local node address.
///
/// `0x00` is reserved for anonymous use during address claim, `0xFE` is the
/// broadcast address, and `0xFF` is reserved and never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    pub const ANONYMOUS: NodeId = NodeId(0x00);
    pub const BROADCAST: NodeId = NodeId(0xFE);
    pub const MIN: u8 = 0x01;
    pub const MAX: u8 = 0xFD;

    /// Builds a `NodeId`, accepting the anonymous and broadcast sentinels in
    /// addition to the normal `0x01..=0xFD` range.
    pub fn new(raw: u8) -> Result<Self, NodeIdError> {
        if raw == 0xFF {
            Err(NodeIdError::Reserved)
        } else {
            Ok(NodeId(raw))
        }
    }

    /// Builds a `NodeId` restricted to the assignable range used by address
    /// claim (`0x01..=0xFD`).
    pub fn new_assignable(raw: u8) -> Result<Self, NodeIdError> {
        if (Self::MIN..=Self::MAX).contains(&raw) {
            Ok(NodeId(raw))
        } else {
            Err(NodeIdError::OutOfRange(raw))
        }
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn is_anonymous(self) -> bool {
        self == Self::ANONYMOUS
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

#[derive(Debug, Error, Copy, Clone)]
pub enum NodeIdError {
    #[error("node id 0xFF is reserved")]
    Reserved,
    #[error("node id {0:#04x} is outside the assignable range 0x01..=0xFD")]
    OutOfRange(u8),
}

/// A 29-bit extended CAN identifier, optionally structured per
/// [`crate::isotp::AddressingMode::Fixed29`]:
///
/// ```text
/// bits 28..26 : priority
/// bits 25..24 : reserved
/// bits 23..16 : message type / subfield
/// bits 15..8  : target NodeId
/// bits  7..0  : source NodeId
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanId(u32);

const TARGET_SHIFT: u32 = 8;
const SOURCE_MASK: u32 = 0xFF;
const TARGET_MASK: u32 = 0xFF00;
const TYPE_SHIFT: u32 = 16;
const TYPE_MASK: u32 = 0x00FF_0000;
const PRIO_SHIFT: u32 = 26;
const PRIO_MASK: u32 = 0x1C00_0000;

impl CanId {
    pub const EFF_MASK: u32 = 0x1FFF_FFFF;

    pub fn new(raw: u32) -> Self {
        CanId(raw & Self::EFF_MASK)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Builds a fixed-addressing id from its structured fields.
    pub fn fixed(priority: u8, msg_type: u8, target: NodeId, source: NodeId) -> Self {
        let raw = ((priority as u32) << PRIO_SHIFT)
            | ((msg_type as u32) << TYPE_SHIFT)
            | ((target.raw() as u32) << TARGET_SHIFT)
            | (source.raw() as u32);
        CanId(raw & Self::EFF_MASK)
    }

    pub fn priority(self) -> u8 {
        ((self.0 & PRIO_MASK) >> PRIO_SHIFT) as u8
    }

    pub fn msg_type(self) -> u8 {
        ((self.0 & TYPE_MASK) >> TYPE_SHIFT) as u8
    }

    pub fn target(self) -> NodeId {
        NodeId(((self.0 & TARGET_MASK) >> TARGET_SHIFT) as u8)
    }

    pub fn source(self) -> NodeId {
        NodeId((self.0 & SOURCE_MASK) as u8)
    }

    /// Swaps target and source, as required to derive a tx id from an rx id
    /// (or vice versa) in fixed addressing mode.
    pub fn swap_target_source(self) -> Self {
        let without = self.0 & !(TARGET_MASK | SOURCE_MASK);
        let target = self.target().raw() as u32;
        let source = self.source().raw() as u32;
        CanId(without | (source << TARGET_SHIFT) | target)
    }
}

bitflags::bitflags! {
    /// Per-frame flags (extended id, CAN-FD, remote frame, error frame).
    pub struct FrameFlags: u8 {
        const EXTENDED = 0b0000_0001;
        const FD       = 0b0000_0010;
        const RTR      = 0b0000_0100;
        const ERROR    = 0b0000_1000;
    }
}

/// A raw CAN (or CAN-FD) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: CanId,
    pub flags: FrameFlags,
    data: Vec<u8>,
}

#[derive(Debug, Error, Copy, Clone)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the maximum frame length")]
    TooMuchData(usize),
}

impl CanFrame {
    pub fn new(id: CanId, flags: FrameFlags, data: &[u8]) -> Result<Self, FrameError> {
        let max = if flags.contains(FrameFlags::FD) {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };
        if data.len() > max {
            return Err(FrameError::TooMuchData(data.len()));
        }
        Ok(CanFrame {
            id,
            flags,
            data: data.to_vec(),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

/// A receive filter, matched as `(frame.id & mask) == (id & mask)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFilter {
    pub id: CanId,
    pub mask: u32,
    pub flags: FrameFlags,
}

/// Opaque handle returned by [`CanEndpoint::add_rx_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub u32);

/// Bus operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Normal,
    Loopback,
    Fd,
}

/// Error/active/passive/bus-off state plus error counters, as reported by
/// `CanEndpoint::get_state`. Used by address-claim collision detection
/// (spec.md step 5: a rise in `tx_err_cnt` after sending a claim frame is
/// treated as a concurrent claim by another node).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusState {
    pub tx_err_cnt: u32,
    pub rx_err_cnt: u32,
    pub bus_off: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CanError {
    #[error("CAN driver failure")]
    Driver,
    #[error("no receive filter slots left")]
    NoFilterSlots,
}

/// Outcome of a `CanEndpoint::send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame accepted by the driver; `completion` will be invoked later.
    Ok,
    /// Driver is momentarily unable to accept the frame (TX ring full);
    /// callers should retry per §6/§7 (`DRIVER_ERR` after exhausting
    /// retries).
    Again,
}

/// Result delivered to a frame's send-completion callback.
pub type SendCompletion = Result<(), CanError>;

/// The external collaborator this crate is built against: something that can
/// send and receive raw CAN frames and install receive filters. Out of scope
/// per spec.md — applications supply a real implementation.
pub trait CanEndpoint {
    /// Enqueues `frame` for transmission. `completion` is invoked exactly
    /// once, from whatever context the endpoint completes sends in (it may
    /// be an interrupt/callback context — the caller must not do anything
    /// beyond setting flags and waking a worker from within it).
    fn send(
        &mut self,
        frame: &CanFrame,
        completion: Box<dyn FnOnce(SendCompletion) + Send>,
    ) -> Result<SendOutcome, CanError>;

    /// Installs a receive filter; matching frames are delivered to `on_frame`.
    fn add_rx_filter(
        &mut self,
        filter: CanFilter,
        on_frame: Box<dyn FnMut(CanFrame) + Send>,
    ) -> Result<FilterId, CanError>;

    fn remove_rx_filter(&mut self, filter: FilterId);

    fn get_state(&self) -> BusState;

    fn start(&mut self);

    fn set_mode(&mut self, mode: BusMode);
}
