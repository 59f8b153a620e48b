//! Tunables for the ISO-TP engine and node layer.
//!
//! The original source expresses most of this as `CONFIG_ISOTP_*` Kconfig
//! symbols fixed at build time; here they are runtime struct fields with the
//! same defaults, loadable from TOML/JSON via `serde` when a host wants that.

use std::time::Duration;

/// Per-engine pool sizing and protocol timing, shared by every bound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IsotpConfig {
    /// Max simultaneous SendContexts (and, symmetrically, RecvContexts).
    pub max_contexts: usize,
    /// Max CAN frames worth of reassembly buffer per RecvContext.
    pub max_fragments_per_message: usize,
    /// Block size this node advertises in its own FC frames.
    pub rx_block_size: u8,
    /// STmin (raw ISO encoding) this node advertises in its own FC frames.
    pub rx_stmin: u8,
    /// N_As: CAN driver TX completion timeout.
    pub n_as: Duration,
    /// N_Bs: time to wait for FC after sending FF.
    pub n_bs: Duration,
    /// N_Cr: time to wait for the next CF while receiving.
    pub n_cr: Duration,
    /// Max consecutive FC(WAIT) tolerated before WFT_OVRN.
    pub wftmax: u8,
    /// Max CAN frame payload: 8 for classical CAN, up to 64 for CAN-FD.
    pub can_max_dlen: usize,
    /// Retries for a transient `SendOutcome::Again` from the CAN endpoint.
    pub send_retries: u8,
    /// CF-ordering semaphore count: how many CFs may be in flight
    /// (transmitted but not yet completion-confirmed) before the send path
    /// waits in WAIT_BACKLOG for the driver TX ring to drain.
    pub tx_ring_slack: u8,
}

impl Default for IsotpConfig {
    fn default() -> Self {
        IsotpConfig {
            max_contexts: 8,
            // Covers the full 4095-byte ISO 15765-2 maximum at CAN_MAX_DLEN-1
            // (7) bytes per fragment: 4095 / 7 rounds up to 586.
            max_fragments_per_message: 586,
            rx_block_size: 8,
            rx_stmin: 0,
            n_as: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            wftmax: 16,
            can_max_dlen: crate::can::CAN_MAX_DLEN,
            send_retries: 3,
            tx_ring_slack: 4,
        }
    }
}

/// Address-claim timing and node-layer tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeConfig {
    /// Default NodeId to try first, before any persisted value is consulted.
    pub default_node_id: u8,
    /// How long to listen for a competing claim before sending our own.
    pub claim_listen: Duration,
    /// How long to wait for tx-confirmation of our claim frame.
    pub claim_tx_confirm: Duration,
    /// Report period.
    pub report_period: Duration,
    /// Small delay before sending a response, to let the peer switch to RX.
    pub response_delay: Duration,
    /// Whether oversized reports are packetized, or simply dropped.
    pub packetized_reports: bool,
    /// Retries for a single packetized-report frame under backpressure.
    pub report_frame_retries: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            default_node_id: 1,
            claim_listen: Duration::from_millis(500),
            claim_tx_confirm: Duration::from_millis(100),
            report_period: Duration::from_millis(1000),
            response_delay: Duration::from_millis(10),
            packetized_reports: true,
            report_frame_retries: 3,
        }
    }
}
