//! Periodic reports (spec.md §4.5), grounded on
//! `thingset_can_report_tx_handler`/`thingset_can_report_rx_cb` in
//! original_source/src/can.c: a report that fits one CAN frame is sent
//! fire-and-forget; an oversized one is chunked with a SLIP-like
//! byte-stuffing framer and reassembled per-sender on the RX side.

use crate::can::{CanEndpoint, CanFrame, CanId, FrameFlags, NodeId};
use crate::config::NodeConfig;
use crate::retry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

const MSG_TYPE_REPORT: u8 = super::MsgType::Report as u8;
const MSG_TYPE_PACKETIZED_REPORT: u8 = super::MsgType::PacketizedReport as u8;

/// Priority class for reports: lower urgency than network management or
/// request/response traffic.
const REPORT_PRIORITY: u8 = 6;

fn stuff_into(input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        match b {
            SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
}

/// Builds a single "plain" report frame for a payload that fits in one CAN
/// frame. `data_obj_id` occupies the message-type subfield.
pub fn plain_report_frame(source: NodeId, data_obj_id: u8, payload: &[u8]) -> Option<CanFrame> {
    if payload.len() > crate::can::CAN_MAX_DLEN {
        return None;
    }
    let id = CanId::fixed(REPORT_PRIORITY, MSG_TYPE_REPORT.wrapping_add(data_obj_id), NodeId::BROADCAST, source);
    CanFrame::new(id, FrameFlags::EXTENDED, payload).ok()
}

/// Splits an oversized report payload into sequence-numbered, byte-stuffed
/// frames ready to hand to `CanEndpoint::send`, one at a time.
pub fn packetize(source: NodeId, payload: &[u8], max_dlen: usize, start_seq: u8) -> Vec<CanFrame> {
    let mut stuffed = Vec::with_capacity(payload.len() + payload.len() / 8 + 1);
    stuff_into(payload, &mut stuffed);

    let chunk_len = max_dlen - 1;
    let id = CanId::fixed(REPORT_PRIORITY, MSG_TYPE_PACKETIZED_REPORT, NodeId::BROADCAST, source);
    let mut seq = start_seq;
    let mut frames = Vec::new();
    for chunk in stuffed.chunks(chunk_len) {
        let mut data = Vec::with_capacity(chunk.len() + 1);
        data.push(seq);
        data.extend_from_slice(chunk);
        frames.push(CanFrame::new(id, FrameFlags::EXTENDED, &data).expect("chunk fits max_dlen"));
        seq = seq.wrapping_add(1);
    }
    frames
}

/// Per-sender reassembly state for packetized reports.
struct Bucket {
    expected_seq: u8,
    message: Vec<u8>,
    escape_pending: bool,
}

impl Bucket {
    fn new(seq: u8) -> Self {
        Bucket {
            expected_seq: seq,
            message: Vec::new(),
            escape_pending: false,
        }
    }

    /// Feeds one stuffed chunk through the unstuffer. Returns `Some(message)`
    /// once the SLIP END byte is observed.
    fn feed(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, ()> {
        for &b in chunk {
            if self.escape_pending {
                self.escape_pending = false;
                match b {
                    SLIP_ESC_END => self.message.push(SLIP_END),
                    SLIP_ESC_ESC => self.message.push(SLIP_ESC),
                    _ => return Err(()),
                }
                continue;
            }
            match b {
                SLIP_END => return Ok(Some(std::mem::take(&mut self.message))),
                SLIP_ESC => self.escape_pending = true,
                other => self.message.push(other),
            }
        }
        Ok(None)
    }
}

/// Holds one reassembly bucket per sender NodeId; an out-of-sequence chunk
/// discards that sender's in-progress buffer rather than failing the whole
/// RX path.
#[derive(Default)]
pub struct RxBuckets {
    buckets: HashMap<NodeId, Bucket>,
}

impl RxBuckets {
    pub fn new() -> Self {
        RxBuckets::default()
    }

    /// Feeds one packetized-report frame's payload (`seq` byte plus stuffed
    /// chunk). Returns the fully reassembled message once its END marker
    /// arrives.
    pub fn on_frame(&mut self, sender: NodeId, seq: u8, chunk: &[u8]) -> Option<Vec<u8>> {
        let bucket = self
            .buckets
            .entry(sender)
            .or_insert_with(|| Bucket::new(seq));

        if seq != bucket.expected_seq {
            self.buckets.remove(&sender);
            return None;
        }

        match self.buckets.get_mut(&sender).unwrap().feed(chunk) {
            Ok(Some(message)) => {
                self.buckets.remove(&sender);
                Some(message)
            }
            Ok(None) => {
                let bucket = self.buckets.get_mut(&sender).unwrap();
                bucket.expected_seq = bucket.expected_seq.wrapping_add(1);
                None
            }
            Err(()) => {
                self.buckets.remove(&sender);
                None
            }
        }
    }
}

/// The data-object iteration boundary (spec.md §1: "data-object iteration...
/// is out of scope and appears only as interfaces in §6"). Applications
/// supply their own implementation; [`ReportScheduler`] only needs to be
/// handed, once per period, the live set of (data-object id, serialized
/// value) pairs to emit.
pub trait ReportSource: Send {
    /// Calls `emit` once per live data object with its id and serialized
    /// value, in the shared scratch buffer discipline spec.md §5 describes
    /// (the caller owns `emit`'s buffer for the duration of the call only).
    fn for_each_report(&mut self, emit: &mut dyn FnMut(u8, &[u8]));
}

/// Drives the periodic report loop (spec.md §4.5): on each `tick` whose
/// `report_period` has elapsed, iterates the live data objects from a
/// [`ReportSource`] and emits one plain or packetized report per object,
/// fire-and-forget, retrying each frame under transient backpressure.
pub struct ReportScheduler {
    source: Box<dyn ReportSource>,
    next_due: Instant,
    packetized_seq: u8,
}

impl ReportScheduler {
    pub fn new(source: Box<dyn ReportSource>, now: Instant) -> Self {
        ReportScheduler {
            source,
            next_due: now,
            packetized_seq: 0,
        }
    }

    /// Emits one round of reports if `cfg.report_period` has elapsed since
    /// the last round; otherwise a no-op. `max_dlen` is 8 for classical CAN,
    /// up to 64 for CAN-FD.
    pub fn tick(
        &mut self,
        endpoint: &mut dyn CanEndpoint,
        source_addr: NodeId,
        max_dlen: usize,
        now: Instant,
        cfg: &NodeConfig,
    ) {
        if now < self.next_due {
            return;
        }
        self.next_due = now + cfg.report_period;

        let mut outgoing: Vec<(u8, Vec<u8>)> = Vec::new();
        self.source.for_each_report(&mut |id, payload| {
            outgoing.push((id, payload.to_vec()));
        });

        for (data_obj_id, payload) in outgoing {
            if let Some(frame) = plain_report_frame(source_addr, data_obj_id, &payload) {
                send_best_effort(endpoint, &frame, cfg.report_frame_retries);
                continue;
            }
            if !cfg.packetized_reports {
                continue;
            }
            let frames = packetize(source_addr, &payload, max_dlen, self.packetized_seq);
            self.packetized_seq = self.packetized_seq.wrapping_add(frames.len() as u8);
            for frame in &frames {
                send_best_effort(endpoint, frame, cfg.report_frame_retries);
            }
        }
    }
}

/// Fire-and-forget send with bounded retry on transient backpressure
/// (spec.md §4.5: "retry up to 3 times per frame"). The driver's completion
/// is intentionally not awaited past that — reports are best-effort, not a
/// reliable channel.
fn send_best_effort(endpoint: &mut dyn CanEndpoint, frame: &CanFrame, retries: u8) {
    let _ = retry::send_with_retry(endpoint, frame, retries, Arc::new(|_| {}));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<(u8, Vec<u8>)>);
    impl ReportSource for FixedSource {
        fn for_each_report(&mut self, emit: &mut dyn FnMut(u8, &[u8])) {
            for (id, payload) in &self.0 {
                emit(*id, payload);
            }
        }
    }

    #[test]
    fn scheduler_emits_nothing_before_the_period_elapses() {
        use crate::can::loopback::{LoopbackBus, LoopbackEndpoint};
        use crate::can::CanFilter;

        let bus = LoopbackBus::new();
        let mut tx_ep = LoopbackEndpoint::new(bus.clone());
        let mut rx_ep = LoopbackEndpoint::new(bus);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        rx_ep
            .add_rx_filter(
                CanFilter {
                    id: CanId::new(0),
                    mask: 0,
                    flags: FrameFlags::EXTENDED,
                },
                Box::new(move |f| s.lock().unwrap().push(f)),
            )
            .unwrap();

        let mut cfg = NodeConfig::default();
        cfg.report_period = Duration::from_secs(10);
        let now = Instant::now();
        let mut sched = ReportScheduler::new(Box::new(FixedSource(vec![(1, vec![9, 9])])), now);

        sched.tick(&mut tx_ep, NodeId::new(0x01).unwrap(), 8, now, &cfg);
        assert_eq!(seen.lock().unwrap().len(), 1, "first tick always fires immediately");

        sched.tick(&mut tx_ep, NodeId::new(0x01).unwrap(), 8, now + Duration::from_millis(1), &cfg);
        assert_eq!(seen.lock().unwrap().len(), 1, "second tick before the period elapses is a no-op");
    }

    #[test]
    fn scheduler_emits_a_plain_report_per_live_data_object() {
        use crate::can::loopback::{LoopbackBus, LoopbackEndpoint};
        use crate::can::CanFilter;

        let bus = LoopbackBus::new();
        let mut tx_ep = LoopbackEndpoint::new(bus.clone());
        let mut rx_ep = LoopbackEndpoint::new(bus);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        rx_ep
            .add_rx_filter(
                CanFilter {
                    id: CanId::new(0),
                    mask: 0,
                    flags: FrameFlags::EXTENDED,
                },
                Box::new(move |f| s.lock().unwrap().push(f)),
            )
            .unwrap();

        let cfg = NodeConfig::default();
        let now = Instant::now();
        let mut sched = ReportScheduler::new(
            Box::new(FixedSource(vec![(1, vec![1, 2]), (2, vec![3, 4])])),
            now,
        );
        sched.tick(&mut tx_ep, NodeId::new(0x01).unwrap(), 8, now, &cfg);

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn plain_report_fits_a_single_frame() {
        let frame = plain_report_frame(NodeId::new(1).unwrap(), 5, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
    }

    #[test]
    fn oversized_payload_is_rejected_as_plain_report() {
        assert!(plain_report_frame(NodeId::new(1).unwrap(), 5, &[0; 9]).is_none());
    }

    #[test]
    fn packetize_then_reassemble_roundtrips() {
        let payload: Vec<u8> = (0..40).collect();
        let frames = packetize(NodeId::new(3).unwrap(), &payload, 8, 0);
        assert!(frames.len() > 1);

        let mut rx = RxBuckets::new();
        let mut result = None;
        for frame in &frames {
            let data = frame.data();
            let seq = data[0];
            result = rx.on_frame(NodeId::new(3).unwrap(), seq, &data[1..]);
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn byte_stuffing_escapes_the_end_marker_in_the_payload() {
        let payload = vec![SLIP_END, SLIP_ESC, 0x01];
        let frames = packetize(NodeId::new(3).unwrap(), &payload, 8, 0);
        let mut rx = RxBuckets::new();
        let mut result = None;
        for frame in &frames {
            let data = frame.data();
            result = rx.on_frame(NodeId::new(3).unwrap(), data[0], &data[1..]);
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn out_of_sequence_chunk_discards_the_bucket() {
        let payload: Vec<u8> = (0..40).collect();
        let frames = packetize(NodeId::new(3).unwrap(), &payload, 8, 0);
        let mut rx = RxBuckets::new();
        let first = frames[0].data();
        assert_eq!(rx.on_frame(NodeId::new(3).unwrap(), first[0], &first[1..]), None);
        // skip a sequence number: bucket is discarded, not completed later.
        let last = frames[frames.len() - 1].data();
        assert_eq!(rx.on_frame(NodeId::new(3).unwrap(), last[0], &last[1..]), None);
        assert!(rx.buckets.is_empty());
    }
}
