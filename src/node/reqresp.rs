//! Request/response dispatch (spec.md §4.6), grounded on
//! `thingset_can_receive_inst`/`send_inst`/`process_inst` in
//! original_source/src/can.c.

use crate::can::{CanEndpoint, CanId, NodeId};
use crate::config::IsotpConfig;
use crate::isotp::{AddressingMode, IsoTpAddr, IsoTpEngine, IsoTpOpts};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::MsgType;

/// Single-byte error bodies sent in place of a real response.
pub const REQUEST_TOO_LARGE: u8 = 0x01;
pub const INTERNAL_SERVER_ERR: u8 = 0x02;

/// Upper-layer request handler. Returns `None` to signal "no response body",
/// which the dispatcher turns into `INTERNAL_SERVER_ERR`.
pub trait Processor: Send {
    fn process(&mut self, request: &[u8]) -> Option<Vec<u8>>;
}

struct Pending {
    peer: NodeId,
    body: Vec<u8>,
    ready_at: Instant,
}

/// Binds a request/response ISO-TP channel for `local`'s node address and
/// dispatches reassembled requests to a [`Processor`], replying after the
/// configured response delay.
pub struct RequestResponder {
    engine: IsoTpEngine,
    pending: Arc<Mutex<VecDeque<Pending>>>,
    response_delay: Duration,
}

impl RequestResponder {
    pub fn bind(
        endpoint: &mut dyn CanEndpoint,
        local: NodeId,
        cfg: IsotpConfig,
        response_delay: Duration,
        processor: Arc<Mutex<dyn Processor>>,
    ) -> Result<Self, crate::can::CanError> {
        let rx_id = CanId::fixed(1, MsgType::Channel as u8, local, NodeId::ANONYMOUS);
        let addr = IsoTpAddr {
            rx_id,
            tx_id: rx_id.swap_target_source(),
            mode: AddressingMode::Fixed29,
        };

        let pending: Arc<Mutex<VecDeque<Pending>>> = Arc::new(Mutex::new(VecDeque::new()));
        let pending_for_recv = pending.clone();
        let pending_for_err = pending.clone();

        let recv_cb = Box::new(move |bytes: Vec<u8>, peer: NodeId| {
            let body = {
                let mut guard = processor.lock().unwrap();
                guard.process(&bytes)
            }
            .unwrap_or_else(|| vec![INTERNAL_SERVER_ERR]);
            pending_for_recv.lock().unwrap().push_back(Pending {
                peer,
                body,
                ready_at: Instant::now(),
            });
        });

        let recv_err_cb = Box::new(move |err: crate::isotp::Error, peer: NodeId| {
            if err == crate::isotp::Error::BufferOverflw {
                pending_for_err.lock().unwrap().push_back(Pending {
                    peer,
                    body: vec![REQUEST_TOO_LARGE],
                    ready_at: Instant::now(),
                });
            }
        });

        let sent_cb = Box::new(|_result: Result<(), crate::isotp::Error>, _peer: NodeId| {});

        let engine = IsoTpEngine::bind(endpoint, addr, IsoTpOpts::default(), cfg, recv_cb, recv_err_cb, sent_cb)?;

        Ok(RequestResponder {
            engine,
            pending,
            response_delay,
        })
    }

    /// Drives the underlying engine and flushes any response whose delay has
    /// elapsed. Call once per worker tick.
    pub fn poll(&mut self, endpoint: &mut dyn CanEndpoint, now: Instant) {
        self.engine.poll(endpoint, now);

        let mut due = Vec::new();
        {
            let mut queue = self.pending.lock().unwrap();
            let mut remaining = VecDeque::new();
            while let Some(item) = queue.pop_front() {
                if now >= item.ready_at + self.response_delay {
                    due.push(item);
                } else {
                    remaining.push_back(item);
                }
            }
            *queue = remaining;
        }
        for item in due {
            let _ = self.engine.send(endpoint, item.body, item.peer);
        }
    }

    pub fn unbind(&mut self, endpoint: &mut dyn CanEndpoint) {
        self.engine.unbind(endpoint);
    }
}
