//! An ISO 15765-2 ("ISO-TP") transport stack for CAN and CAN-FD, plus a
//! thin SAE-J1939-style node-addressing and request/response layer on top
//! of it.
//!
//! # Layers
//!
//! - [`can`] — the CAN Endpoint abstraction this crate is built against. It
//!   does not talk to real hardware; applications supply their own
//!   `CanEndpoint` (a SocketCAN binding, a bench adapter, ...).
//! - [`isotp`] — segmentation and reassembly of byte strings up to 4095
//!   bytes across multiple CAN frames: flow control, block-wise
//!   transmission, separation-time pacing, and the ISO 15765-2 timeout
//!   matrix.
//! - [`node`] — bus address claim, periodic reports, and request/response
//!   dispatch riding on top of the ISO-TP engine.
//!
//! # A note on frames
//!
//! Every frame on the bus carries an ID and a payload of up to 8 bytes
//! (classical CAN) or 64 bytes (CAN-FD). Lower IDs win bus arbitration, so
//! this crate's fixed-addressing scheme puts network-management traffic at
//! the highest priority and reports at the lowest — see [`can::CanId`].

pub mod can;
pub mod config;
pub mod isotp;
pub mod node;
pub mod persist;
pub mod retry;

use colored::Color;
use fern::colors::ColoredLevelConfig;

/// Installs an ANSI-colored `log` backend to stdout. Safe to call more than
/// once; later calls are no-ops once a logger is already set.
pub fn setup_logging() {
    let colors_line = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::White)
        .debug(Color::Green)
        .trace(Color::Blue);

    let _ = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}{}[{}][{}] {}",
                format_args!(
                    "\x1B[{}m",
                    colors_line.get_color(&record.level()).to_fg_str()
                ),
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stdout())
        .apply();
}
