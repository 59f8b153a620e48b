//! Bounded retry for transient `CanEndpoint::send` backpressure.
//!
//! Generalizes the teacher's `ShouldRetry` trait (there: "is this I/O error
//! actually a socket timeout") from OS error codes to the single condition
//! this crate's CAN endpoint can report: `SendOutcome::Again`. spec.md §6
//! requires `AGAIN` be retried up to N times (default 3) before surfacing as
//! `DRIVER_ERR`; original_source/src/can.c's `can_send_with_retry` is the
//! same idea at the driver-glue layer.

use crate::can::{CanEndpoint, CanError, CanFrame, SendCompletion, SendOutcome};
use std::sync::Arc;

/// Calls `endpoint.send(frame, ..)`, retrying while the endpoint reports
/// `SendOutcome::Again`, up to `max_retries` additional attempts. `completion`
/// is wrapped in a fresh `Box<dyn FnOnce>` for each attempt (the `CanEndpoint`
/// trait takes ownership of one per call) but is only ever actually invoked
/// once: either by the driver once it accepts the frame, or by this function
/// once retries are exhausted or a hard error is returned.
pub fn send_with_retry(
    endpoint: &mut dyn CanEndpoint,
    frame: &CanFrame,
    max_retries: u8,
    completion: Arc<dyn Fn(SendCompletion) + Send + Sync>,
) -> Result<(), CanError> {
    let mut attempt = 0;
    loop {
        let c = completion.clone();
        match endpoint.send(frame, Box::new(move |r| c(r))) {
            Ok(SendOutcome::Ok) => return Ok(()),
            Ok(SendOutcome::Again) if attempt < max_retries => {
                attempt += 1;
                continue;
            }
            Ok(SendOutcome::Again) => {
                completion(Err(CanError::Driver));
                return Err(CanError::Driver);
            }
            Err(e) => {
                completion(Err(e));
                return Err(e);
            }
        }
    }
}
