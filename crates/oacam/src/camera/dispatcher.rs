use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use oacam_capture::prelude::*;

use super::command::FrameView;
use super::{CallbackEntry, CallbackKind, Shared};
use crate::metrics::SessionCounters;

/// Runs user callbacks on the `oacam-callback` thread.
///
/// Never touches the device: buffers to requeue go back to the controller
/// through `returns`.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    returns: BoundedTx<(u64, BufferToken)>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, returns: BoundedTx<(u64, BufferToken)>) -> Self {
        Self { shared, returns }
    }

    pub(crate) fn run(self) {
        debug!("callback dispatcher started");
        loop {
            let shared = &self.shared;
            shared
                .callbacks
                .wait_non_empty(|| shared.callbacks_stopping());
            if shared.callbacks_stopping() {
                break;
            }
            match shared.callbacks.pop_head() {
                Some(entry) => self.deliver(entry),
                None if shared.callbacks.is_closed() => break,
                None => {}
            }
        }
        debug!("callback dispatcher exiting");
    }

    fn deliver(&self, entry: CallbackEntry) {
        let shared = &*self.shared;
        let waited = entry.queued_at.elapsed();
        let started = Instant::now();
        match shared.pool.slot(entry.slot) {
            Ok(slot) => {
                let len = entry.len.min(slot.len());
                let view = FrameView {
                    data: &slot[..len],
                    meta: entry.meta,
                };
                let callback = &entry.callback;
                if catch_unwind(AssertUnwindSafe(|| callback(view))).is_err() {
                    SessionCounters::bump(&shared.counters.callback_panics);
                    error!(sequence = entry.meta.sequence, "frame callback panicked");
                }
            }
            Err(err) => warn!(error = %err, "callback entry refers to a missing slot"),
        }
        shared.callback_metrics.record(started.elapsed());
        match entry.kind {
            CallbackKind::StreamFrame => {
                SessionCounters::bump(&shared.counters.frames_delivered);
                if shared.accepts_returns(entry.generation)
                    && self.returns.send((entry.generation, entry.token)) != SendOutcome::Ok
                {
                    warn!(token = entry.token.0, "buffer return queue rejected token");
                }
            }
            CallbackKind::Exposure => {
                SessionCounters::bump(&shared.counters.exposures_delivered);
            }
        }
        // Free the slot only after the callback is done with it.
        shared.pool.release(entry.slot);
        trace!(
            slot = entry.slot.0,
            waited_us = waited.as_micros() as u64,
            "frame delivered"
        );
    }
}
