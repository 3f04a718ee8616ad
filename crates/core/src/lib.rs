#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod controls;
pub mod format;
pub mod metrics;
pub mod queue;

pub mod prelude {
    pub use crate::{
        buffer::{FrameMeta, FramePool, FramePoolMetrics, PoolError, SlotIndex},
        controls::{
            Access, ControlCheckError, ControlFlags, ControlId, ControlKind, ControlMeta,
            ControlTable, ControlValue,
        },
        format::{FourCc, Interval, MediaFormat, Resolution},
        metrics::PoolCounters,
        queue::{BoundedRx, BoundedTx, RecvOutcome, SendOutcome, SyncQueue, bounded},
    };
}
