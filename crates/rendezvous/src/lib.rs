#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

// Re-export core types
pub use rendezvous_core::{
    // Capabilities each side brings
    AllocAttrs,
    Args,
    // Values
    Array,
    ArrayData,
    CancellationManager,
    CancellationToken,
    DataType,
    Delivery,
    DeviceContext,
    DeviceName,
    DoneCallback,
    // Error types
    Error,
    ErrorCode,
    // Keys
    FrameAndIter,
    FuseDoneCallback,
    HostContext,
    // Tables
    LocalRendezvous,
    ParsedKey,
    Rendezvous,
    RendezvousExt,
    Result,
    Shape,
};

// Re-export the sliced transfer drivers
pub use rendezvous_slice::{
    DEFAULT_SLICE_SIZE, DEFAULT_TIMEOUT, KeyPrefix, Received, SessionContext, SliceAttrs,
    SliceReceiver, SliceSender, Slot,
};

// Re-export bytes so callers build array payloads against the same version.
pub use bytes;

#[doc(hidden)]
pub extern crate tracing;

/// Prelude module for convenient imports.
///
/// ```
/// use rendezvous::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Args, Array, DataType, Error, ErrorCode, FrameAndIter, LocalRendezvous, Rendezvous,
        RendezvousExt, SessionContext, Shape, SliceAttrs, SliceReceiver, SliceSender,
    };
}
