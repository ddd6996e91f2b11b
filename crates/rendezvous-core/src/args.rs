//! Side-specific arguments exchanged between producer and consumer.
//!
//! The table hands both sides' [`Args`] to the receiver but never looks
//! inside them.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::BytesMut;

use crate::{CancellationManager, Error, Result};

bitflags! {
    /// Allocation hints for buffers produced or consumed by a device.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AllocAttrs: u32 {
        /// Buffer must live in host memory.
        const ON_HOST = 0b0000_0001;
        /// Buffer must be usable by a network interface.
        const NIC_COMPATIBLE = 0b0000_0010;
        /// Buffer must be usable by an accelerator.
        const GPU_COMPATIBLE = 0b0000_0100;
    }
}

/// Copy and allocation capabilities of the device on one side of a channel.
///
/// The transfer drivers allocate destination buffers and copy chunk bytes
/// through this trait, so they stay independent of any execution backend.
pub trait DeviceContext: Send + Sync + fmt::Debug {
    /// Name of the device this context belongs to.
    fn device(&self) -> &str;

    /// Allocate a zeroed buffer of `len` bytes.
    fn allocate(&self, len: usize, attrs: AllocAttrs) -> Result<BytesMut> {
        let _ = attrs;
        Ok(BytesMut::zeroed(len))
    }

    /// Copy `src` into `dst`; both must have the same length.
    fn copy_into(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        if src.len() != dst.len() {
            return Err(Error::internal(format!(
                "copy length mismatch: {} source bytes into {} destination bytes",
                src.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Plain host-memory device context.
#[derive(Clone, Debug)]
pub struct HostContext {
    device: String,
}

impl HostContext {
    /// A host context reporting itself as `device`.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new("/device:CPU:0")
    }
}

impl DeviceContext for HostContext {
    fn device(&self) -> &str {
        &self.device
    }
}

/// Arguments supplied by one side of a send/receive pair.
#[derive(Clone, Default)]
pub struct Args {
    pub device_context: Option<Arc<dyn DeviceContext>>,
    pub alloc_attrs: AllocAttrs,
    /// Only meaningful for receives: cancelling it resolves the pending
    /// receive with a `Canceled` error.
    pub cancellation: Option<Arc<CancellationManager>>,
}

impl Args {
    /// Host memory, no allocation hints, not cancellable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and copy through `ctx` instead of host memory.
    pub fn with_device_context(mut self, ctx: Arc<dyn DeviceContext>) -> Self {
        self.device_context = Some(ctx);
        self
    }

    /// Set the allocation hints passed to [`DeviceContext::allocate`].
    pub fn with_alloc_attrs(mut self, attrs: AllocAttrs) -> Self {
        self.alloc_attrs = attrs;
        self
    }

    /// Let `cancellation` withdraw receives made with these args.
    pub fn with_cancellation(mut self, cancellation: Arc<CancellationManager>) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// The device context, falling back to host memory.
    pub fn device_context_or_host(&self) -> Arc<dyn DeviceContext> {
        match &self.device_context {
            Some(ctx) => Arc::clone(ctx),
            None => Arc::new(HostContext::default()),
        }
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field(
                "device",
                &self.device_context.as_ref().map(|ctx| ctx.device().to_owned()),
            )
            .field("alloc_attrs", &self.alloc_attrs)
            .field("cancellable", &self.cancellation.is_some())
            .finish()
    }
}
