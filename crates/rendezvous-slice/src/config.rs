//! Channel attributes and per-session context.

use std::time::Duration;

use rendezvous_core::{AllocAttrs, Args, DataType, DeviceName, Error, FrameAndIter, Result};

/// Default maximum bytes carried by one message (4 MiB).
pub const DEFAULT_SLICE_SIZE: u64 = 4 * 1024 * 1024;

/// Default per-step receive timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Attributes shared by both ends of a sliced channel.
///
/// Producer and consumer must be built from equal attributes: every derived
/// key depends on them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceAttrs {
    pub send_device: String,
    pub send_device_incarnation: u64,
    pub recv_device: String,
    pub tensor_name: String,
    pub dtype: DataType,
    /// Largest payload sent in one message, in bytes.
    pub slice_size: u64,
    /// Receive timeout, applied to each step separately.
    pub timeout: Duration,
    /// Host-memory send/recv pair; keys use the call frame when one exists.
    pub hostmem_sendrecv: bool,
}

impl SliceAttrs {
    /// Attributes with the default slice size and timeout, not host-memory.
    pub fn new(
        send_device: impl Into<String>,
        send_device_incarnation: u64,
        recv_device: impl Into<String>,
        tensor_name: impl Into<String>,
        dtype: DataType,
    ) -> Self {
        Self {
            send_device: send_device.into(),
            send_device_incarnation,
            recv_device: recv_device.into(),
            tensor_name: tensor_name.into(),
            dtype,
            slice_size: DEFAULT_SLICE_SIZE,
            timeout: DEFAULT_TIMEOUT,
            hostmem_sendrecv: false,
        }
    }

    /// Set the largest payload per message, in bytes.
    pub fn with_slice_size(mut self, slice_size: u64) -> Self {
        self.slice_size = slice_size;
        self
    }

    /// Set the per-step receive timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the channel as a host-memory send/recv pair.
    pub fn with_hostmem_sendrecv(mut self, hostmem_sendrecv: bool) -> Self {
        self.hostmem_sendrecv = hostmem_sendrecv;
        self
    }

    /// Reject attributes no session can run with.
    pub fn validate(&self) -> Result<()> {
        if self.slice_size == 0 {
            return Err(Error::invalid_argument("slice_size must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(Error::invalid_argument("timeout must be positive"));
        }
        if self.tensor_name.is_empty() || self.tensor_name.contains(';') {
            return Err(Error::invalid_argument(format!(
                "tensor name {:?} must be non-empty and free of ';'",
                self.tensor_name
            )));
        }
        DeviceName::parse(&self.send_device)?;
        DeviceName::parse(&self.recv_device)?;
        Ok(())
    }
}

/// What the execution context supplies for one transfer.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    pub frame_iter: FrameAndIter,
    /// Id of the enclosing function call frame, if the transfer runs inside one.
    pub call_frame: Option<u64>,
    /// This side's arguments, used as-is for data messages.
    pub args: Args,
}

impl SessionContext {
    /// A context for `frame_iter` with default args and no call frame.
    pub fn new(frame_iter: FrameAndIter) -> Self {
        Self {
            frame_iter,
            ..Self::default()
        }
    }

    /// Run inside function call frame `call_frame`.
    pub fn with_call_frame(mut self, call_frame: u64) -> Self {
        self.call_frame = Some(call_frame);
        self
    }

    /// Use `args` for this side of the transfer.
    pub fn with_args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    /// The frame/iteration keys are derived from.
    ///
    /// Host-memory pairs inside a function call use the call frame, so each
    /// call gets its own keys.
    pub fn resolve_frame_iter(&self, hostmem_sendrecv: bool) -> FrameAndIter {
        match (hostmem_sendrecv, self.call_frame) {
            (true, Some(call_frame)) => FrameAndIter::new(call_frame, 0),
            _ => self.frame_iter,
        }
    }

    /// Arguments for metadata messages: same device and cancellation, no
    /// allocation hints.
    pub fn metadata_args(&self) -> Args {
        Args {
            alloc_attrs: AllocAttrs::empty(),
            ..self.args.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_core::ErrorCode;

    fn attrs() -> SliceAttrs {
        SliceAttrs::new("/cpu:0", 1, "/cpu:1", "t", DataType::Float32)
    }

    #[test]
    fn defaults_validate() {
        attrs().validate().unwrap();
    }

    #[test]
    fn zero_slice_size_or_timeout_rejected() {
        let err = attrs().with_slice_size(0).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = attrs().with_timeout(Duration::ZERO).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn bad_names_rejected() {
        let mut bad = attrs();
        bad.tensor_name = "a;b".into();
        assert!(bad.validate().is_err());

        let mut bad = attrs();
        bad.recv_device = "cpu1".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn call_frame_only_used_for_hostmem_pairs() {
        let ctx = SessionContext::new(FrameAndIter::new(3, 9)).with_call_frame(77);
        assert_eq!(ctx.resolve_frame_iter(false), FrameAndIter::new(3, 9));
        assert_eq!(ctx.resolve_frame_iter(true), FrameAndIter::new(77, 0));

        let ctx = SessionContext::new(FrameAndIter::new(3, 9));
        assert_eq!(ctx.resolve_frame_iter(true), FrameAndIter::new(3, 9));
    }

    #[test]
    fn metadata_args_drop_alloc_hints() {
        let ctx = SessionContext::default()
            .with_args(Args::new().with_alloc_attrs(AllocAttrs::GPU_COMPATIBLE));
        assert!(ctx.metadata_args().alloc_attrs.is_empty());
        assert_eq!(ctx.args.alloc_attrs, AllocAttrs::GPU_COMPATIBLE);
    }
}
