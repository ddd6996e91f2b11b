//! Key derivation for one sliced transfer.
//!
//! Both sides derive every key locally from the same [`SliceAttrs`]; keys are
//! never exchanged.

use std::fmt;

use rendezvous_core::{FrameAndIter, ParsedKey, Result};

use crate::SliceAttrs;

/// Role of one message within a sliced transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    /// `[total_bytes, slice_size]`, tagged with the dead flag.
    TotalBytes,
    /// The whole value, when it fits in one slice.
    Direct,
    /// Dimension sizes.
    Shape,
    /// Byte length of each variable-length element.
    ElementSizes,
    /// Fixed-width chunk `i`, or variable-length element `i` sent whole.
    Data(u64),
    /// Slice `slice` of variable-length element `element`.
    ElementSlice { element: u64, slice: u64 },
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::TotalBytes => f.write_str("_slice_transfer_totalbytes"),
            Slot::Direct => f.write_str("_transfer_data"),
            Slot::Shape => f.write_str("_slice_transfer_shape"),
            Slot::ElementSizes => f.write_str("_slice_transfer_elements_size"),
            Slot::Data(index) => write!(f, "_slice_transfer_data_{index}"),
            Slot::ElementSlice { element, slice } => {
                write!(f, "_slice_transfer_data_{element}_{slice}")
            }
        }
    }
}

/// `{send_device};{incarnation:016x};{recv_device};{tensor_name}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// The prefix shared by every key of one channel.
    pub fn new(
        send_device: &str,
        send_device_incarnation: u64,
        recv_device: &str,
        tensor_name: &str,
    ) -> Self {
        Self(format!(
            "{send_device};{send_device_incarnation:016x};{recv_device};{tensor_name}"
        ))
    }

    /// The prefix for a channel's attributes.
    pub fn from_attrs(attrs: &SliceAttrs) -> Self {
        Self::new(
            &attrs.send_device,
            attrs.send_device_incarnation,
            &attrs.recv_device,
            &attrs.tensor_name,
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key string for `slot`, without parsing it.
    pub fn key_string(&self, slot: Slot, frame_iter: FrameAndIter) -> String {
        format!("{}{slot};{frame_iter}", self.0)
    }

    /// The parsed key for `slot`.
    pub fn key(&self, slot: Slot, frame_iter: FrameAndIter) -> Result<ParsedKey> {
        ParsedKey::parse(&self.key_string(slot, frame_iter))
    }
}
