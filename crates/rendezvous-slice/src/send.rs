//! Producer side of a sliced transfer.

use bytes::Bytes;
use rendezvous_core::{
    Args, Array, ArrayData, DataType, Error, FrameAndIter, Rendezvous, Result, Shape,
};

use crate::slicing::{slice_count, slices};
use crate::{KeyPrefix, SessionContext, SliceAttrs, Slot};

/// Splits one array into bounded messages and sends them.
///
/// Sending never blocks, so neither does [`SliceSender::send`].
#[derive(Clone, Debug)]
pub struct SliceSender {
    attrs: SliceAttrs,
    prefix: KeyPrefix,
}

impl SliceSender {
    /// A sender for the channel described by `attrs`; fails on invalid attributes.
    pub fn new(attrs: SliceAttrs) -> Result<Self> {
        attrs.validate()?;
        let prefix = KeyPrefix::from_attrs(&attrs);
        Ok(Self { attrs, prefix })
    }

    pub fn attrs(&self) -> &SliceAttrs {
        &self.attrs
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.prefix
    }

    /// Send `value` to the matching [`SliceReceiver`](crate::SliceReceiver).
    ///
    /// A dead value only announces a total of zero bytes, tagged dead.
    pub fn send<R>(
        &self,
        rendezvous: &R,
        ctx: &SessionContext,
        value: &Array,
        is_dead: bool,
    ) -> Result<()>
    where
        R: Rendezvous + ?Sized,
    {
        let frame_iter = ctx.resolve_frame_iter(self.attrs.hostmem_sendrecv);
        let slice_size = self.attrs.slice_size;

        if !is_dead && value.dtype() != self.attrs.dtype {
            return Err(Error::invalid_argument(format!(
                "{} is configured as {}, got a {} value",
                self.attrs.tensor_name,
                self.attrs.dtype,
                value.dtype()
            )));
        }

        let total_bytes = if is_dead { 0 } else { value.total_bytes() };
        tracing::debug!(
            tensor = %self.attrs.tensor_name,
            %frame_iter,
            total_bytes,
            slice_size,
            is_dead,
            "sliced send"
        );

        let meta_args = ctx.metadata_args();
        let header = Array::i64_vector(&[to_i64(total_bytes)?, to_i64(slice_size)?]);
        self.send_slot(rendezvous, Slot::TotalBytes, frame_iter, &meta_args, header, is_dead)?;
        if is_dead {
            return Ok(());
        }

        if total_bytes <= slice_size {
            return self.send_slot(rendezvous, Slot::Direct, frame_iter, &ctx.args, value.clone(), false);
        }

        let dims = value
            .shape()
            .dims()
            .iter()
            .map(|&d| to_i64(d))
            .collect::<Result<Vec<_>>>()?;
        self.send_slot(rendezvous, Slot::Shape, frame_iter, &meta_args, Array::i64_vector(&dims), false)?;

        match value.data() {
            ArrayData::Variable(elements) => {
                self.send_elements(rendezvous, ctx, frame_iter, value.shape(), elements)
            }
            ArrayData::Fixed(bytes) => self.send_chunks(rendezvous, ctx, frame_iter, bytes),
        }
    }

    fn send_elements<R>(
        &self,
        rendezvous: &R,
        ctx: &SessionContext,
        frame_iter: FrameAndIter,
        shape: &Shape,
        elements: &[Bytes],
    ) -> Result<()>
    where
        R: Rendezvous + ?Sized,
    {
        let slice_size = self.attrs.slice_size;

        let sizes = elements
            .iter()
            .map(|e| to_i64(e.len() as u64))
            .collect::<Result<Vec<_>>>()?;
        let sizes = Array::from_i64s(shape.clone(), &sizes)?;
        self.send_slot(rendezvous, Slot::ElementSizes, frame_iter, &ctx.metadata_args(), sizes, false)?;

        for (index, element) in elements.iter().enumerate() {
            let index = index as u64;
            let len = element.len() as u64;
            if len <= slice_size {
                let whole = Array::string_scalar(element.clone());
                self.send_slot(rendezvous, Slot::Data(index), frame_iter, &ctx.args, whole, false)?;
                continue;
            }

            tracing::trace!(element = index, len, slices = slice_count(len, slice_size), "slicing element");
            for (slice, range) in slices(len, slice_size) {
                let part = Array::string_scalar(element.slice(range));
                let slot = Slot::ElementSlice { element: index, slice };
                self.send_slot(rendezvous, slot, frame_iter, &ctx.args, part, false)?;
            }
        }
        Ok(())
    }

    fn send_chunks<R>(
        &self,
        rendezvous: &R,
        ctx: &SessionContext,
        frame_iter: FrameAndIter,
        bytes: &Bytes,
    ) -> Result<()>
    where
        R: Rendezvous + ?Sized,
    {
        for (index, range) in slices(bytes.len() as u64, self.attrs.slice_size) {
            let len = range.len() as u64;
            let chunk = Array::from_bytes(DataType::UInt8, Shape::vector(len), bytes.slice(range))?;
            self.send_slot(rendezvous, Slot::Data(index), frame_iter, &ctx.args, chunk, false)?;
        }
        Ok(())
    }

    fn send_slot<R>(
        &self,
        rendezvous: &R,
        slot: Slot,
        frame_iter: FrameAndIter,
        args: &Args,
        value: Array,
        is_dead: bool,
    ) -> Result<()>
    where
        R: Rendezvous + ?Sized,
    {
        let key = self.prefix.key(slot, frame_iter)?;
        tracing::trace!(%key, "slice send");
        rendezvous.send(&key, args, value, is_dead)
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::invalid_argument(format!("{value} does not fit in int64")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_core::{LocalRendezvous, ParsedKey};

    fn sender(dtype: DataType, slice_size: u64) -> SliceSender {
        SliceSender::new(
            SliceAttrs::new("/cpu:0", 7, "/cpu:1", "t", dtype).with_slice_size(slice_size),
        )
        .unwrap()
    }

    #[test]
    fn rejects_wrong_dtype() {
        let table = LocalRendezvous::new();
        let value = Array::i64_vector(&[1, 2]);
        let err = sender(DataType::Float32, 4)
            .send(&*table, &SessionContext::default(), &value, false)
            .unwrap_err();
        assert_eq!(err.code(), rendezvous_core::ErrorCode::InvalidArgument);
        assert_eq!(table.pending_len(), 0);
    }

    #[test]
    fn dead_value_only_sends_header() {
        let table = LocalRendezvous::new();
        sender(DataType::Float32, 4)
            .send(&*table, &SessionContext::default(), &Array::empty(DataType::Float32), true)
            .unwrap();
        assert_eq!(table.pending_len(), 1);
    }

    #[test]
    fn small_value_takes_direct_path() {
        let table = LocalRendezvous::new();
        let value = Array::from_bytes(DataType::UInt8, Shape::vector(4), vec![1u8, 2, 3, 4]).unwrap();
        sender(DataType::UInt8, 4)
            .send(&*table, &SessionContext::default(), &value, false)
            .unwrap();
        // header + direct
        assert_eq!(table.pending_len(), 2);
    }

    #[test]
    fn large_fixed_value_is_chunked() {
        let table = LocalRendezvous::new();
        let value = Array::from_bytes(DataType::UInt8, Shape::vector(13), vec![0u8; 13]).unwrap();
        sender(DataType::UInt8, 4)
            .send(&*table, &SessionContext::default(), &value, false)
            .unwrap();
        // header + shape + 4 chunks
        assert_eq!(table.pending_len(), 6);
    }

    #[test]
    fn init_rejects_bad_attrs() {
        let err = SliceSender::new(SliceAttrs::new("/cpu:0", 7, "/cpu:1", "t", DataType::Int8).with_slice_size(0))
            .unwrap_err();
        assert_eq!(err.code(), rendezvous_core::ErrorCode::InvalidArgument);
    }

    #[test]
    fn prefix_matches_attrs() {
        let s = sender(DataType::Int8, 4);
        let key = s.prefix().key(Slot::Shape, FrameAndIter::new(1, 2)).unwrap();
        assert_eq!(
            key,
            ParsedKey::from_parts("/cpu:0", 7, "/cpu:1", "t_slice_transfer_shape", FrameAndIter::new(1, 2))
                .unwrap()
        );
    }
}
