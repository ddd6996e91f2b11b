//! Consumer side of a sliced transfer.

use bytes::Bytes;
use rendezvous_core::{
    Args, Array, DataType, DeviceContext, Error, FrameAndIter, Rendezvous, RendezvousExt, Result,
    Shape, fixed_byte_len,
};

use crate::slicing::{slice_range, slices};
use crate::{KeyPrefix, SessionContext, SliceAttrs, Slot};

/// A reassembled value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub value: Array,
    pub is_dead: bool,
}

/// Receives the messages of one sliced transfer and reassembles the value.
#[derive(Clone, Debug)]
pub struct SliceReceiver {
    attrs: SliceAttrs,
    prefix: KeyPrefix,
}

/// Per-session state shared by the receive steps.
struct Session<'a, R: ?Sized> {
    rendezvous: &'a R,
    attrs: &'a SliceAttrs,
    prefix: &'a KeyPrefix,
    frame_iter: FrameAndIter,
    data_args: &'a Args,
    meta_args: Args,
}

impl SliceReceiver {
    /// A receiver for the channel described by `attrs`; fails on invalid attributes.
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

    /// Wait for the value sent by the matching
    /// [`SliceSender`](crate::SliceSender).
    ///
    /// Each step waits at most the configured timeout. Any failure ends the
    /// session; no partial value is returned.
    pub async fn recv<R>(&self, rendezvous: &R, ctx: &SessionContext) -> Result<Received>
    where
        R: Rendezvous + ?Sized,
    {
        let session = Session {
            rendezvous,
            attrs: &self.attrs,
            prefix: &self.prefix,
            frame_iter: ctx.resolve_frame_iter(self.attrs.hostmem_sendrecv),
            data_args: &ctx.args,
            meta_args: ctx.metadata_args(),
        };
        session.run(ctx.args.device_context_or_host().as_ref()).await
    }
}

impl<R: Rendezvous + ?Sized> Session<'_, R> {
    async fn run(&self, device: &dyn DeviceContext) -> Result<Received> {
        let slice_size = self.attrs.slice_size;
        let dtype = self.attrs.dtype;

        let header = self.step(Slot::TotalBytes, &self.meta_args, true).await?;
        if header.is_dead {
            tracing::debug!(tensor = %self.attrs.tensor_name, frame_iter = %self.frame_iter, "dead value");
            return Ok(Received {
                value: Array::empty(dtype),
                is_dead: true,
            });
        }
        let total_bytes = self.read_header(&header.value)?;
        tracing::debug!(
            tensor = %self.attrs.tensor_name,
            frame_iter = %self.frame_iter,
            total_bytes,
            slice_size,
            "sliced recv"
        );

        if total_bytes <= slice_size {
            let value = self.step(Slot::Direct, self.data_args, false).await?.value;
            if value.dtype() != dtype {
                return Err(Error::internal(format!(
                    "{} expected {dtype}, got {}",
                    self.attrs.tensor_name,
                    value.dtype()
                )));
            }
            check_len("direct value", total_bytes, value.total_bytes())?;
            return Ok(Received {
                value,
                is_dead: false,
            });
        }

        let shape = self.recv_shape().await?;
        let value = if dtype.is_variable_length() {
            self.recv_elements(device, shape, total_bytes).await?
        } else {
            self.recv_chunks(device, shape, total_bytes).await?
        };
        Ok(Received {
            value,
            is_dead: false,
        })
    }

    /// Receive one message. A dead flag is only legal on the header.
    async fn step(&self, slot: Slot, args: &Args, allow_dead: bool) -> Result<Received> {
        let key = self.prefix.key(slot, self.frame_iter)?;
        tracing::trace!(%key, "slice recv");
        let delivery = self
            .rendezvous
            .recv(&key, args, Some(self.attrs.timeout))
            .await?;
        if delivery.is_dead && !allow_dead {
            return Err(Error::internal(format!("unexpected dead value on {key}")));
        }
        Ok(Received {
            value: delivery.value,
            is_dead: delivery.is_dead,
        })
    }

    /// `[total_bytes, slice_size]`
    fn read_header(&self, header: &Array) -> Result<u64> {
        let header = header
            .to_i64s()
            .map_err(|e| Error::internal(e.message()).context("total bytes header"))?;
        let &[total_bytes, peer_slice_size] = header.as_slice() else {
            return Err(Error::internal(format!(
                "total bytes header has {} entries, expected 2",
                header.len()
            )));
        };
        let total_bytes = u64::try_from(total_bytes)
            .map_err(|_| Error::internal(format!("negative total bytes {total_bytes}")))?;
        if u64::try_from(peer_slice_size).ok() != Some(self.attrs.slice_size) {
            return Err(Error::invalid_argument(format!(
                "{}: sender slices by {peer_slice_size} bytes, receiver by {}",
                self.attrs.tensor_name, self.attrs.slice_size
            )));
        }
        Ok(total_bytes)
    }

    async fn recv_shape(&self) -> Result<Shape> {
        let value = self.step(Slot::Shape, &self.meta_args, false).await?.value;
        let dims = value
            .to_i64s()
            .map_err(|e| Error::internal(e.message()).context("shape"))?
            .into_iter()
            .map(|d| u64::try_from(d).map_err(|_| Error::internal(format!("negative dimension {d}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Shape::new(dims))
    }

    async fn recv_chunks(
        &self,
        device: &dyn DeviceContext,
        shape: Shape,
        total_bytes: u64,
    ) -> Result<Array> {
        let dtype = self.attrs.dtype;
        let expected = fixed_byte_len(dtype, &shape).map_err(|e| Error::internal(e.message()))?;
        check_len(&format!("{dtype}{shape}"), total_bytes, expected)?;

        let mut buf = device.allocate(to_usize(total_bytes)?, self.data_args.alloc_attrs)?;
        for (index, range) in slices(total_bytes, self.attrs.slice_size) {
            let chunk = self.step(Slot::Data(index), self.data_args, false).await?.value;
            let bytes = chunk
                .as_bytes()
                .map_err(|e| Error::internal(e.message()).context(format!("chunk {index}")))?;
            check_len(&format!("chunk {index}"), range.len() as u64, bytes.len() as u64)?;
            device.copy_into(bytes, &mut buf[range])?;
        }

        Array::from_bytes(dtype, shape, buf.freeze()).map_err(|e| Error::internal(e.message()))
    }

    async fn recv_elements(
        &self,
        device: &dyn DeviceContext,
        shape: Shape,
        total_bytes: u64,
    ) -> Result<Array> {
        let slice_size = self.attrs.slice_size;

        let sizes = self.step(Slot::ElementSizes, &self.meta_args, false).await?.value;
        if sizes.shape() != &shape {
            return Err(Error::internal(format!(
                "element sizes have shape {}, value has shape {shape}",
                sizes.shape()
            )));
        }
        let sizes = sizes
            .to_i64s()
            .map_err(|e| Error::internal(e.message()).context("element sizes"))?
            .into_iter()
            .map(|s| u64::try_from(s).map_err(|_| Error::internal(format!("negative element size {s}"))))
            .collect::<Result<Vec<_>>>()?;
        check_len("element sizes", total_bytes, sizes.iter().sum())?;

        let mut elements = Vec::with_capacity(sizes.len());
        for (index, &len) in sizes.iter().enumerate() {
            let index = index as u64;
            if len <= slice_size {
                let element = self.recv_string(Slot::Data(index)).await?;
                check_len(&format!("element {index}"), len, element.len() as u64)?;
                elements.push(element);
                continue;
            }

            let mut buf = device.allocate(to_usize(len)?, self.data_args.alloc_attrs)?;
            for (slice, range) in slices(len, slice_size) {
                let part = self.recv_string(Slot::ElementSlice { element: index, slice }).await?;
                let expected = slice_range(slice, len, slice_size);
                check_len(
                    &format!("element {index} slice {slice}"),
                    expected.end - expected.start,
                    part.len() as u64,
                )?;
                device.copy_into(&part, &mut buf[range])?;
            }
            elements.push(buf.freeze());
        }

        Array::from_elements(shape, elements).map_err(|e| Error::internal(e.message()))
    }

    async fn recv_string(&self, slot: Slot) -> Result<Bytes> {
        let value = self.step(slot, self.data_args, false).await?.value;
        if value.dtype() != DataType::String {
            return Err(Error::internal(format!("{slot} carried {}, expected string", value.dtype())));
        }
        value
            .as_string_scalar()
            .cloned()
            .map_err(|e| Error::internal(e.message()).context(slot))
    }
}

fn check_len(what: &str, expected: u64, actual: u64) -> Result<()> {
    if expected != actual {
        return Err(Error::internal(format!(
            "{what}: expected {expected} bytes, got {actual}"
        )));
    }
    Ok(())
}

fn to_usize(len: u64) -> Result<usize> {
    usize::try_from(len).map_err(|_| Error::internal(format!("{len} bytes do not fit in memory")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_core::{ErrorCode, LocalRendezvous};

    fn receiver(dtype: DataType, slice_size: u64) -> SliceReceiver {
        SliceReceiver::new(
            SliceAttrs::new("/cpu:0", 7, "/cpu:1", "t", dtype)
                .with_slice_size(slice_size)
                .with_timeout(std::time::Duration::from_secs(5)),
        )
        .unwrap()
    }

    fn key(r: &SliceReceiver, slot: Slot) -> rendezvous_core::ParsedKey {
        r.prefix().key(slot, FrameAndIter::default()).unwrap()
    }

    #[tokio::test]
    async fn negative_total_is_internal() {
        let table = LocalRendezvous::new();
        let r = receiver(DataType::UInt8, 4);
        table
            .send(&key(&r, Slot::TotalBytes), &Args::new(), Array::i64_vector(&[-1, 4]), false)
            .unwrap();
        let err = r.recv(&*table, &SessionContext::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn dead_after_header_is_internal() {
        let table = LocalRendezvous::new();
        let r = receiver(DataType::UInt8, 4);
        table
            .send(&key(&r, Slot::TotalBytes), &Args::new(), Array::i64_vector(&[2, 4]), false)
            .unwrap();
        table
            .send(&key(&r, Slot::Direct), &Args::new(), Array::empty(DataType::UInt8), true)
            .unwrap();
        let err = r.recv(&*table, &SessionContext::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn short_chunk_is_internal() {
        let table = LocalRendezvous::new();
        let r = receiver(DataType::UInt8, 4);
        let args = Args::new();
        table
            .send(&key(&r, Slot::TotalBytes), &args, Array::i64_vector(&[6, 4]), false)
            .unwrap();
        table
            .send(&key(&r, Slot::Shape), &args, Array::i64_vector(&[6]), false)
            .unwrap();
        let short = Array::from_bytes(DataType::UInt8, Shape::vector(3), vec![1u8, 2, 3]).unwrap();
        table.send(&key(&r, Slot::Data(0)), &args, short, false).unwrap();

        let err = r.recv(&*table, &SessionContext::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn shape_disagreeing_with_total_is_internal() {
        let table = LocalRendezvous::new();
        let r = receiver(DataType::Int32, 4);
        let args = Args::new();
        table
            .send(&key(&r, Slot::TotalBytes), &args, Array::i64_vector(&[8, 4]), false)
            .unwrap();
        table
            .send(&key(&r, Slot::Shape), &args, Array::i64_vector(&[3]), false)
            .unwrap();

        let err = r.recv(&*table, &SessionContext::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn malformed_header_is_internal() {
        let table = LocalRendezvous::new();
        let r = receiver(DataType::UInt8, 4);
        table
            .send(&key(&r, Slot::TotalBytes), &Args::new(), Array::i64_vector(&[3]), false)
            .unwrap();
        let err = r.recv(&*table, &SessionContext::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
