//! Array values carried by rendezvous messages.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::{Error, Result};

/// Element type of an [`Array`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// Variable-length byte strings.
    String,
}

impl DataType {
    /// Width of one element in bytes, or `None` for variable-length types.
    pub fn size(self) -> Option<usize> {
        Some(match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
            DataType::String => return None,
        })
    }

    /// Whether elements carry their own length (`String`).
    pub fn is_variable_length(self) -> bool {
        self.size().is_none()
    }

    /// Lowercase type name, as used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dimension sizes of an array. A rank-0 shape is a scalar.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Shape(Vec<u64>);

impl Shape {
    /// A shape with the given dimension sizes, outermost first.
    pub fn new(dims: impl Into<Vec<u64>>) -> Self {
        Self(dims.into())
    }

    /// The rank-0 shape of a single element.
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    /// A rank-1 shape of `len` elements.
    pub fn vector(len: u64) -> Self {
        Self(vec![len])
    }

    pub fn dims(&self) -> &[u64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of the dimensions. Fails on overflow.
    pub fn num_elements(&self) -> Result<u64> {
        self.0.iter().try_fold(1u64, |acc, &d| {
            acc.checked_mul(d)
                .ok_or_else(|| Error::invalid_argument(format!("shape {self} overflows u64")))
        })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Storage behind an [`Array`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrayData {
    /// Flat little-endian buffer of fixed-width elements.
    Fixed(Bytes),
    /// One buffer per variable-length element, in row-major order.
    Variable(Vec<Bytes>),
}

/// A typed, shaped value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Array {
    dtype: DataType,
    shape: Shape,
    data: ArrayData,
}

impl Array {
    /// Build a fixed-width array over `data`, which must hold exactly
    /// `shape.num_elements() * dtype.size()` bytes.
    pub fn from_bytes(dtype: DataType, shape: Shape, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let Some(width) = dtype.size() else {
            return Err(Error::invalid_argument(format!(
                "{dtype} is variable-length; use Array::from_elements"
            )));
        };
        let expected = byte_len(&shape, width)?;
        if data.len() as u64 != expected {
            return Err(Error::invalid_argument(format!(
                "{dtype}{shape} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data: ArrayData::Fixed(data),
        })
    }

    /// Build a string array; `elements` are in row-major order.
    pub fn from_elements(shape: Shape, elements: Vec<Bytes>) -> Result<Self> {
        let expected = shape.num_elements()?;
        if elements.len() as u64 != expected {
            return Err(Error::invalid_argument(format!(
                "string{shape} needs {expected} elements, got {}",
                elements.len()
            )));
        }
        Ok(Self {
            dtype: DataType::String,
            shape,
            data: ArrayData::Variable(elements),
        })
    }

    /// A scalar string.
    pub fn string_scalar(value: impl Into<Bytes>) -> Self {
        Self {
            dtype: DataType::String,
            shape: Shape::scalar(),
            data: ArrayData::Variable(vec![value.into()]),
        }
    }

    /// An `Int64` array of the given shape.
    pub fn from_i64s(shape: Shape, values: &[i64]) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(DataType::Int64, shape, buf.freeze())
    }

    /// An `Int64` vector.
    pub fn i64_vector(values: &[i64]) -> Self {
        let mut buf = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            dtype: DataType::Int64,
            shape: Shape::vector(values.len() as u64),
            data: ArrayData::Fixed(buf.freeze()),
        }
    }

    /// An empty placeholder, as carried by dead messages.
    pub fn empty(dtype: DataType) -> Self {
        let data = match dtype {
            DataType::String => ArrayData::Variable(Vec::new()),
            _ => ArrayData::Fixed(Bytes::new()),
        };
        Self {
            dtype,
            shape: Shape::vector(0),
            data,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Number of elements actually stored.
    pub fn num_elements(&self) -> usize {
        match &self.data {
            ArrayData::Fixed(bytes) => bytes.len() / self.dtype.size().unwrap_or(1).max(1),
            ArrayData::Variable(elements) => elements.len(),
        }
    }

    /// Payload size: the buffer length for fixed-width arrays, the sum of
    /// element lengths for string arrays.
    pub fn total_bytes(&self) -> u64 {
        match &self.data {
            ArrayData::Fixed(bytes) => bytes.len() as u64,
            ArrayData::Variable(elements) => elements.iter().map(|e| e.len() as u64).sum(),
        }
    }

    /// The flat buffer of a fixed-width array.
    pub fn as_bytes(&self) -> Result<&Bytes> {
        match &self.data {
            ArrayData::Fixed(bytes) => Ok(bytes),
            ArrayData::Variable(_) => Err(Error::invalid_argument(format!(
                "expected a fixed-width array, got {}",
                self.dtype
            ))),
        }
    }

    /// The elements of a string array.
    pub fn as_elements(&self) -> Result<&[Bytes]> {
        match &self.data {
            ArrayData::Variable(elements) => Ok(elements),
            ArrayData::Fixed(_) => Err(Error::invalid_argument(format!(
                "expected a string array, got {}",
                self.dtype
            ))),
        }
    }

    /// The single element of a scalar string.
    pub fn as_string_scalar(&self) -> Result<&Bytes> {
        match self.as_elements()? {
            [only] => Ok(only),
            other => Err(Error::invalid_argument(format!(
                "expected one string element, got {}",
                other.len()
            ))),
        }
    }

    /// Decode an `Int64` array.
    pub fn to_i64s(&self) -> Result<Vec<i64>> {
        if self.dtype != DataType::Int64 {
            return Err(Error::invalid_argument(format!(
                "expected int64, got {}",
                self.dtype
            )));
        }
        let bytes = self.as_bytes()?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut le = [0u8; 8];
                le.copy_from_slice(c);
                i64::from_le_bytes(le)
            })
            .collect())
    }
}

fn byte_len(shape: &Shape, width: usize) -> Result<u64> {
    shape.num_elements()?.checked_mul(width as u64).ok_or_else(|| {
        Error::invalid_argument(format!("shape {shape} with {width}-byte elements overflows"))
    })
}

/// Number of bytes a fixed-width array of `dtype` and `shape` occupies.
pub fn fixed_byte_len(dtype: DataType, shape: &Shape) -> Result<u64> {
    let width = dtype.size().ok_or_else(|| {
        Error::invalid_argument(format!("{dtype} has no fixed element width"))
    })?;
    byte_len(shape, width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_array_checks_length() {
        let ok = Array::from_bytes(DataType::Int32, Shape::new([2, 3]), vec![0u8; 24]).unwrap();
        assert_eq!(ok.total_bytes(), 24);
        assert_eq!(ok.num_elements(), 6);

        let err = Array::from_bytes(DataType::Int32, Shape::new([2, 3]), vec![0u8; 23]).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);
    }

    #[test]
    fn string_total_bytes_is_sum_of_elements() {
        let arr = Array::from_elements(
            Shape::vector(3),
            vec![Bytes::from_static(b"ab"), Bytes::new(), Bytes::from_static(b"cde")],
        )
        .unwrap();
        assert_eq!(arr.total_bytes(), 5);
        assert_eq!(arr.num_elements(), 3);
        assert!(arr.as_bytes().is_err());
    }

    #[test]
    fn i64_roundtrip() {
        let arr = Array::i64_vector(&[13, -1, i64::MAX]);
        assert_eq!(arr.shape(), &Shape::vector(3));
        assert_eq!(arr.to_i64s().unwrap(), vec![13, -1, i64::MAX]);
    }

    #[test]
    fn scalar_has_one_element() {
        assert_eq!(Shape::scalar().num_elements().unwrap(), 1);
        assert_eq!(Shape::new([4, 0, 2]).num_elements().unwrap(), 0);
        assert!(Shape::new([u64::MAX, 2]).num_elements().is_err());
    }

    #[test]
    fn empty_placeholder_has_no_bytes() {
        assert_eq!(Array::empty(DataType::Float32).total_bytes(), 0);
        assert_eq!(Array::empty(DataType::String).total_bytes(), 0);
    }
}
