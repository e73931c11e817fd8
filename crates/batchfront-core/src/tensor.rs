use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::error::BatchError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }
}

#[derive(Clone, Debug)]
pub struct PinnedBuf {
    pub bytes: Bytes,
}

/// Owns the storage for a tensor. Host memory only; a view of a pinned
/// buffer stays pinned.
#[derive(Clone, Debug)]
pub enum TensorStorage {
    CpuBytes(Bytes),
    CpuPinned(PinnedBuf),
}

impl TensorStorage {
    pub fn bytes(&self) -> &Bytes {
        match self {
            TensorStorage::CpuBytes(bytes) => bytes,
            TensorStorage::CpuPinned(p) => &p.bytes,
        }
    }

    fn with_bytes(&self, bytes: Bytes) -> TensorStorage {
        match self {
            TensorStorage::CpuBytes(_) => TensorStorage::CpuBytes(bytes),
            TensorStorage::CpuPinned(_) => TensorStorage::CpuPinned(PinnedBuf { bytes }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Shape,
    pub storage: TensorStorage,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Result<Self, BatchError> {
        validate_byte_len(dtype, &shape, bytes.len())?;
        Ok(Self {
            dtype,
            shape,
            storage: TensorStorage::CpuBytes(bytes),
        })
    }

    pub fn from_pinned(dtype: DType, shape: Shape, buf: PinnedBuf) -> Result<Self, BatchError> {
        validate_byte_len(dtype, &shape, buf.bytes.len())?;
        Ok(Self {
            dtype,
            shape,
            storage: TensorStorage::CpuPinned(buf),
        })
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Size along the batch axis; `None` for a scalar.
    pub fn dim0(&self) -> Option<usize> {
        self.shape.0.first().copied()
    }

    /// Zero-copy view of rows `lo..hi` along the batch axis.
    pub fn slice_rows(&self, lo: usize, hi: usize) -> Result<Tensor, BatchError> {
        let row = self.row_byte_len()?;
        let rows = self.shape.0[0];
        if lo > hi || hi > rows {
            return Err(BatchError::InvalidArgument(format!(
                "row range {lo}..{hi} is out of bounds for a tensor with {rows} rows"
            )));
        }
        let mut shape = self.shape.clone();
        shape.0[0] = hi - lo;
        let bytes = self.storage.bytes().slice(lo * row..hi * row);
        Ok(Tensor {
            dtype: self.dtype,
            shape,
            storage: self.storage.with_bytes(bytes),
        })
    }

    /// Concatenates tensors along the batch axis. Dtypes and per-row shapes
    /// must match.
    pub fn concat_rows(tensors: &[Tensor]) -> Result<Tensor, BatchError> {
        let first = tensors.first().ok_or_else(|| {
            BatchError::InvalidArgument("cannot concatenate an empty tensor list".into())
        })?;
        let mut rows = 0usize;
        let mut total_bytes = 0usize;
        for tensor in tensors {
            if tensor.rank() == 0 {
                return Err(BatchError::InvalidArgument(
                    "cannot concatenate a tensor with no batch dimension".into(),
                ));
            }
            if tensor.dtype != first.dtype {
                return Err(BatchError::InvalidArgument(format!(
                    "dtype mismatch in concatenation: {:?} vs {:?}",
                    tensor.dtype, first.dtype
                )));
            }
            if tensor.shape.0[1..] != first.shape.0[1..] {
                return Err(BatchError::InvalidArgument(format!(
                    "per-row shape mismatch in concatenation: {:?} vs {:?}",
                    tensor.shape, first.shape
                )));
            }
            rows += tensor.shape.0[0];
            total_bytes += tensor.storage.bytes().len();
        }
        let mut buf = BytesMut::with_capacity(total_bytes);
        for tensor in tensors {
            buf.extend_from_slice(tensor.storage.bytes());
        }
        let mut shape = first.shape.clone();
        shape.0[0] = rows;
        Ok(Tensor {
            dtype: first.dtype,
            shape,
            storage: TensorStorage::CpuBytes(buf.freeze()),
        })
    }

    /// Splits along the batch axis into zero-copy views, one per entry of
    /// `sizes`. The sizes must sum to the row count.
    pub fn split_rows(&self, sizes: &[usize]) -> Result<Vec<Tensor>, BatchError> {
        self.row_byte_len()?;
        let rows = self.shape.0[0];
        let total: usize = sizes.iter().sum();
        if total != rows {
            return Err(BatchError::InvalidArgument(format!(
                "split sizes sum to {total}, tensor has {rows} rows"
            )));
        }
        let mut parts = Vec::with_capacity(sizes.len());
        let mut lo = 0usize;
        for &size in sizes {
            parts.push(self.slice_rows(lo, lo + size)?);
            lo += size;
        }
        Ok(parts)
    }

    fn row_byte_len(&self) -> Result<usize, BatchError> {
        if self.rank() == 0 {
            return Err(BatchError::InvalidArgument(
                "tensor has no batch dimension".into(),
            ));
        }
        Ok(self.shape.0[1..].iter().product::<usize>() * self.dtype.byte_size())
    }
}

fn validate_byte_len(dtype: DType, shape: &Shape, len: usize) -> Result<(), BatchError> {
    let expected = shape.numel() * dtype.byte_size();
    if len != expected {
        return Err(BatchError::InvalidArgument(format!(
            "buffer holds {len} bytes, shape {:?} with dtype {:?} needs {expected}",
            shape, dtype
        )));
    }
    Ok(())
}
