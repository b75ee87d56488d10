use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayViewD, ArrayViewMutD, IxDyn};

use crate::error::{Error, Result};
use crate::layout::{checked_byte_size, checked_element_count, ImageBufferType, ImageShape, TensorLayout};
use crate::memory::allocator::Allocator;
use crate::memory::buffer::{Buffer, DeviceBuffer};
use crate::memory::pooled::PooledAllocator;
use crate::types::{DataType, DeviceType, Element};

/// Tensor shape type
pub type Shape = Vec<usize>;

/// Where a tensor gets its memory from
#[derive(Clone)]
pub enum MemorySource {
    /// A dedicated allocation from a device allocator
    Plain(Arc<dyn Allocator>),
    /// The tensor's planned block in the reuse pool
    Pooled(Arc<PooledAllocator>),
    /// A dedicated device image
    Image(Arc<dyn Allocator>),
}

impl MemorySource {
    pub fn device_type(&self) -> DeviceType {
        match self {
            MemorySource::Plain(allocator) | MemorySource::Image(allocator) => allocator.device_type(),
            MemorySource::Pooled(pool) => pool.device_type(),
        }
    }

    /// Same kind of allocation on the same device
    pub fn same_kind(&self, other: &MemorySource) -> bool {
        match (self, other) {
            (MemorySource::Plain(a), MemorySource::Plain(b))
            | (MemorySource::Image(a), MemorySource::Image(b)) => a.device_type() == b.device_type(),
            (MemorySource::Pooled(a), MemorySource::Pooled(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            MemorySource::Plain(_) => "plain",
            MemorySource::Pooled(_) => "pooled",
            MemorySource::Image(_) => "image",
        }
    }
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySource::Pooled(_) => write!(f, "pooled"),
            other => write!(f, "{}({})", other.kind(), other.device_type()),
        }
    }
}

/// A named, typed tensor backed by device memory.
///
/// Memory is bound on the first [`resize`](Tensor::resize) and rebound only
/// when a later resize needs more than the current buffer holds. Contents are
/// not preserved across a rebind.
pub struct Tensor {
    name: String,
    data_type: DataType,
    shape: Shape,
    source: MemorySource,
    buffer: Option<Buffer>,
    image_buffer_type: Option<ImageBufferType>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {{ name: {:?}, data_type: {:?}, shape: {:?}, source: {:?}, capacity: {} }}",
            self.name,
            self.data_type,
            self.shape,
            self.source,
            self.capacity()
        )
    }
}

impl Tensor {
    /// Create an unbound tensor drawing memory from `source`
    pub fn new(name: impl Into<String>, data_type: DataType, source: MemorySource) -> Self {
        Self {
            name: name.into(),
            data_type,
            shape: Vec::new(),
            source,
            buffer: None,
            image_buffer_type: None,
        }
    }

    /// Create a tensor with its own allocation, e.g. operator scratch space
    pub fn new_plain(name: impl Into<String>, allocator: Arc<dyn Allocator>, data_type: DataType) -> Self {
        Self::new(name, data_type, MemorySource::Plain(allocator))
    }

    /// Create a tensor stored as a device image of the given packing
    pub fn new_image(
        name: impl Into<String>,
        allocator: Arc<dyn Allocator>,
        buffer_type: ImageBufferType,
        data_type: DataType,
    ) -> Self {
        let mut tensor = Self::new(name, data_type, MemorySource::Image(allocator));
        tensor.image_buffer_type = Some(buffer_type);
        tensor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get one dimension
    pub fn dim(&self, index: usize) -> usize {
        self.shape[index]
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes occupied by the elements
    pub fn nbytes(&self) -> usize {
        self.size() * self.data_type.size_in_bytes()
    }

    pub fn layout(&self) -> TensorLayout {
        TensorLayout::contiguous_layout(&self.shape)
    }

    pub fn source(&self) -> &MemorySource {
        &self.source
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.source, MemorySource::Pooled(_))
    }

    /// Whether memory has been bound
    pub fn is_bound(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    /// Bytes available in the bound buffer
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Buffer::size)
    }

    pub fn image_buffer_type(&self) -> Option<ImageBufferType> {
        self.image_buffer_type
    }

    /// Store the tensor packed as an image of `buffer_type`. Takes effect on
    /// the next resize.
    pub fn set_image_buffer_type(&mut self, buffer_type: ImageBufferType) {
        self.image_buffer_type = Some(buffer_type);
    }

    /// Texel extent for the current shape, for image tensors
    pub fn image_shape(&self) -> Result<Option<ImageShape>> {
        self.image_buffer_type
            .map(|buffer_type| ImageShape::for_tensor(&self.shape, buffer_type))
            .transpose()
    }

    fn required_bytes(&self, shape: &[usize]) -> Result<usize> {
        let element_size = self.data_type.size_in_bytes();
        let linear = checked_byte_size(shape, element_size).ok_or_else(|| {
            Error::Allocation(format!(
                "Tensor '{}' of shape {:?} exceeds the addressable size",
                self.name, shape
            ))
        })?;
        match self.image_buffer_type {
            Some(buffer_type) => ImageShape::for_tensor(shape, buffer_type)?.size_in_bytes(element_size),
            None => Ok(linear),
        }
    }

    /// Set the shape, binding more memory if the current buffer is too small.
    /// On failure the tensor keeps its previous shape and memory.
    pub fn resize(&mut self, shape: &[usize]) -> Result<()> {
        let required = self.required_bytes(shape)?;
        if self.buffer.is_none() || self.capacity() < required {
            let buffer = match &self.source {
                MemorySource::Plain(allocator) => {
                    Buffer::owned(DeviceBuffer::allocate(allocator.clone(), required)?)
                }
                MemorySource::Pooled(pool) => pool.assign_slot(&self.name, required)?,
                MemorySource::Image(allocator) => {
                    let buffer_type = self.image_buffer_type.unwrap_or(ImageBufferType::InOutChannel);
                    let image_shape = ImageShape::for_tensor(shape, buffer_type)?;
                    Buffer::owned(DeviceBuffer::allocate_image(
                        allocator.clone(),
                        image_shape,
                        self.data_type.size_in_bytes(),
                    )?)
                }
            };
            // the new buffer is in place before the old one releases its slot
            self.buffer = Some(buffer);
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// Resize to the shape of `other`
    pub fn resize_like(&mut self, other: &Tensor) -> Result<()> {
        self.resize(other.shape())
    }

    /// Change the shape without touching memory
    pub fn reshape(&mut self, shape: &[usize]) -> Result<()> {
        if checked_element_count(shape) != Some(self.size()) {
            return Err(Error::ShapeMismatch(format!(
                "Cannot reshape tensor '{}' from {:?} to {:?}: total elements don't match",
                self.name, self.shape, shape
            )));
        }
        self.shape = shape.to_vec();
        Ok(())
    }

    /// Element bytes of the current shape
    pub fn as_bytes(&self) -> Result<&[u8]> {
        let nbytes = self.nbytes();
        match &self.buffer {
            Some(buffer) => Ok(&buffer.as_bytes()[..nbytes]),
            None if nbytes == 0 => Ok(&[]),
            None => Err(self.unbound_error()),
        }
    }

    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        let nbytes = self.nbytes();
        if self.buffer.is_none() && nbytes != 0 {
            return Err(self.unbound_error());
        }
        Ok(match &mut self.buffer {
            Some(buffer) => &mut buffer.as_bytes_mut()[..nbytes],
            None => &mut [],
        })
    }

    fn unbound_error(&self) -> Error {
        Error::Allocation(format!("Tensor '{}' has no memory bound; resize it first", self.name))
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::DATA_TYPE != self.data_type {
            return Err(Error::DataTypeMismatch {
                actual: self.data_type,
                requested: T::DATA_TYPE,
            });
        }
        Ok(())
    }

    /// Typed element slice
    pub fn data<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        bytemuck::try_cast_slice(self.as_bytes()?)
            .map_err(|e| Error::Allocation(format!("Misaligned tensor '{}': {}", self.name, e)))
    }

    /// Mutable typed element slice
    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_type::<T>()?;
        let name = self.name.clone();
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()?)
            .map_err(|e| Error::Allocation(format!("Misaligned tensor '{}': {}", name, e)))
    }

    /// ndarray view with the tensor's shape
    pub fn view<T: Element>(&self) -> Result<ArrayViewD<'_, T>> {
        let shape = IxDyn(&self.shape);
        ArrayViewD::from_shape(shape, self.data::<T>()?)
            .map_err(|e| Error::ShapeMismatch(format!("View of '{}': {}", self.name, e)))
    }

    pub fn view_mut<T: Element>(&mut self) -> Result<ArrayViewMutD<'_, T>> {
        let shape = IxDyn(&self.shape);
        let name = self.name.clone();
        ArrayViewMutD::from_shape(shape, self.data_mut::<T>()?)
            .map_err(|e| Error::ShapeMismatch(format!("View of '{}': {}", name, e)))
    }

    /// Copy raw little-endian element bytes into the tensor
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let nbytes = self.nbytes();
        if bytes.len() != nbytes {
            return Err(Error::ShapeMismatch(format!(
                "Tensor '{}' of shape {:?} needs {} bytes, got {}",
                self.name,
                self.shape,
                nbytes,
                bytes.len()
            )));
        }
        self.as_bytes_mut()?.copy_from_slice(bytes);
        Ok(())
    }

    /// Copy typed values into the tensor
    pub fn copy_from_slice<T: Element>(&mut self, values: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        self.copy_from_bytes(bytemuck::cast_slice(values))
    }

    pub fn fill_zero(&mut self) -> Result<()> {
        self.as_bytes_mut()?.fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::{ImageAllocator, SystemAllocator};
    use crate::memory::pooled::{PoolOptions, PoolPlan};
    use half::f16;

    fn cpu() -> Arc<dyn Allocator> {
        Arc::new(SystemAllocator::new(None))
    }

    #[test]
    fn test_memory_bound_on_first_resize() {
        let allocator = cpu();
        let mut tensor = Tensor::new_plain("t", allocator.clone(), DataType::Float32);
        assert!(!tensor.is_bound());
        assert!(tensor.data::<f32>().is_err());
        assert_eq!(allocator.allocated_memory(), 0);

        tensor.resize(&[2, 3]).unwrap();
        assert_eq!(tensor.size(), 6);
        assert_eq!(tensor.nbytes(), 24);
        assert!(tensor.capacity() >= 24);
        assert_eq!(allocator.allocated_memory(), 24);

        // shrinking keeps the buffer
        tensor.resize(&[1, 3]).unwrap();
        assert_eq!(tensor.capacity(), 24);
        assert_eq!(tensor.data::<f32>().unwrap().len(), 3);

        drop(tensor);
        assert_eq!(allocator.allocated_memory(), 0);
    }

    #[test]
    fn test_typed_access_checks_data_type() {
        let mut tensor = Tensor::new_plain("t", cpu(), DataType::Float16);
        tensor.resize(&[4]).unwrap();
        tensor
            .copy_from_slice(&[f16::from_f32(1.0), f16::from_f32(2.0), f16::ZERO, f16::ONE])
            .unwrap();
        assert_eq!(tensor.data::<f16>().unwrap()[1].to_f32(), 2.0);

        let err = tensor.data::<f32>().unwrap_err();
        assert!(matches!(
            err,
            Error::DataTypeMismatch {
                actual: DataType::Float16,
                requested: DataType::Float32
            }
        ));
    }

    #[test]
    fn test_views_follow_shape() {
        let mut tensor = Tensor::new_plain("t", cpu(), DataType::Int32);
        tensor.resize(&[2, 2]).unwrap();
        tensor.copy_from_slice(&[1i32, 2, 3, 4]).unwrap();
        {
            let mut view = tensor.view_mut::<i32>().unwrap();
            view[[1, 0]] = 30;
        }
        assert_eq!(tensor.data::<i32>().unwrap(), &[1, 2, 30, 4]);

        tensor.reshape(&[4]).unwrap();
        assert_eq!(tensor.view::<i32>().unwrap().shape(), &[4]);
        assert!(tensor.reshape(&[3]).is_err());
    }

    #[test]
    fn test_copy_from_bytes_length_checked() {
        let mut tensor = Tensor::new_plain("t", cpu(), DataType::Uint8);
        tensor.resize(&[3]).unwrap();
        assert!(matches!(tensor.copy_from_bytes(&[1, 2]), Err(Error::ShapeMismatch(_))));
        tensor.copy_from_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(tensor.data::<u8>().unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_oversized_resize_is_rejected() {
        let allocator = cpu();
        let mut tensor = Tensor::new_plain("t", allocator.clone(), DataType::Float32);
        let err = tensor.resize(&[1usize << 62, 4]).unwrap_err();
        assert!(matches!(err, Error::Allocation(_)));
        assert!(!tensor.is_bound());
        assert!(tensor.shape().is_empty());
        assert_eq!(allocator.allocated_memory(), 0);

        tensor.resize(&[2]).unwrap();
        assert!(tensor.resize(&[usize::MAX, 2]).is_err());
        assert_eq!(tensor.shape(), &[2]);
        assert!(tensor.reshape(&[usize::MAX, 2]).is_err());

        let mut image = Tensor::new_image("img", cpu(), ImageBufferType::InOutChannel, DataType::Float32);
        assert!(matches!(image.resize(&[1, 4, 1usize << 40, 1usize << 40]), Err(Error::Allocation(_))));
        assert!(!image.is_bound());
    }

    #[test]
    fn test_image_tensor_sized_by_texels() {
        let allocator: Arc<dyn Allocator> = Arc::new(ImageAllocator::new(None, 64));
        let mut tensor = Tensor::new_image("img", allocator, ImageBufferType::InOutChannel, DataType::Float32);
        tensor.resize(&[1, 6, 2, 2]).unwrap();
        assert_eq!(tensor.image_shape().unwrap(), Some(ImageShape::new(4, 2)));
        assert_eq!(tensor.capacity(), 4 * 2 * 4 * 4);
        assert_eq!(tensor.data::<f32>().unwrap().len(), 24);
    }

    #[test]
    fn test_pooled_tensor_releases_slot_on_drop() {
        let plan = PoolPlan::new().with_block(0, 64).assign("a", 0);
        let options = PoolOptions::default().set_validate_lifetimes(true);
        let pool = Arc::new(PooledAllocator::new(plan, cpu(), options).unwrap());

        let mut tensor = Tensor::new("a", DataType::Float32, MemorySource::Pooled(pool.clone()));
        tensor.resize(&[4]).unwrap();
        assert!(tensor.is_pooled());
        assert_eq!(pool.stats().active_slots, 1);

        // growing rebinds without tripping the overlap check
        tensor.resize(&[32]).unwrap();
        assert_eq!(pool.stats().active_slots, 1);
        assert_eq!(pool.block_capacity(0), Some(128));

        drop(tensor);
        assert_eq!(pool.stats().active_slots, 0);
    }
}
