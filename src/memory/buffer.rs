use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::layout::ImageShape;
use crate::memory::allocator::{Allocator, MemoryBlock, DEFAULT_ALIGNMENT};
use crate::memory::pooled::SlotLease;
use crate::types::DeviceType;

/// A physical allocation, returned to its allocator when dropped.
pub struct DeviceBuffer {
    block: Option<MemoryBlock>,
    size: usize,
    allocator: Arc<dyn Allocator>,
    image_shape: Option<ImageShape>,
}

impl DeviceBuffer {
    /// Allocate a linear buffer of `size` bytes
    pub fn allocate(allocator: Arc<dyn Allocator>, size: usize) -> Result<Self> {
        let block = allocator.allocate(size, DEFAULT_ALIGNMENT)?;
        Ok(Self {
            size: block.size(),
            block: Some(block),
            allocator,
            image_shape: None,
        })
    }

    /// Allocate image-backed memory of `shape` texels
    pub fn allocate_image(
        allocator: Arc<dyn Allocator>,
        shape: ImageShape,
        element_size: usize,
    ) -> Result<Self> {
        let block = allocator.allocate_image(shape, element_size)?;
        Ok(Self {
            size: block.size(),
            block: Some(block),
            allocator,
            image_shape: Some(shape),
        })
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn image_shape(&self) -> Option<ImageShape> {
        self.image_shape
    }

    pub fn device_type(&self) -> DeviceType {
        self.allocator.device_type()
    }

    fn as_ptr(&self) -> *mut u8 {
        match &self.block {
            Some(block) => block.ptr().as_ptr(),
            None => std::ptr::NonNull::dangling().as_ptr(),
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("size", &self.size)
            .field("device", &self.device_type())
            .field("image_shape", &self.image_shape)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.deallocate(block);
        }
    }
}

/// A tensor's view of device memory.
///
/// A plain buffer is the only view of its allocation. A pooled buffer shares
/// its allocation with every other tensor assigned to the same pool block;
/// exclusive access to the bytes then rests on the planner's guarantee that
/// no two such tensors are live at the same time.
pub struct Buffer {
    storage: Arc<DeviceBuffer>,
    offset: usize,
    size: usize,
    lease: Option<SlotLease>,
}

impl Buffer {
    /// Wrap an allocation owned by this buffer alone
    pub fn owned(storage: DeviceBuffer) -> Self {
        let size = storage.size();
        Self {
            storage: Arc::new(storage),
            offset: 0,
            size,
            lease: None,
        }
    }

    /// A view into a shared pool block, holding the slot until dropped
    pub(crate) fn pooled(storage: Arc<DeviceBuffer>, size: usize, lease: SlotLease) -> Self {
        debug_assert!(size <= storage.size());
        Self {
            storage,
            offset: 0,
            size,
            lease: Some(lease),
        }
    }

    /// Usable size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    pub fn image_shape(&self) -> Option<ImageShape> {
        self.storage.image_shape()
    }

    pub fn device_type(&self) -> DeviceType {
        self.storage.device_type()
    }

    /// Whether both views point at the same physical allocation
    pub fn shares_storage_with(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: offset + size lies inside the allocation, which the Arc keeps alive
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr().add(self.offset), self.size) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; for pooled views the planner guarantees no other
        // live tensor touches this block
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_ptr().add(self.offset), self.size) }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("pooled", &self.is_pooled())
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::SystemAllocator;

    #[test]
    fn test_owned_buffer_returns_memory_on_drop() {
        let allocator = Arc::new(SystemAllocator::new(None));
        let storage = DeviceBuffer::allocate(allocator.clone(), 128).unwrap();
        let mut buffer = Buffer::owned(storage);
        assert_eq!(allocator.allocated_memory(), 128);

        buffer.as_bytes_mut().fill(7);
        assert!(buffer.as_bytes().iter().all(|&b| b == 7));
        assert!(!buffer.is_pooled());

        drop(buffer);
        assert_eq!(allocator.allocated_memory(), 0);
    }
}
