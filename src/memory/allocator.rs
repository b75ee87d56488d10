use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use strum::IntoEnumIterator;

use crate::error::{Error, Result};
use crate::layout::ImageShape;
use crate::types::DeviceType;

/// Alignment used for every tensor allocation (one cache line).
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Largest image edge, in texels, the default image allocator accepts.
pub const DEFAULT_MAX_IMAGE_DIM: usize = 16384;

/// A raw allocation handed out by an [`Allocator`].
///
/// A block is uniquely owned: it is not `Clone`, and it must be returned to the
/// allocator that produced it.
#[derive(Debug)]
pub struct MemoryBlock {
    /// Pointer to the memory block
    ptr: NonNull<u8>,
    /// Size of the memory block in bytes
    size: usize,
    /// Alignment of the memory block
    alignment: usize,
}

// The block is plain bytes; access is synchronised by its owner.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Wrap a raw allocation.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes for as long as
    /// the block is alive, and aligned to `alignment`.
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize, alignment: usize) -> Self {
        Self { ptr, size, alignment }
    }

    /// Get a pointer to the memory block
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Get the size of the memory block
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the alignment of the memory block
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

/// Device memory capability the workspace allocates through.
///
/// Implementations exist per device (CPU heap, GPU image memory, DSP arena);
/// the workspace only ever sees this trait.
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Allocate a block of memory with the specified size and alignment
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemoryBlock>;

    /// Allocate backing memory for a 2D image of `shape` texels
    fn allocate_image(&self, shape: ImageShape, element_size: usize) -> Result<MemoryBlock> {
        let _ = (shape, element_size);
        Err(Error::UnsupportedFeature(format!(
            "{} allocator cannot allocate images",
            self.device_type()
        )))
    }

    /// Deallocate a memory block
    fn deallocate(&self, block: MemoryBlock);

    /// Get the amount of allocated memory
    fn allocated_memory(&self) -> usize;

    /// Device this allocator serves
    fn device_type(&self) -> DeviceType;
}

/// Thread-safe heap allocator backed by the Rust global allocator
pub struct SystemAllocator {
    device: DeviceType,
    allocated: AtomicUsize,
    memory_limit: Option<usize>,
    allocations: Mutex<HashMap<usize, Layout>>,
}

impl SystemAllocator {
    /// Create a new system allocator
    pub fn new(memory_limit: Option<usize>) -> Self {
        Self::for_device(DeviceType::Cpu, memory_limit)
    }

    /// Create a heap allocator that reports itself as serving `device`
    pub fn for_device(device: DeviceType, memory_limit: Option<usize>) -> Self {
        Self {
            device,
            allocated: AtomicUsize::new(0),
            memory_limit,
            allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for SystemAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemAllocator")
            .field("device", &self.device)
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .field("memory_limit", &self.memory_limit)
            .finish()
    }
}

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemoryBlock> {
        // Zero-sized layouts cannot be allocated
        let size = std::cmp::max(1, size);

        let mut allocations = self
            .allocations
            .lock()
            .map_err(|_| Error::Allocation("Failed to lock allocations mutex".to_string()))?;

        if let Some(limit) = self.memory_limit {
            let current = self.allocated.load(Ordering::Relaxed);
            if current.checked_add(size).map_or(true, |total| total > limit) {
                return Err(Error::Allocation(format!(
                    "Memory limit of {} bytes exceeded with allocation of {} bytes (current: {})",
                    limit, size, current
                )));
            }
        }

        let layout = Layout::from_size_align(size, alignment).map_err(|e| {
            Error::Allocation(format!(
                "Invalid memory layout: size={}, alignment={}, error={}",
                size, alignment, e
            ))
        })?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::Allocation(format!(
                "Failed to allocate memory: size={}, alignment={}",
                size, alignment
            ))
        })?;

        self.allocated.fetch_add(size, Ordering::Relaxed);
        allocations.insert(ptr.as_ptr() as usize, layout);

        // SAFETY: freshly allocated with `layout`
        Ok(unsafe { MemoryBlock::from_raw(ptr, size, alignment) })
    }

    fn allocate_image(&self, shape: ImageShape, element_size: usize) -> Result<MemoryBlock> {
        if self.device != DeviceType::Gpu {
            return Err(Error::UnsupportedFeature(format!(
                "{} allocator cannot allocate images",
                self.device
            )));
        }
        self.allocate(shape.size_in_bytes(element_size)?, DEFAULT_ALIGNMENT)
    }

    fn deallocate(&self, block: MemoryBlock) {
        let mut allocations = match self.allocations.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Allocation table poisoned, leaking {} bytes", block.size());
                return;
            }
        };

        let key = block.ptr().as_ptr() as usize;
        if let Some(layout) = allocations.remove(&key) {
            // SAFETY: the pointer was produced by `alloc::alloc` with this layout
            unsafe {
                alloc::dealloc(block.ptr().as_ptr(), layout);
            }
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
        } else {
            warn!("Deallocating unknown block of {} bytes", block.size());
        }
    }

    fn allocated_memory(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn device_type(&self) -> DeviceType {
        self.device
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        let allocations = match self.allocations.get_mut() {
            Ok(map) => std::mem::take(map),
            Err(_) => return,
        };
        if !allocations.is_empty() {
            debug!("Releasing {} outstanding allocations", allocations.len());
        }
        for (ptr, layout) in allocations {
            // SAFETY: every entry was allocated with its recorded layout
            unsafe {
                alloc::dealloc(ptr as *mut u8, layout);
            }
        }
    }
}

/// Image-capable device allocator.
///
/// Images are backed by host memory laid out row by row, so CPU kernels and
/// tests can read them directly; the allocator enforces the device's maximum
/// image extent the way a GPU driver would.
#[derive(Debug)]
pub struct ImageAllocator {
    inner: SystemAllocator,
    max_image_dim: usize,
}

impl ImageAllocator {
    pub fn new(memory_limit: Option<usize>, max_image_dim: usize) -> Self {
        Self {
            inner: SystemAllocator::for_device(DeviceType::Gpu, memory_limit),
            max_image_dim,
        }
    }

    pub fn max_image_dim(&self) -> usize {
        self.max_image_dim
    }
}

impl Allocator for ImageAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> Result<MemoryBlock> {
        self.inner.allocate(size, alignment)
    }

    fn allocate_image(&self, shape: ImageShape, element_size: usize) -> Result<MemoryBlock> {
        if shape.width > self.max_image_dim || shape.height > self.max_image_dim {
            return Err(Error::Allocation(format!(
                "Image {}x{} exceeds the device limit of {} texels per side",
                shape.width, shape.height, self.max_image_dim
            )));
        }
        self.inner
            .allocate(shape.size_in_bytes(element_size)?, DEFAULT_ALIGNMENT)
    }

    fn deallocate(&self, block: MemoryBlock) {
        self.inner.deallocate(block)
    }

    fn allocated_memory(&self) -> usize {
        self.inner.allocated_memory()
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Gpu
    }
}

/// Allocators available to a workspace, one per device
#[derive(Debug, Clone)]
pub struct DeviceAllocators {
    allocators: BTreeMap<DeviceType, Arc<dyn Allocator>>,
}

impl DeviceAllocators {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            allocators: BTreeMap::new(),
        }
    }

    /// Heap allocators for CPU and DSP, an image allocator for GPU
    pub fn with_defaults(memory_limit: Option<usize>, max_image_dim: usize) -> Self {
        let mut registry = Self::new();
        for device in DeviceType::iter() {
            let allocator: Arc<dyn Allocator> = match device {
                DeviceType::Cpu => create_default_allocator(memory_limit),
                DeviceType::Gpu => Arc::new(ImageAllocator::new(memory_limit, max_image_dim)),
                DeviceType::Dsp => Arc::new(SystemAllocator::for_device(device, memory_limit)),
            };
            registry.register(allocator);
        }
        registry
    }

    /// Register an allocator under the device it reports, replacing any previous one
    pub fn register(&mut self, allocator: Arc<dyn Allocator>) {
        self.allocators.insert(allocator.device_type(), allocator);
    }

    /// Get the allocator for a device
    pub fn get(&self, device: DeviceType) -> Result<Arc<dyn Allocator>> {
        self.allocators
            .get(&device)
            .cloned()
            .ok_or_else(|| Error::Allocation(format!("No allocator registered for {}", device)))
    }

    /// Bytes currently allocated across every device
    pub fn allocated_memory(&self) -> usize {
        self.allocators.values().map(|a| a.allocated_memory()).sum()
    }
}

impl Default for DeviceAllocators {
    fn default() -> Self {
        Self::with_defaults(None, DEFAULT_MAX_IMAGE_DIM)
    }
}

/// Create a default CPU memory allocator
pub fn create_default_allocator(memory_limit: Option<usize>) -> Arc<dyn Allocator> {
    Arc::new(SystemAllocator::new(memory_limit))
}
