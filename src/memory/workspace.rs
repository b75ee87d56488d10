use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::layout::ImageBufferType;
use crate::memory::allocator::{Allocator, DeviceAllocators, DEFAULT_MAX_IMAGE_DIM};
use crate::memory::pooled::{PoolOptions, PoolPlan, PooledAllocator};
use crate::model::NetDef;
use crate::ops::tensor::{MemorySource, Tensor};
use crate::types::{DataType, DeviceType};

/// Allocation strategy chosen when a tensor is created
#[derive(Clone)]
pub enum TensorAllocator {
    /// Dedicated memory from a device allocator
    Plain(Arc<dyn Allocator>),
    /// The tensor's planned slot in the workspace's reuse pool
    Pooled,
    /// A dedicated device image packed as `buffer_type`
    DeviceImage {
        allocator: Arc<dyn Allocator>,
        buffer_type: ImageBufferType,
    },
}

impl fmt::Debug for TensorAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorAllocator::Plain(allocator) => write!(f, "Plain({})", allocator.device_type()),
            TensorAllocator::Pooled => write!(f, "Pooled"),
            TensorAllocator::DeviceImage { allocator, buffer_type } => {
                write!(f, "DeviceImage({}, {})", allocator.device_type(), buffer_type)
            }
        }
    }
}

/// Workspace configuration
#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    /// Check pool slot lifetimes at runtime
    pub validate_pool_lifetimes: bool,
    /// Memory limit per device allocator in bytes (0 = no limit)
    pub memory_limit_bytes: usize,
    /// Largest image edge in texels on image-capable devices
    pub max_image_dim: usize,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        Self {
            validate_pool_lifetimes: cfg!(debug_assertions),
            memory_limit_bytes: 0,
            max_image_dim: DEFAULT_MAX_IMAGE_DIM,
        }
    }
}

impl WorkspaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable pool lifetime validation
    pub fn set_validate_pool_lifetimes(mut self, validate: bool) -> Self {
        self.validate_pool_lifetimes = validate;
        self
    }

    /// Set the memory limit
    pub fn set_memory_limit(mut self, memory_limit_bytes: usize) -> Self {
        self.memory_limit_bytes = memory_limit_bytes;
        self
    }

    pub fn set_max_image_dim(mut self, max_image_dim: usize) -> Self {
        self.max_image_dim = max_image_dim;
        self
    }

    fn memory_limit(&self) -> Option<usize> {
        (self.memory_limit_bytes > 0).then_some(self.memory_limit_bytes)
    }

    fn pool_options(&self) -> PoolOptions {
        PoolOptions::default().set_validate_lifetimes(self.validate_pool_lifetimes)
    }
}

/// Name-keyed registry owning every tensor of a running net.
///
/// The workspace is the single owner of its tensors; callers get borrows
/// tied to the workspace. Intermediate tensors can draw their memory from a
/// shared [`PooledAllocator`] that is installed from the model's memory plan.
pub struct Workspace {
    tensor_map: BTreeMap<String, Tensor>,
    pooled_allocator: Option<Arc<PooledAllocator>>,
    allocators: DeviceAllocators,
    options: WorkspaceOptions,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("tensors", &self.tensor_map.len())
            .field("pooled", &self.pooled_allocator.is_some())
            .field("options", &self.options)
            .finish()
    }
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self::with_options(WorkspaceOptions::default())
    }

    /// Create a workspace with the default device allocators configured by `options`
    pub fn with_options(options: WorkspaceOptions) -> Self {
        let allocators = DeviceAllocators::with_defaults(options.memory_limit(), options.max_image_dim);
        Self::with_allocators(allocators, options)
    }

    pub fn with_allocators(allocators: DeviceAllocators, options: WorkspaceOptions) -> Self {
        Self {
            tensor_map: BTreeMap::new(),
            pooled_allocator: None,
            allocators,
            options,
        }
    }

    pub fn options(&self) -> &WorkspaceOptions {
        &self.options
    }

    /// Get the allocator registered for a device
    pub fn allocator(&self, device: DeviceType) -> Result<Arc<dyn Allocator>> {
        self.allocators.get(device)
    }

    pub fn pooled_allocator(&self) -> Option<&Arc<PooledAllocator>> {
        self.pooled_allocator.as_ref()
    }

    /// Names of all tensors, sorted
    pub fn tensors(&self) -> Vec<String> {
        self.tensor_map.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tensor_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensor_map.is_empty()
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.tensor_map.contains_key(name)
    }

    pub fn get_tensor(&self, name: &str) -> Result<&Tensor> {
        self.tensor_map
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Tensor '{}' not found in workspace", name)))
    }

    pub fn get_tensor_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        self.tensor_map
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Tensor '{}' not found in workspace", name)))
    }

    /// Create a tensor, or return the existing one if it was created with the
    /// same data type and the same kind of allocation.
    ///
    /// A pooled tensor whose block is an image is created with image layout.
    /// Asking for a device image of the same packing returns such a tensor
    /// as well.
    pub fn create_tensor(
        &mut self,
        name: &str,
        allocator: TensorAllocator,
        data_type: DataType,
    ) -> Result<&mut Tensor> {
        let (source, buffer_type) = self.memory_source(name, allocator)?;

        match self.tensor_map.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                if existing.data_type() != data_type || !reusable_as(existing, &source, buffer_type) {
                    return Err(Error::DuplicateName(format!(
                        "Tensor '{}' already exists as {} {:?}, requested {} {:?}",
                        name,
                        existing.data_type(),
                        existing.source(),
                        data_type,
                        source
                    )));
                }
                Ok(existing)
            }
            Entry::Vacant(entry) => {
                let mut tensor = Tensor::new(name, data_type, source);
                if let Some(buffer_type) = buffer_type {
                    tensor.set_image_buffer_type(buffer_type);
                }
                debug!("Created tensor '{}' ({}, {:?})", name, data_type, tensor.source());
                Ok(entry.insert(tensor))
            }
        }
    }

    fn memory_source(
        &self,
        name: &str,
        allocator: TensorAllocator,
    ) -> Result<(MemorySource, Option<ImageBufferType>)> {
        match allocator {
            TensorAllocator::Plain(allocator) => Ok((MemorySource::Plain(allocator), None)),
            TensorAllocator::Pooled => {
                let pool = self.pooled_allocator.as_ref().ok_or_else(|| {
                    Error::Allocation(format!(
                        "Cannot create pooled tensor '{}': workspace has no pooled allocator",
                        name
                    ))
                })?;
                if pool.slot_of(name).is_none() {
                    return Err(Error::Allocation(format!(
                        "Cannot create pooled tensor '{}': no pool slot is planned for it",
                        name
                    )));
                }
                Ok((MemorySource::Pooled(pool.clone()), pooled_buffer_type(pool, name)))
            }
            TensorAllocator::DeviceImage { allocator, buffer_type } => {
                Ok((MemorySource::Image(allocator), Some(buffer_type)))
            }
        }
    }

    /// Remove a tensor, releasing its memory. Returns false if it did not exist.
    pub fn remove_tensor(&mut self, name: &str) -> bool {
        match self.tensor_map.remove(name) {
            Some(tensor) => {
                debug!("Removed tensor '{}' ({} bytes)", name, tensor.capacity());
                true
            }
            None => false,
        }
    }

    /// Remove every tensor not named in `live`, returning the removed names
    pub fn remove_unused_tensors(&mut self, live: &HashSet<String>) -> Vec<String> {
        let unused: Vec<String> = self
            .tensor_map
            .keys()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();
        for name in &unused {
            self.remove_tensor(name);
        }
        unused
    }

    /// Borrow input tensors for reading and output tensors for writing at once
    pub fn borrow_io<S: AsRef<str>>(
        &mut self,
        inputs: &[S],
        outputs: &[S],
    ) -> Result<(Vec<&Tensor>, Vec<&mut Tensor>)> {
        let output_names: HashSet<&str> = outputs.iter().map(AsRef::as_ref).collect();
        if output_names.len() != outputs.len() {
            return Err(Error::InvalidGraph("Operator writes the same tensor twice".to_string()));
        }
        if let Some(name) = inputs.iter().map(AsRef::as_ref).find(|n| output_names.contains(n)) {
            return Err(Error::InvalidGraph(format!(
                "Tensor '{}' is both an input and an output",
                name
            )));
        }
        let input_names: HashSet<&str> = inputs.iter().map(AsRef::as_ref).collect();

        let mut readable: HashMap<&str, &Tensor> = HashMap::new();
        let mut writable: HashMap<&str, &mut Tensor> = HashMap::new();
        for (name, tensor) in self.tensor_map.iter_mut() {
            if output_names.contains(name.as_str()) {
                writable.insert(name.as_str(), tensor);
            } else if input_names.contains(name.as_str()) {
                readable.insert(name.as_str(), &*tensor);
            }
        }

        let inputs = inputs
            .iter()
            .map(|name| {
                readable.get(name.as_ref()).copied().ok_or_else(|| {
                    Error::NotFound(format!("Input tensor '{}' not found in workspace", name.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = outputs
            .iter()
            .map(|name| {
                writable.remove(name.as_ref()).ok_or_else(|| {
                    Error::NotFound(format!("Output tensor '{}' not found in workspace", name.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((inputs, outputs))
    }

    /// Install a reuse pool on `device`, replacing any previous one
    pub fn init_pool(&mut self, plan: PoolPlan, device: DeviceType) -> Result<()> {
        let allocator = self.allocators.get(device)?;
        let pool = PooledAllocator::new(plan, allocator, self.options.pool_options())?;
        self.pooled_allocator = Some(Arc::new(pool));
        Ok(())
    }

    /// Bytes bound to the tensors currently in the workspace
    pub fn total_tensor_bytes(&self) -> usize {
        self.tensor_map.values().map(Tensor::capacity).sum()
    }

    /// Load a model's constant tensors and set up its memory pool.
    ///
    /// Constants are placed on their own device, or on `device` when they do
    /// not name one. On failure nothing is added to the workspace.
    pub fn load_model_tensor(&mut self, net: &NetDef, device: DeviceType) -> Result<()> {
        let mut staged = Vec::with_capacity(net.tensors.len());
        let mut seen = HashSet::new();
        let mut const_bytes = 0;

        for const_tensor in &net.tensors {
            let name = const_tensor.name.as_str();
            if self.tensor_map.contains_key(name) || !seen.insert(name) {
                return Err(Error::DuplicateName(format!(
                    "Constant tensor '{}' is defined twice",
                    name
                )));
            }

            let expected = const_tensor.expected_bytes().ok_or_else(|| {
                Error::InvalidModel(format!(
                    "Constant tensor '{}' has dims {:?} whose size overflows",
                    name, const_tensor.dims
                ))
            })?;
            let bytes = const_tensor.raw_bytes();
            if bytes.len() != expected {
                return Err(Error::InvalidModel(format!(
                    "Constant tensor '{}' of shape {:?} has {} bytes, expected {}",
                    name,
                    const_tensor.dims,
                    bytes.len(),
                    expected
                )));
            }

            let allocator = self.allocators.get(const_tensor.device.unwrap_or(device))?;
            let mut tensor = Tensor::new_plain(name, allocator, const_tensor.data_type);
            tensor.resize(&const_tensor.dims)?;
            tensor.copy_from_bytes(&bytes)?;
            const_bytes += bytes.len();
            staged.push(tensor);
        }

        let pool = match &net.mem_arena {
            Some(_) => {
                let plan = PoolPlan::from_net(net)?;
                let allocator = self.allocators.get(device)?;
                Some(Arc::new(PooledAllocator::new(plan, allocator, self.options.pool_options())?))
            }
            None => None,
        };

        for tensor in staged {
            self.tensor_map.insert(tensor.name().to_string(), tensor);
        }

        let mut image_outputs = 0;
        if let Some(pool) = pool {
            if device == DeviceType::Gpu {
                image_outputs = self.create_image_output_tensors(net, &pool);
            }
            self.pooled_allocator = Some(pool);
        }

        let stats = self.pooled_allocator.as_ref().map(|pool| pool.stats()).unwrap_or_default();
        info!(
            "Loaded net '{}' on {}: {} constant tensors ({} bytes), {} pool blocks ({} bytes), {} image outputs",
            net.name,
            device,
            net.tensors.len(),
            const_bytes,
            stats.blocks,
            stats.reserved_bytes,
            image_outputs
        );
        Ok(())
    }

    /// Pre-create pooled outputs whose planned block is an image
    fn create_image_output_tensors(&mut self, net: &NetDef, pool: &Arc<PooledAllocator>) -> usize {
        let mut created = 0;
        for op in &net.ops {
            for output in &op.outputs {
                let Some(mem_id) = op.mem_id_of(output) else {
                    continue;
                };
                if pool.block_image_shape(mem_id).is_none() || self.tensor_map.contains_key(output) {
                    continue;
                }
                let mut tensor = Tensor::new(output.as_str(), op.output_type, MemorySource::Pooled(pool.clone()));
                if let Some(buffer_type) = pooled_buffer_type(pool, output) {
                    tensor.set_image_buffer_type(buffer_type);
                }
                self.tensor_map.insert(output.clone(), tensor);
                created += 1;
            }
        }
        created
    }
}

/// Layout of a pooled tensor: image-backed blocks hold channel-packed images
fn pooled_buffer_type(pool: &PooledAllocator, name: &str) -> Option<ImageBufferType> {
    let slot = pool.slot_of(name)?;
    pool.block_image_shape(slot).map(|_| ImageBufferType::InOutChannel)
}

/// Whether `existing` can stand in for a tensor requested from `source`
fn reusable_as(existing: &Tensor, source: &MemorySource, buffer_type: Option<ImageBufferType>) -> bool {
    let same_layout = buffer_type.map_or(true, |t| existing.image_buffer_type() == Some(t));
    let pooled_image = existing.is_pooled()
        && matches!(source, MemorySource::Image(_))
        && existing.source().device_type() == source.device_type();
    same_layout && (existing.source().same_kind(source) || pooled_image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(ws: &Workspace) -> TensorAllocator {
        TensorAllocator::Plain(ws.allocator(DeviceType::Cpu).unwrap())
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut ws = Workspace::new();
        let alloc = plain(&ws);
        ws.create_tensor("x", alloc.clone(), DataType::Float32)
            .unwrap()
            .resize(&[2, 2])
            .unwrap();
        let again = ws.create_tensor("x", alloc, DataType::Float32).unwrap();
        assert_eq!(again.shape(), &[2, 2]);
        assert_eq!(ws.tensors(), vec!["x".to_string()]);
    }

    #[test]
    fn test_conflicting_create_is_rejected() {
        let mut ws = Workspace::new();
        let alloc = plain(&ws);
        ws.create_tensor("x", alloc.clone(), DataType::Float32).unwrap();
        let err = ws.create_tensor("x", alloc, DataType::Int32).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
        assert_eq!(ws.get_tensor("x").unwrap().data_type(), DataType::Float32);
    }

    #[test]
    fn test_pooled_create_needs_pool_and_slot() {
        let mut ws = Workspace::new();
        assert!(matches!(
            ws.create_tensor("y", TensorAllocator::Pooled, DataType::Float32),
            Err(Error::Allocation(_))
        ));

        ws.init_pool(PoolPlan::new().with_block(0, 64).assign("y", 0), DeviceType::Cpu)
            .unwrap();
        assert!(matches!(
            ws.create_tensor("z", TensorAllocator::Pooled, DataType::Float32),
            Err(Error::Allocation(_))
        ));
        assert!(ws.create_tensor("y", TensorAllocator::Pooled, DataType::Float32).unwrap().is_pooled());
        assert!(!ws.has_tensor("z"));
    }

    #[test]
    fn test_borrow_io_rejects_aliasing() {
        let mut ws = Workspace::new();
        let alloc = plain(&ws);
        ws.create_tensor("a", alloc.clone(), DataType::Float32).unwrap();
        ws.create_tensor("b", alloc, DataType::Float32).unwrap();

        let err = ws.borrow_io(&["a"], &["a"]).unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)));
        assert!(matches!(ws.borrow_io(&["a"], &["missing"]), Err(Error::NotFound(_))));

        let (inputs, outputs) = ws.borrow_io(&["a", "a"], &["b"]).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(outputs[0].name(), "b");
    }

    #[test]
    fn test_lookups_are_case_sensitive() {
        let mut ws = Workspace::new();
        let alloc = plain(&ws);
        ws.create_tensor("Conv1", alloc, DataType::Float32).unwrap();
        assert!(ws.has_tensor("Conv1"));
        assert!(!ws.has_tensor("conv1"));
        assert!(matches!(ws.get_tensor("conv1"), Err(Error::NotFound(_))));
    }
}
