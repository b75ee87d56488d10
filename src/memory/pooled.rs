use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::ImageShape;
use crate::memory::allocator::Allocator;
use crate::memory::buffer::{Buffer, DeviceBuffer};
use crate::model::{MemoryBlockDesc, NetDef};
use crate::types::DeviceType;

/// Identifier of a physical block in the pool
pub type MemId = usize;

/// Slot plan produced by the graph compiler: the physical blocks to reserve
/// and which block each tensor is bound to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolPlan {
    pub blocks: Vec<MemoryBlockDesc>,
    pub assignments: HashMap<String, MemId>,
}

impl PoolPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a linear block
    pub fn with_block(mut self, mem_id: MemId, size_bytes: usize) -> Self {
        self.blocks.push(MemoryBlockDesc::linear(mem_id, size_bytes));
        self
    }

    /// Add a planned block description
    pub fn with_block_desc(mut self, desc: MemoryBlockDesc) -> Self {
        self.blocks.push(desc);
        self
    }

    /// Bind a tensor to a block
    pub fn assign(mut self, tensor_id: impl Into<String>, mem_id: MemId) -> Self {
        self.assignments.insert(tensor_id.into(), mem_id);
        self
    }

    /// Build the plan recorded in a model: the memory arena's blocks, and every
    /// operator output that carries a `mem_id`.
    pub fn from_net(net: &NetDef) -> Result<Self> {
        let arena = net.mem_arena.as_ref().ok_or_else(|| {
            Error::InvalidModel(format!("Net '{}' has no memory arena", net.name))
        })?;

        let mut plan = Self {
            blocks: arena.blocks.clone(),
            assignments: HashMap::new(),
        };
        for op in &net.ops {
            for (output, mem_id) in op.outputs.iter().zip(&op.mem_ids) {
                if let Some(mem_id) = mem_id {
                    plan.assignments.insert(output.clone(), *mem_id);
                }
            }
        }
        Ok(plan)
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Reject assigning a block that another tensor still holds
    pub validate_lifetimes: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            validate_lifetimes: cfg!(debug_assertions),
        }
    }
}

impl PoolOptions {
    pub fn set_validate_lifetimes(mut self, validate: bool) -> Self {
        self.validate_lifetimes = validate;
        self
    }
}

/// Snapshot of pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Number of planned blocks
    pub blocks: usize,
    /// Bytes currently reserved across all blocks
    pub reserved_bytes: usize,
    /// Blocks currently held by a tensor
    pub active_slots: usize,
}

#[derive(Debug)]
struct PoolBlock {
    storage: Option<Arc<DeviceBuffer>>,
    planned_size: usize,
    image_shape: Option<ImageShape>,
}

#[derive(Debug)]
struct Owner {
    tensor_id: String,
    holds: usize,
    /// Bumped on every take-over; leases from an earlier hold are ignored
    generation: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    blocks: BTreeMap<MemId, PoolBlock>,
    owners: HashMap<MemId, Owner>,
    next_generation: u64,
}

/// Preallocated reuse pool.
///
/// Physical blocks are reserved up front and handed out to the tensors the
/// plan binds to them. Several tensors share one block; the pool trusts the
/// planner that their lifetimes never overlap and does not check it unless
/// [`PoolOptions::validate_lifetimes`] is set. Without validation an
/// overlapping assignment only records the new owner.
///
/// A block that is too small for a request is replaced by a bigger one.
/// Buffers handed out earlier keep the old block alive, so growth never
/// invalidates a live view.
#[derive(Debug)]
pub struct PooledAllocator {
    allocator: Arc<dyn Allocator>,
    options: PoolOptions,
    assignments: HashMap<String, MemId>,
    state: Mutex<PoolState>,
}

impl PooledAllocator {
    /// Reserve every planned block. Blocks planned with size 0 are allocated
    /// on first use.
    pub fn new(plan: PoolPlan, allocator: Arc<dyn Allocator>, options: PoolOptions) -> Result<Self> {
        let mut blocks = BTreeMap::new();
        for desc in &plan.blocks {
            if blocks.contains_key(&desc.mem_id) {
                return Err(Error::InvalidModel(format!(
                    "Memory block {} is planned twice",
                    desc.mem_id
                )));
            }

            let storage = match desc.image_shape {
                Some(shape) => Some(Arc::new(DeviceBuffer::allocate_image(
                    allocator.clone(),
                    shape,
                    desc.data_type.size_in_bytes(),
                )?)),
                None if desc.size_bytes > 0 => Some(Arc::new(DeviceBuffer::allocate(
                    allocator.clone(),
                    desc.size_bytes,
                )?)),
                None => None,
            };

            blocks.insert(
                desc.mem_id,
                PoolBlock {
                    storage,
                    planned_size: desc.size_bytes,
                    image_shape: desc.image_shape,
                },
            );
        }

        for (tensor_id, mem_id) in &plan.assignments {
            if !blocks.contains_key(mem_id) {
                return Err(Error::InvalidModel(format!(
                    "Tensor '{}' is assigned to unplanned memory block {}",
                    tensor_id, mem_id
                )));
            }
        }

        debug!(
            "Pool reserved {} blocks for {} tensors on {}",
            blocks.len(),
            plan.assignments.len(),
            allocator.device_type()
        );

        Ok(Self {
            allocator,
            options,
            assignments: plan.assignments,
            state: Mutex::new(PoolState {
                blocks,
                ..Default::default()
            }),
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|_| Error::Allocation("Failed to lock pool state".to_string()))
    }

    /// Bind `tensor_id` to its planned block and return a view of
    /// `required_bytes` into it.
    pub fn assign_slot(self: &Arc<Self>, tensor_id: &str, required_bytes: usize) -> Result<Buffer> {
        let mem_id = self.slot_of(tensor_id).ok_or_else(|| {
            Error::Allocation(format!("Tensor '{}' has no pool slot", tensor_id))
        })?;

        let mut state = self.lock_state()?;

        let takes_over = match state.owners.get(&mem_id) {
            Some(owner) if owner.tensor_id != tensor_id => {
                if self.options.validate_lifetimes {
                    return Err(Error::Allocation(format!(
                        "Memory block {} is still held by '{}' while assigning '{}'",
                        mem_id, owner.tensor_id, tensor_id
                    )));
                }
                warn!(
                    "Memory block {} reassigned from '{}' to '{}' while still held",
                    mem_id, owner.tensor_id, tensor_id
                );
                true
            }
            Some(_) => false,
            None => true,
        };

        let block = state.blocks.get_mut(&mem_id).ok_or_else(|| {
            Error::Allocation(format!("Memory block {} is not planned", mem_id))
        })?;

        let too_small = block
            .storage
            .as_ref()
            .map_or(true, |storage| storage.size() < required_bytes);
        if too_small {
            if let Some(shape) = block.image_shape {
                return Err(Error::Allocation(format!(
                    "Image block {} ({}x{}) cannot hold {} bytes",
                    mem_id, shape.width, shape.height, required_bytes
                )));
            }
            let size = required_bytes.max(block.planned_size);
            let storage = DeviceBuffer::allocate(self.allocator.clone(), size)?;
            debug!("Memory block {} grown to {} bytes", mem_id, size);
            block.storage = Some(Arc::new(storage));
        }

        let storage = match &block.storage {
            Some(storage) => storage.clone(),
            None => {
                return Err(Error::Allocation(format!(
                    "Memory block {} has no backing storage",
                    mem_id
                )))
            }
        };

        let held = match state.owners.get_mut(&mem_id) {
            Some(owner) if !takes_over => {
                owner.holds += 1;
                Some(owner.generation)
            }
            _ => None,
        };
        let generation = match held {
            Some(generation) => generation,
            None => {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.owners.insert(
                    mem_id,
                    Owner {
                        tensor_id: tensor_id.to_string(),
                        holds: 1,
                        generation,
                    },
                );
                generation
            }
        };

        trace!("Assigned memory block {} to '{}' ({} bytes)", mem_id, tensor_id, required_bytes);

        let lease = SlotLease {
            pool: Arc::clone(self),
            tensor_id: tensor_id.to_string(),
            mem_id,
            generation,
        };
        Ok(Buffer::pooled(storage, required_bytes, lease))
    }

    /// Mark the tensor's block unused. The memory is neither zeroed nor freed.
    pub fn release_slot(&self, tensor_id: &str) {
        let Some(mem_id) = self.slot_of(tensor_id) else {
            return;
        };
        if let Ok(mut state) = self.state.lock() {
            if state
                .owners
                .get(&mem_id)
                .map_or(false, |owner| owner.tensor_id == tensor_id)
            {
                state.owners.remove(&mem_id);
                debug!("Released memory block {} from '{}'", mem_id, tensor_id);
            }
        }
    }

    fn release_lease(&self, tensor_id: &str, mem_id: MemId, generation: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let released = match state.owners.get_mut(&mem_id) {
            Some(owner) if owner.tensor_id == tensor_id && owner.generation == generation => {
                owner.holds -= 1;
                owner.holds == 0
            }
            _ => false,
        };
        if released {
            state.owners.remove(&mem_id);
            trace!("Released memory block {} from '{}'", mem_id, tensor_id);
        }
    }

    /// Block a tensor is planned into
    pub fn slot_of(&self, tensor_id: &str) -> Option<MemId> {
        self.assignments.get(tensor_id).copied()
    }

    /// Current capacity of a block in bytes, 0 if not yet allocated
    pub fn block_capacity(&self, mem_id: MemId) -> Option<usize> {
        let state = self.state.lock().ok()?;
        state
            .blocks
            .get(&mem_id)
            .map(|block| block.storage.as_ref().map_or(0, |s| s.size()))
    }

    /// Image extent of a block, if it is image-backed
    pub fn block_image_shape(&self, mem_id: MemId) -> Option<ImageShape> {
        let state = self.state.lock().ok()?;
        state.blocks.get(&mem_id).and_then(|block| block.image_shape)
    }

    /// Tensor currently holding a block
    pub fn holder_of(&self, mem_id: MemId) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.owners.get(&mem_id).map(|owner| owner.tensor_id.clone())
    }

    pub fn stats(&self) -> PoolStats {
        match self.state.lock() {
            Ok(state) => PoolStats {
                blocks: state.blocks.len(),
                reserved_bytes: state
                    .blocks
                    .values()
                    .filter_map(|block| block.storage.as_ref())
                    .map(|storage| storage.size())
                    .sum(),
                active_slots: state.owners.len(),
            },
            Err(_) => PoolStats::default(),
        }
    }

    /// Device the pool's blocks live on
    pub fn device_type(&self) -> DeviceType {
        self.allocator.device_type()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
}

/// Hold on a pool block, released when the owning buffer is dropped
pub(crate) struct SlotLease {
    pool: Arc<PooledAllocator>,
    tensor_id: String,
    mem_id: MemId,
    generation: u64,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release_lease(&self.tensor_id, self.mem_id, self.generation);
    }
}
