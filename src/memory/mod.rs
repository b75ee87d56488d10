pub mod allocator;
pub mod buffer;
pub mod pooled;
pub mod workspace;

pub use allocator::{
    create_default_allocator,
    Allocator,
    DeviceAllocators,
    ImageAllocator,
    MemoryBlock,
    SystemAllocator,
};

pub use buffer::{Buffer, DeviceBuffer};

pub use pooled::{MemId, PoolOptions, PoolPlan, PoolStats, PooledAllocator};

pub use workspace::{TensorAllocator, Workspace, WorkspaceOptions};
