pub mod error;
pub mod execution;
pub mod layout;
pub mod memory;
pub mod model;
pub mod ops;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use execution::{LivenessPlan, SerialNet};
pub use layout::{ImageBufferType, ImageShape, TensorLayout};
pub use memory::{
    Allocator, DeviceAllocators, PoolOptions, PoolPlan, PoolStats, PooledAllocator, TensorAllocator, Workspace,
    WorkspaceOptions,
};
pub use model::{ArgValue, Argument, ConstTensor, MemoryArena, MemoryBlockDesc, NetDef, OperatorDef};
pub use ops::nn::deconv::{Deconv2d, PaddedOutput};
pub use ops::nn::padding::{FrameworkType, PaddingMode};
pub use ops::{OpContext, Operator, OperatorRegistry, Tensor};
pub use types::{DataType, DeviceType, Element};
