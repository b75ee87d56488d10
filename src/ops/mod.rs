pub mod registry;
pub mod tensor;

pub mod prelude {
    pub use super::registry::{OpContext, Operator, OperatorRegistry};
    pub use super::tensor::{MemorySource, Shape, Tensor};
}

pub use registry::{OpContext, Operator, OperatorRegistry};
pub use tensor::{MemorySource, Shape, Tensor};

// Module files for nn subdirectory
pub mod nn {
    pub mod deconv;
    pub mod padding;
}
