use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::allocator::{create_default_allocator, Allocator};
use crate::model::OperatorDef;
use crate::types::DeviceType;

use super::tensor::Tensor;

/// Per-call environment handed to a kernel
#[derive(Clone)]
pub struct OpContext {
    device_type: DeviceType,
    /// Allocator for short-lived scratch tensors
    allocator: Arc<dyn Allocator>,
    /// Thread pool for parallel execution
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl Debug for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpContext")
            .field("device_type", &self.device_type)
            .field("allocator", &self.allocator)
            .field("threads", &self.thread_pool.as_ref().map(|tp| tp.current_num_threads()))
            .finish()
    }
}

impl OpContext {
    pub fn new(device_type: DeviceType, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            device_type,
            allocator,
            thread_pool: None,
        }
    }

    /// CPU context with its own heap allocator
    pub fn cpu() -> Self {
        Self::new(DeviceType::Cpu, create_default_allocator(None))
    }

    /// Set the number of threads kernels fan out to (0 = rayon's global pool)
    pub fn set_thread_count(mut self, thread_count: usize) -> Result<Self> {
        self.thread_pool = if thread_count > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(thread_count)
                .build()
                .map_err(|e| {
                    Error::UnsupportedFeature(format!(
                        "Cannot build a thread pool of {} threads: {}",
                        thread_count, e
                    ))
                })?;
            Some(Arc::new(pool))
        } else {
            None
        };
        Ok(self)
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Get thread pool
    pub fn thread_pool(&self) -> Option<&rayon::ThreadPool> {
        self.thread_pool.as_ref().map(|tp| tp.as_ref())
    }

    /// Run `f` inside the context's thread pool, if it has one
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.thread_pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

/// A kernel run against tensors owned by a workspace
pub trait Operator: Send + Sync + Debug {
    /// Operator type name as it appears in the model
    fn op_type(&self) -> &str;

    /// Compute the outputs. Outputs are resized by the kernel.
    fn run(&self, context: &OpContext, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()>;
}

/// Builds an operator from its model definition
pub type OperatorCreator = fn(&OperatorDef) -> Result<Box<dyn Operator>>;

/// Registry of operator creators, keyed by op type
#[derive(Default)]
pub struct OperatorRegistry {
    creators: HashMap<String, OperatorCreator>,
}

impl Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.creators.keys().collect();
        names.sort();
        f.debug_struct("OperatorRegistry").field("operators", &names).finish()
    }
}

impl OperatorRegistry {
    /// Create a new operator registry
    pub fn new() -> Self {
        Self {
            creators: HashMap::new(),
        }
    }

    /// Register an operator
    pub fn register_operator(&mut self, op_type: &str, creator: OperatorCreator) -> Result<()> {
        if self.creators.contains_key(op_type) {
            return Err(Error::InvalidOperator(format!(
                "Operator {} is already registered",
                op_type
            )));
        }
        self.creators.insert(op_type.to_string(), creator);
        Ok(())
    }

    pub fn has_operator(&self, op_type: &str) -> bool {
        self.creators.contains_key(op_type)
    }

    /// Initialize the registry with standard operators
    pub fn initialize_standard_operators() -> Self {
        use crate::ops::nn::deconv::Deconv2d;

        let mut registry = Self::new();
        registry.creators.insert(Deconv2d::OP_TYPE.to_string(), Deconv2d::create);
        registry
    }

    /// Create an operator for a node
    pub fn create_operator(&self, op_def: &OperatorDef) -> Result<Box<dyn Operator>> {
        let creator = self.creators.get(&op_def.op_type).ok_or_else(|| {
            Error::UnsupportedFeature(format!(
                "Operator {} ({}) not found in registry",
                op_def.op_type, op_def.name
            ))
        })?;
        creator(op_def)
    }
}
