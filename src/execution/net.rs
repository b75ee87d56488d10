use std::time::Instant;

use log::{debug, trace};

use crate::error::Result;
use crate::execution::liveness::LivenessPlan;
use crate::memory::workspace::{TensorAllocator, Workspace};
use crate::model::{NetDef, OperatorDef};
use crate::ops::registry::{OpContext, Operator, OperatorRegistry};

/// Runs a net's operators one after another against a workspace.
///
/// Before each operator its outputs are created (pooled when the plan gives
/// them a block, plain otherwise); afterwards every tensor with no remaining
/// consumer is removed, which hands its pool slot to the next tensor planned
/// into it.
#[derive(Debug)]
pub struct SerialNet {
    name: String,
    steps: Vec<(OperatorDef, Box<dyn Operator>)>,
    liveness: LivenessPlan,
    context: OpContext,
}

impl SerialNet {
    pub fn new(net: &NetDef, registry: &OperatorRegistry, context: OpContext) -> Result<Self> {
        let liveness = LivenessPlan::from_net(net)?;
        let steps = liveness
            .order()
            .iter()
            .map(|&index| {
                let op_def = net.ops[index].clone();
                let op = registry.create_operator(&op_def)?;
                Ok((op_def, op))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: net.name.clone(),
            steps,
            liveness,
            context,
        })
    }

    pub fn liveness(&self) -> &LivenessPlan {
        &self.liveness
    }

    pub fn context(&self) -> &OpContext {
        &self.context
    }

    /// Execute every operator in order
    pub fn run(&self, workspace: &mut Workspace) -> Result<()> {
        let start = Instant::now();
        for (step, (op_def, op)) in self.steps.iter().enumerate() {
            self.create_outputs(op_def, workspace)?;

            let op_start = Instant::now();
            {
                let (inputs, mut outputs) = workspace.borrow_io(&op_def.inputs, &op_def.outputs)?;
                op.run(&self.context, &inputs, &mut outputs)?;
            }
            trace!("Operator '{}' ({}) took {:?}", op_def.name, op.op_type(), op_start.elapsed());

            let removed = workspace.remove_unused_tensors(&self.liveness.live_after(step));
            if !removed.is_empty() {
                trace!("Step {} released {:?}", step, removed);
            }
        }
        debug!("Net '{}' ran {} operators in {:?}", self.name, self.steps.len(), start.elapsed());
        Ok(())
    }

    fn create_outputs(&self, op_def: &OperatorDef, workspace: &mut Workspace) -> Result<()> {
        for output in &op_def.outputs {
            let pooled = op_def.mem_id_of(output).is_some()
                && workspace
                    .pooled_allocator()
                    .map_or(false, |pool| pool.slot_of(output).is_some());
            let allocator = if pooled {
                TensorAllocator::Pooled
            } else {
                TensorAllocator::Plain(workspace.allocator(self.context.device_type())?)
            };
            workspace.create_tensor(output, allocator, op_def.output_type)?;
        }
        Ok(())
    }
}
