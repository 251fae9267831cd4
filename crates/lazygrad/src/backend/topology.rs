use std::collections::HashSet;

use thiserror::Error;

use crate::backend::spec::{Function, ValueId};

/// SSA ordering defect found in a function body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("operand value {missing} is missing before instruction {instruction}")]
    UseBeforeDef {
        missing: ValueId,
        instruction: ValueId,
    },
    #[error("value {0} is defined more than once")]
    Redefined(ValueId),
    #[error("result value {0} is never defined")]
    UndefinedResult(ValueId),
}

/// Checks that every operand and result refers to a value defined earlier in the function.
pub fn validate_function_topology(function: &Function) -> Result<(), TopologyError> {
    let mut available = HashSet::new();
    for id in &function.parameter_ids {
        if !available.insert(*id) {
            return Err(TopologyError::Redefined(*id));
        }
    }

    for instruction in &function.body {
        for operand in &instruction.operands {
            if !available.contains(operand) {
                return Err(TopologyError::UseBeforeDef {
                    missing: *operand,
                    instruction: instruction.id,
                });
            }
        }
        if !available.insert(instruction.id) {
            return Err(TopologyError::Redefined(instruction.id));
        }
    }

    for id in &function.result_ids {
        if !available.contains(id) {
            return Err(TopologyError::UndefinedResult(*id));
        }
    }

    Ok(())
}
