pub mod optim;
pub mod schedule;
pub mod trainer;

pub use optim::{step, Optimizer, Sgd};
pub use schedule::{ConstantSchedule, LrSchedule, StepDecay};
pub use trainer::Trainer;
