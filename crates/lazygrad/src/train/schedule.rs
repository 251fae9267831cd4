pub trait LrSchedule {
    fn learning_rate(&self, step: usize) -> f32;
}

pub struct ConstantSchedule {
    pub lr: f32,
}

impl LrSchedule for ConstantSchedule {
    fn learning_rate(&self, _step: usize) -> f32 {
        self.lr
    }
}

/// Multiplies the rate by `gamma` every `step_size` steps.
pub struct StepDecay {
    pub initial: f32,
    pub gamma: f32,
    pub step_size: usize,
}

impl LrSchedule for StepDecay {
    fn learning_rate(&self, step: usize) -> f32 {
        let decays = step / self.step_size.max(1);
        self.initial * self.gamma.powi(decays.min(i32::MAX as usize) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decay_drops_at_boundaries() {
        let schedule = StepDecay {
            initial: 1.0,
            gamma: 0.5,
            step_size: 10,
        };
        assert_eq!(schedule.learning_rate(0), 1.0);
        assert_eq!(schedule.learning_rate(9), 1.0);
        assert_eq!(schedule.learning_rate(10), 0.5);
        assert_eq!(schedule.learning_rate(25), 0.25);
    }
}
