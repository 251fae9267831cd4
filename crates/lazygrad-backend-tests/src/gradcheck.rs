use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use lazygrad::{Feeds, Node, PortableBackend, Runtime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Tolerances for comparing analytic gradients against central differences in f32.
#[derive(Debug, Clone, Copy)]
pub struct GradCheck {
    pub epsilon: f32,
    pub atol: f32,
    pub rtol: f32,
}

impl Default for GradCheck {
    fn default() -> Self {
        GradCheck {
            epsilon: 1e-2,
            atol: 2e-2,
            rtol: 5e-2,
        }
    }
}

impl GradCheck {
    /// Compares `backward` against `(L(p + eps) - L(p - eps)) / 2eps` for every element of every
    /// parameter. Parameter data is restored afterwards.
    pub fn run<B: PortableBackend + 'static>(
        &self,
        backend: &Arc<B>,
        loss: &Node,
        parameters: &[Node],
        feeds: &Feeds,
    ) -> Result<()> {
        let runtime = Runtime::new(Arc::clone(backend));
        let analytic = runtime.backward(loss, parameters, feeds)?;

        for param in parameters {
            let label = param.describe();
            let original = param
                .data()
                .with_context(|| format!("parameter `{label}` has no data"))?;
            let grad = analytic
                .get(param)
                .with_context(|| format!("no gradient returned for `{label}`"))?;
            ensure!(grad.len() == original.len(), "gradient size for `{label}`");

            for index in 0..original.len() {
                let mut perturbed = original.clone();
                perturbed[index] = original[index] + self.epsilon;
                param.assign(perturbed.clone())?;
                let plus = scalar(&runtime, loss, feeds)?;
                perturbed[index] = original[index] - self.epsilon;
                param.assign(perturbed)?;
                let minus = scalar(&runtime, loss, feeds)?;
                param.assign(original.clone())?;

                let numeric = (plus - minus) / (2.0 * self.epsilon);
                let diff = (numeric - grad[index]).abs();
                ensure!(
                    diff <= self.atol + self.rtol * numeric.abs(),
                    "`{label}`[{index}]: analytic {} vs numeric {numeric}",
                    grad[index]
                );
            }
        }
        Ok(())
    }
}

fn scalar<B: PortableBackend>(runtime: &Runtime<B>, loss: &Node, feeds: &Feeds) -> Result<f32> {
    let values = runtime.evaluate(loss, feeds)?;
    ensure!(values.len() == 1, "loss must have a single element");
    Ok(values[0])
}

/// Uniform values in `[-scale, scale)` from a fixed seed.
pub fn uniform(seed: u64, len: usize, scale: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
}
