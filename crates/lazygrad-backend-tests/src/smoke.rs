use std::sync::Arc;

use lazygrad::ops::functional;
use lazygrad::train::{ConstantSchedule, Trainer};
use lazygrad::{Feeds, GraphArena, Node, NodeOps, PortableBackend, Runtime};

use crate::gradcheck::{uniform, GradCheck};
use crate::recording_backend::RecordingBackend;

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {index}: got {a}, expected {e} (actual {actual:?})"
        );
    }
}

fn runtime<B: PortableBackend + 'static>(backend: &Arc<B>) -> Runtime<B> {
    Runtime::new(Arc::clone(backend))
}

pub fn broadcast_arithmetic_chain<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.constant(vec![1.0; 4], &[2, 2]).unwrap();
    let b = arena.constant(vec![2.0], &[1]).unwrap();
    let c = a.add(&b).unwrap();
    let d = c.mul_scalar(4.0).unwrap();
    let e = functional::div_scalar(&d, 12.0).unwrap();

    runtime(backend)
        .run(&[&c, &d, &e], &Feeds::new())
        .unwrap();
    assert_eq!(c.data().unwrap(), vec![3.0; 4]);
    assert_eq!(d.data().unwrap(), vec![12.0; 4]);
    assert_close(&e.data().unwrap(), &[1.0; 4], 1e-6);
    assert_eq!(e.shape().dims(), &[2, 2]);
}

pub fn rerun_is_deterministic<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.constant(vec![0.5, -1.5, 2.0], &[3]).unwrap();
    let b = arena.constant(vec![3.0, 0.25, -1.0], &[3]).unwrap();
    let out = functional::tanh(&a.mul(&b).unwrap().add_scalar(0.1).unwrap()).unwrap();

    let rt = runtime(backend);
    let first = rt.evaluate(&out, &Feeds::new()).unwrap();
    let second = rt.evaluate(&out, &Feeds::new()).unwrap();
    assert_eq!(first, second);
}

pub fn placeholders_read_from_feeds<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[2]).unwrap();
    let y = x.mul_scalar(3.0).unwrap();

    let rt = runtime(backend);
    let feeds = Feeds::new().with(&x, vec![1.0, 2.0]);
    assert_eq!(rt.evaluate(&y, &feeds).unwrap(), vec![3.0, 6.0]);
    let feeds = Feeds::new().with(&x, vec![2.0, 2.0]);
    assert_eq!(rt.evaluate(&y, &feeds).unwrap(), vec![6.0, 6.0]);
    assert!(!x.has_data());
}

pub fn sum_reduces_to_single_element<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let v = arena.constant(vec![1.0, 2.0, 3.0], &[3]).unwrap();
    let m = arena.constant(vec![2.0; 4], &[2, 2]).unwrap();
    let sv = v.sum().unwrap();
    let sm = m.sum().unwrap();

    runtime(backend).run(&[&sv, &sm], &Feeds::new()).unwrap();
    assert_eq!(sv.shape().dims(), &[1]);
    assert_eq!(sv.data().unwrap(), vec![6.0]);
    assert_eq!(sm.data().unwrap(), vec![8.0]);
}

pub fn reductions_along_axes<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena
        .constant(vec![1.0, 5.0, 3.0, 4.0, 2.0, 6.0], &[2, 3])
        .unwrap();
    let row_max = functional::max_axes(&x, &[1], false).unwrap();
    let col_min = functional::min_axes(&x, &[0], false).unwrap();
    let row_mean = functional::mean_axes(&x, &[1], true).unwrap();
    let total_mean = x.mean().unwrap();

    runtime(backend)
        .run(&[&row_max, &col_min, &row_mean, &total_mean], &Feeds::new())
        .unwrap();
    assert_eq!(row_max.data().unwrap(), vec![5.0, 6.0]);
    assert_eq!(col_min.data().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(row_mean.shape().dims(), &[2, 1]);
    assert_close(&row_mean.data().unwrap(), &[3.0, 4.0], 1e-6);
    assert_close(&total_mean.data().unwrap(), &[3.5], 1e-6);
}

pub fn matmul_matches_expected<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.constant(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let b = arena.constant(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
    let c = a.matmul(&b).unwrap();

    let batched = arena
        .constant((1..=8).map(|v| v as f32).collect::<Vec<_>>(), &[2, 2, 2])
        .unwrap();
    let scale = arena.constant(vec![1.0, 0.0, 0.0, 2.0], &[2, 2]).unwrap();
    let shared = batched.matmul(&scale).unwrap();

    let lhs = arena.constant(vec![1.0, 2.0, 3.0, 4.0], &[2, 1, 2]).unwrap();
    let rhs = arena.constant(vec![1.0, 1.0, 2.0, 0.0], &[2, 2, 1]).unwrap();
    let per_batch = lhs.matmul(&rhs).unwrap();

    runtime(backend)
        .run(&[&c, &shared, &per_batch], &Feeds::new())
        .unwrap();
    assert_eq!(c.data().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
    assert_eq!(
        shared.data().unwrap(),
        vec![1.0, 4.0, 3.0, 8.0, 5.0, 12.0, 7.0, 16.0]
    );
    assert_eq!(per_batch.shape().dims(), &[2, 1, 1]);
    assert_eq!(per_batch.data().unwrap(), vec![3.0, 6.0]);
}

pub fn shape_ops_move_data<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena
        .constant(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .unwrap();
    let t = x.transpose(&[1, 0]).unwrap();
    let grid = arena
        .constant((0..12).map(|v| v as f32).collect::<Vec<_>>(), &[3, 4])
        .unwrap();
    let window = functional::slice(&grid, &[1, 1], &[2, 2]).unwrap();
    let left = arena.constant(vec![1.0, 2.0], &[2, 1]).unwrap();
    let right = arena.constant(vec![3.0, 4.0, 5.0, 6.0], &[2, 2]).unwrap();
    let joined = functional::concat(&[&left, &right], 1).unwrap();
    let row = arena.constant(vec![1.0, 2.0], &[2]).unwrap();
    let tiled = functional::broadcast_to(&row, &[2, 2]).unwrap();

    runtime(backend)
        .run(&[&t, &window, &joined, &tiled], &Feeds::new())
        .unwrap();
    assert_eq!(t.data().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert_eq!(window.data().unwrap(), vec![5.0, 6.0, 9.0, 10.0]);
    assert_eq!(joined.data().unwrap(), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    assert_eq!(tiled.data().unwrap(), vec![1.0, 2.0, 1.0, 2.0]);
}

pub fn conv2d_single_window<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let input = arena
        .constant((1..=9).map(|v| v as f32).collect::<Vec<_>>(), &[1, 3, 3, 1])
        .unwrap();
    let kernel = arena
        .constant(
            vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0],
            &[3, 3, 1, 1],
        )
        .unwrap();
    let out = functional::conv2d(&input, &kernel, [1, 1], [0, 0]).unwrap();

    let values = runtime(backend).evaluate(&out, &Feeds::new()).unwrap();
    assert_eq!(out.shape().dims(), &[1, 1, 1, 1]);
    assert_eq!(values, vec![80.0]);
}

pub fn conv2d_zero_padding<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let input = arena.ones(&[1, 3, 3, 1]).unwrap();
    let kernel = arena.ones(&[3, 3, 1, 2]).unwrap();
    let out = functional::conv2d(&input, &kernel, [1, 1], [1, 1]).unwrap();

    let values = runtime(backend).evaluate(&out, &Feeds::new()).unwrap();
    assert_eq!(out.shape().dims(), &[1, 3, 3, 2]);
    let expected: Vec<f32> = [4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
        .iter()
        .flat_map(|&v| [v, v])
        .collect();
    assert_eq!(values, expected);
}

pub fn pooling_windows<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena
        .constant((0..16).map(|v| v as f32).collect::<Vec<_>>(), &[1, 4, 4, 1])
        .unwrap();
    let max = functional::max_pool2d(&x, [2, 2], [2, 2]).unwrap();
    let avg = functional::avg_pool2d(&x, [2, 2], [2, 2]).unwrap();

    runtime(backend).run(&[&max, &avg], &Feeds::new()).unwrap();
    assert_eq!(max.shape().dims(), &[1, 2, 2, 1]);
    assert_eq!(max.data().unwrap(), vec![5.0, 7.0, 13.0, 15.0]);
    assert_close(&avg.data().unwrap(), &[2.5, 4.5, 10.5, 12.5], 1e-5);
}

pub fn one_hot_encodes_indices<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let indices = arena.constant(vec![0.0, 2.0, 1.0, 5.0], &[4]).unwrap();
    let encoded = functional::one_hot(&indices, 3).unwrap();

    let values = runtime(backend).evaluate(&encoded, &Feeds::new()).unwrap();
    assert_eq!(encoded.shape().dims(), &[4, 3]);
    assert_eq!(
        values,
        vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]
    );
}

pub fn softmax_rows_sum_to_one<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena
        .constant(vec![1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], &[2, 3])
        .unwrap();
    let probs = functional::softmax(&x, 1).unwrap();
    let log_probs = functional::log_softmax(&x, 1).unwrap();

    runtime(backend)
        .run(&[&probs, &log_probs], &Feeds::new())
        .unwrap();
    let third = 1.0 / 3.0;
    assert_close(
        &probs.data().unwrap(),
        &[0.090_030_57, 0.244_728_47, 0.665_240_96, third, third, third],
        1e-5,
    );
    let logs = log_probs.data().unwrap();
    assert_close(&logs[3..], &[third.ln(); 3], 1e-5);
}

pub fn one_submission_per_call<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let recording = Arc::new(RecordingBackend::new(Arc::clone(backend)));
    let rt = Runtime::new(Arc::clone(&recording));
    let arena = GraphArena::new();
    let w = arena.parameter("w", vec![1.0, 2.0], &[2]).unwrap();
    let a = w.exp().unwrap();
    let b = a.mul(&w).unwrap();
    let loss = b.sum().unwrap();

    rt.run(&[&a, &b, &loss], &Feeds::new()).unwrap();
    assert_eq!(recording.run_count(), 1);
    let function = recording.recorded_entry_function_or_panic();
    assert_eq!(function.result_ids.len(), 3);

    rt.backward(&loss, &[w], &Feeds::new()).unwrap();
    assert_eq!(recording.run_count(), 2);
}

pub fn product_rule_gradients<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.parameter("a", vec![1.0, 2.0, 3.0], &[3]).unwrap();
    let b = arena.parameter("b", vec![4.0, 5.0, 6.0], &[3]).unwrap();
    let loss = a.mul(&b).unwrap().sum().unwrap();

    let grads = runtime(backend)
        .backward(&loss, &[a.clone(), b.clone()], &Feeds::new())
        .unwrap();
    assert_eq!(loss.data().unwrap(), vec![32.0]);
    assert_eq!(grads[&a], vec![4.0, 5.0, 6.0]);
    assert_eq!(grads[&b], vec![1.0, 2.0, 3.0]);
}

pub fn broadcast_gradients_are_summed<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.parameter("a", vec![0.0; 6], &[2, 3]).unwrap();
    let bias = arena.parameter("bias", vec![1.0, 2.0, 3.0], &[3]).unwrap();
    let loss = a.add(&bias).unwrap().sum().unwrap();

    let grads = runtime(backend)
        .backward(&loss, &[a.clone(), bias.clone()], &Feeds::new())
        .unwrap();
    assert_eq!(grads[&a], vec![1.0; 6]);
    assert_eq!(grads[&bias], vec![2.0; 3]);
}

pub fn unrelated_parameters_get_zero_gradients<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let used = arena.parameter("used", vec![1.0, 2.0], &[2]).unwrap();
    let unused = arena.parameter("unused", vec![5.0, 5.0, 5.0], &[3]).unwrap();
    let loss = used.sum().unwrap();

    let grads = runtime(backend)
        .backward(&loss, &[used.clone(), unused.clone()], &Feeds::new())
        .unwrap();
    assert_eq!(grads[&used], vec![1.0, 1.0]);
    assert_eq!(grads[&unused], vec![0.0, 0.0, 0.0]);
}

pub fn stop_gradient_blocks_flow<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.parameter("a", vec![1.0, -2.0, 3.0], &[3]).unwrap();
    let frozen = a.stop_gradient().unwrap();
    let loss = frozen.mul(&a).unwrap().sum().unwrap();

    let grads = runtime(backend)
        .backward(&loss, &[a.clone()], &Feeds::new())
        .unwrap();
    assert_eq!(grads[&a], vec![1.0, -2.0, 3.0]);
}

pub fn one_hot_indices_get_zero_gradients<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let indices = arena.parameter("indices", vec![0.0, 1.0], &[2]).unwrap();
    let weights = arena
        .parameter("weights", vec![1.0, 2.0, 3.0, 4.0], &[2, 2])
        .unwrap();
    let loss = functional::one_hot(&indices, 2)
        .unwrap()
        .mul(&weights)
        .unwrap()
        .sum()
        .unwrap();

    let grads = runtime(backend)
        .backward(&loss, &[indices.clone(), weights.clone()], &Feeds::new())
        .unwrap();
    assert_eq!(loss.data().unwrap(), vec![5.0]);
    assert_eq!(grads[&indices], vec![0.0, 0.0]);
    assert_eq!(grads[&weights], vec![1.0, 0.0, 0.0, 1.0]);
}

pub fn max_pool_routes_gradient_to_winner<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena
        .parameter("x", vec![1.0, 4.0, 3.0, 2.0], &[1, 2, 2, 1])
        .unwrap();
    let loss = functional::max_pool2d(&x, [2, 2], [2, 2])
        .unwrap()
        .sum()
        .unwrap();

    let grads = runtime(backend)
        .backward(&loss, &[x.clone()], &Feeds::new())
        .unwrap();
    assert_eq!(grads[&x], vec![0.0, 1.0, 0.0, 0.0]);
}

pub fn gradcheck_elementwise<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    // Kept away from the relu and abs kinks.
    let x = arena
        .parameter("x", vec![-0.9, -0.5, -0.2, 0.3, 0.6, 1.1], &[2, 3])
        .unwrap();
    let pos = arena
        .parameter("pos", vec![0.5, 0.8, 1.2, 1.5, 0.9, 1.3], &[2, 3])
        .unwrap();
    let terms = [
        x.relu().unwrap(),
        functional::sigmoid(&x).unwrap(),
        functional::tanh(&x).unwrap(),
        x.exp().unwrap().mul_scalar(0.1).unwrap(),
        functional::abs(&x).unwrap(),
        pos.log().unwrap(),
        functional::sqrt(&pos).unwrap(),
        x.div(&pos).unwrap(),
        functional::reciprocal(&pos).unwrap(),
        x.maximum(&pos.mul_scalar(-0.5).unwrap()).unwrap(),
    ];
    let mut total = terms[0].clone();
    for term in &terms[1..] {
        total = total.add(term).unwrap();
    }
    let loss = total.sum().unwrap();

    GradCheck::default()
        .run(backend, &loss, &[x, pos], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_linear_regression<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena.constant(uniform(1, 12, 1.0), &[3, 4]).unwrap();
    let target = arena.constant(uniform(2, 6, 1.0), &[3, 2]).unwrap();
    let w = arena.parameter("w", uniform(3, 8, 0.5), &[4, 2]).unwrap();
    let b = arena.parameter("b", uniform(4, 2, 0.5), &[2]).unwrap();
    let prediction = x.matmul(&w).unwrap().add(&b).unwrap();
    let loss = functional::mse_loss(&prediction, &target).unwrap();

    GradCheck::default()
        .run(backend, &loss, &[w, b], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_batched_matmul<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.parameter("a", uniform(5, 12, 1.0), &[2, 2, 3]).unwrap();
    let b = arena.parameter("b", uniform(6, 12, 1.0), &[2, 3, 2]).unwrap();
    let shared = arena.parameter("shared", uniform(7, 6, 1.0), &[3, 2]).unwrap();
    let loss = a
        .matmul(&b)
        .unwrap()
        .add(&a.matmul(&shared).unwrap())
        .unwrap();
    let loss = functional::tanh(&loss).unwrap().sum().unwrap();

    GradCheck::default()
        .run(backend, &loss, &[a, b, shared], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_conv2d<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let input = arena
        .parameter("input", uniform(8, 32, 1.0), &[1, 4, 4, 2])
        .unwrap();
    let kernel = arena
        .parameter("kernel", uniform(9, 36, 0.5), &[3, 3, 2, 2])
        .unwrap();
    let padded = functional::conv2d(&input, &kernel, [1, 1], [1, 1]).unwrap();
    let strided = functional::conv2d(&input, &kernel, [2, 2], [0, 0]).unwrap();
    let loss = functional::tanh(&padded)
        .unwrap()
        .mean()
        .unwrap()
        .add(&functional::square(&strided).unwrap().sum().unwrap())
        .unwrap();

    GradCheck::default()
        .run(backend, &loss, &[input, kernel], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_pooling<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    // Distinct values spaced wider than the finite-difference step so the max never switches.
    let values: Vec<f32> = (0..16).map(|i| ((i * 7) % 16) as f32 * 0.1).collect();
    let x = arena.parameter("x", values, &[1, 4, 4, 1]).unwrap();
    let max = functional::max_pool2d(&x, [2, 2], [2, 2]).unwrap();
    let avg = functional::avg_pool2d(&x, [3, 3], [1, 1]).unwrap();
    let loss = functional::square(&max)
        .unwrap()
        .sum()
        .unwrap()
        .add(&functional::square(&avg).unwrap().sum().unwrap())
        .unwrap();

    GradCheck::default()
        .run(backend, &loss, &[x], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_reductions<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let values: Vec<f32> = (0..12).map(|i| ((i * 5) % 12) as f32 * 0.1 - 0.5).collect();
    let x = arena.parameter("x", values, &[3, 4]).unwrap();
    let weights = arena.constant(uniform(10, 3, 1.0), &[3]).unwrap();
    let row_max = functional::max_axes(&x, &[1], false).unwrap();
    let col_min = functional::min_axes(&x, &[0], false).unwrap();
    let row_mean = functional::mean_axes(&x, &[1], true).unwrap();
    let loss = row_max
        .mul(&weights)
        .unwrap()
        .sum()
        .unwrap()
        .add(&functional::square(&col_min).unwrap().sum().unwrap())
        .unwrap()
        .add(&functional::square(&row_mean).unwrap().sum().unwrap())
        .unwrap();

    GradCheck::default()
        .run(backend, &loss, &[x], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_shape_ops<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let a = arena.parameter("a", uniform(11, 12, 1.0), &[3, 4]).unwrap();
    let b = arena.parameter("b", uniform(12, 6, 1.0), &[3, 2]).unwrap();
    let row = arena.parameter("row", uniform(13, 5, 1.0), &[5]).unwrap();
    let window = functional::slice(&a, &[0, 1], &[2, 2]).unwrap();
    let flipped = b.transpose(&[1, 0]).unwrap();
    let joined = functional::concat(&[&window, &flipped], 1).unwrap();
    let tiled = functional::broadcast_to(&row, &[2, 5]).unwrap();
    let mixed = joined.mul(&tiled).unwrap().reshape(&[10]).unwrap();
    let coefficients = arena.constant(uniform(14, 10, 1.0), &[10]).unwrap();
    let loss = functional::tanh(&mixed)
        .unwrap()
        .mul(&coefficients)
        .unwrap()
        .sum()
        .unwrap();

    GradCheck::default()
        .run(backend, &loss, &[a, b, row], &Feeds::new())
        .unwrap();
}

pub fn gradcheck_softmax_cross_entropy<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let logits = arena
        .parameter("logits", uniform(15, 6, 2.0), &[2, 3])
        .unwrap();
    let classes = arena.constant(vec![0.0, 2.0], &[2]).unwrap();
    let labels = functional::one_hot(&classes, 3).unwrap();
    let ce = functional::cross_entropy_with_logits(&logits, &labels).unwrap();
    let weights = arena.constant(uniform(16, 6, 1.0), &[2, 3]).unwrap();
    let weighted = functional::softmax(&logits, 1)
        .unwrap()
        .mul(&weights)
        .unwrap()
        .sum()
        .unwrap();
    let loss = ce.add(&weighted).unwrap();

    GradCheck::default()
        .run(backend, &loss, &[logits], &Feeds::new())
        .unwrap();
}

pub fn sgd_step_updates_parameters<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let w = arena.parameter("w", vec![1.0, 2.0], &[2]).unwrap();
    let frozen = arena.parameter("frozen", vec![7.0], &[1]).unwrap();
    let loss = w.mul(&w).unwrap().sum().unwrap();

    lazygrad::train::step(
        &runtime(backend),
        &loss,
        &[w.clone(), frozen.clone()],
        0.1,
        &Feeds::new(),
    )
    .unwrap();
    assert_eq!(loss.data().unwrap(), vec![5.0]);
    assert_close(&w.data().unwrap(), &[0.8, 1.6], 1e-6);
    assert_eq!(frozen.data().unwrap(), vec![7.0]);
}

pub fn trainer_fits_a_line<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[4, 1]).unwrap();
    let y = arena.placeholder("y", &[4, 1]).unwrap();
    let w = arena.parameter("w", vec![0.0], &[1, 1]).unwrap();
    let b = arena.parameter("b", vec![0.0], &[1]).unwrap();
    let prediction = x.matmul(&w).unwrap().add(&b).unwrap();
    let loss = functional::mse_loss(&prediction, &y).unwrap();

    let feeds = Feeds::new()
        .with(&x, vec![0.0, 1.0, 2.0, 3.0])
        .with(&y, vec![1.0, 3.0, 5.0, 7.0]);
    let mut trainer = Trainer::new(
        runtime(backend),
        vec![w.clone(), b.clone()],
        ConstantSchedule { lr: 0.1 },
    );
    let first = trainer.train_step(&loss, &feeds).unwrap();
    let mut last = first;
    for _ in 0..199 {
        last = trainer.train_step(&loss, &feeds).unwrap();
    }
    assert_close(&[first], &[21.0], 1e-5);
    assert!(last < 1e-3, "loss did not converge: {last}");
    assert_close(&w.data().unwrap(), &[2.0], 5e-2);
    assert_close(&b.data().unwrap(), &[1.0], 5e-2);
}

/// Parameters shared by two losses keep their identity across separate backward calls.
pub fn gradients_are_keyed_by_node<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let arena = GraphArena::new();
    let p: Node = arena.parameter("p", vec![3.0], &[1]).unwrap();
    let double = p.mul_scalar(2.0).unwrap().sum().unwrap();
    let square = p.mul(&p).unwrap().sum().unwrap();

    let rt = runtime(backend);
    let g1 = rt.backward(&double, &[p.clone()], &Feeds::new()).unwrap();
    let g2 = rt.backward(&square, &[p.clone()], &Feeds::new()).unwrap();
    assert_eq!(g1[&p], vec![2.0]);
    assert_eq!(g2[&p], vec![6.0]);
}
