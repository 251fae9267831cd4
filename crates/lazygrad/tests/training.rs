use std::sync::Arc;

use lazygrad::ops::functional;
use lazygrad::train::{self, Optimizer, Sgd, StepDecay, Trainer};
use lazygrad::{Feeds, GradientMap, GraphArena, GraphError, NodeOps, Runtime};
use lazygrad_backend_ref_cpu::CpuPortableBackend;

fn runtime() -> Runtime<CpuPortableBackend> {
    let _ = env_logger::builder().is_test(true).try_init();
    Runtime::new(Arc::new(CpuPortableBackend::new()))
}

fn graph_error(err: &anyhow::Error) -> &GraphError {
    err.downcast_ref::<GraphError>()
        .unwrap_or_else(|| panic!("expected a GraphError, got {err:?}"))
}

#[test]
fn backward_rejects_parameters_from_another_graph() {
    let rt = runtime();
    let arena = GraphArena::new();
    let w = arena.parameter("w", vec![1.0], &[1]).unwrap();
    let loss = w.mul(&w).unwrap().sum().unwrap();
    let stranger = GraphArena::new()
        .parameter("stranger", vec![1.0], &[1])
        .unwrap();

    let err = rt.backward(&loss, &[w, stranger], &Feeds::new()).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::ParameterNotInGraph { label } if label == "stranger"
    ));
    assert!(!loss.has_data());
}

#[test]
fn backward_writes_the_forward_loss() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[3])?;
    let w = arena.parameter("w", vec![0.5, -1.0, 2.0], &[3])?;
    let loss = x.mul(&w)?.sum()?;

    let feeds = Feeds::new().with(&x, vec![1.0, 2.0, 3.0]);
    let grads = rt.backward(&loss, &[w.clone()], &feeds)?;
    assert_eq!(loss.data(), Some(vec![4.5]));
    assert_eq!(grads[&w], vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn sgd_update_is_all_or_nothing() -> anyhow::Result<()> {
    let arena = GraphArena::new();
    let a = arena.parameter("a", vec![1.0, 1.0], &[2])?;
    let b = arena.parameter("b", vec![1.0], &[1])?;
    let mut grads = GradientMap::new();
    grads.insert(a.clone(), vec![1.0, 1.0]);
    grads.insert(b.clone(), vec![1.0, 1.0]);

    let err = Sgd::new(0.5).apply(&[a.clone(), b.clone()], &grads).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::DimensionMismatch { .. }));
    assert_eq!(a.data(), Some(vec![1.0, 1.0]));
    assert_eq!(b.data(), Some(vec![1.0]));
    Ok(())
}

#[test]
fn sgd_needs_parameter_data() -> anyhow::Result<()> {
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[1])?;
    let err = Sgd::new(0.1).apply(&[x], &GradientMap::new()).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::MissingData { .. }));
    Ok(())
}

#[test]
fn failed_step_changes_neither_loss_nor_parameters() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[2])?;
    let w = arena.parameter("w", vec![1.0, 2.0], &[2])?;
    let loss = x.mul(&w)?.sum()?.add_scalar(1.0)?;
    let feeds = Feeds::new().with(&x, vec![3.0, 3.5]);

    let err = train::step(&rt, &loss, &[w.clone(), x.clone()], 0.1, &feeds).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::MissingData { label } if label == "x"
    ));
    assert!(!loss.has_data());
    assert_eq!(w.data(), Some(vec![1.0, 2.0]));

    let hidden = w.mul_scalar(2.0)?.named("hidden");
    let err = Sgd::new(0.1)
        .step(&rt, &loss, &[w.clone(), hidden], &feeds)
        .unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::NotALeaf { label } if label == "hidden"
    ));
    assert!(!loss.has_data());
    assert_eq!(w.data(), Some(vec![1.0, 2.0]));

    train::step(&rt, &loss, &[w.clone()], 0.1, &feeds)?;
    assert_eq!(loss.data(), Some(vec![11.0]));
    let updated = w.data().unwrap();
    assert!((updated[0] - 0.7).abs() < 1e-6 && (updated[1] - 1.65).abs() < 1e-6);
    Ok(())
}

#[test]
fn failed_forward_leaves_the_loss_untouched() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[1])?;
    let w = arena.parameter("w", vec![2.0], &[1])?;
    let loss = x.mul(&w)?.sum()?;

    train::step(&rt, &loss, &[w.clone()], 0.5, &Feeds::new().with(&x, vec![1.0]))?;
    assert_eq!(loss.data(), Some(vec![2.0]));
    assert_eq!(w.data(), Some(vec![1.5]));

    let err = train::step(&rt, &loss, &[w.clone()], 0.5, &Feeds::new()).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::MissingFeed { .. }));
    assert_eq!(loss.data(), Some(vec![2.0]));
    assert_eq!(w.data(), Some(vec![1.5]));
    Ok(())
}

#[test]
fn classifier_loss_decreases_with_step_decay() -> anyhow::Result<()> {
    let arena = GraphArena::new();
    let inputs = arena.placeholder("inputs", &[4, 2])?;
    let classes = arena.placeholder("classes", &[4])?;
    let w = arena.parameter("w", vec![0.1, -0.1, 0.0, 0.2, -0.2, 0.1], &[2, 3])?;
    let b = arena.parameter("b", vec![0.0; 3], &[3])?;
    let logits = inputs.matmul(&w)?.add(&b)?;
    let labels = functional::one_hot(&classes, 3)?;
    let loss = functional::cross_entropy_with_logits(&logits, &labels)?;

    let feeds = Feeds::new()
        .with(&inputs, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, -1.0, 0.0])
        .with(&classes, vec![0.0, 1.0, 2.0, 1.0]);
    let schedule = StepDecay {
        initial: 0.5,
        gamma: 0.5,
        step_size: 50,
    };
    let mut trainer = Trainer::new(runtime(), vec![w, b], schedule);

    let first = trainer.train_step(&loss, &feeds)?;
    let mut last = first;
    for _ in 0..99 {
        last = trainer.train_step(&loss, &feeds)?;
    }
    assert_eq!(trainer.step, 100);
    assert!((trainer.optimizer.learning_rate() - 0.25).abs() < 1e-6);
    assert!(last < first * 0.5, "loss went from {first} to {last}");
    Ok(())
}
