use std::sync::Arc;

use lazygrad::graph::GraphBuilder;
use lazygrad::{Feeds, GraphArena, GraphError, NodeOps, Runtime, RuntimeConfig};
use lazygrad_backend_ref_cpu::CpuPortableBackend;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn runtime() -> Runtime<CpuPortableBackend> {
    init_logging();
    Runtime::with_config(
        Arc::new(CpuPortableBackend::new()),
        RuntimeConfig::new()
            .with_verify_programs(true)
            .with_trace_programs(true),
    )
}

fn graph_error(err: &anyhow::Error) -> &GraphError {
    err.downcast_ref::<GraphError>()
        .unwrap_or_else(|| panic!("expected a GraphError, got {err:?}"))
}

#[test]
fn run_writes_every_root() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let a = arena.constant(vec![1.0, 2.0], &[2])?;
    let b = a.mul_scalar(2.0)?;
    let c = b.add(&a)?;
    rt.run(&[&c, &b, &c], &Feeds::new())?;
    assert_eq!(b.data(), Some(vec![2.0, 4.0]));
    assert_eq!(c.data(), Some(vec![3.0, 6.0]));
    Ok(())
}

#[test]
fn leaf_roots_are_returned_as_is() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let a = arena.constant(vec![4.0, 5.0], &[2])?;
    assert_eq!(rt.evaluate(&a, &Feeds::new())?, vec![4.0, 5.0]);
    Ok(())
}

#[test]
fn missing_feed_names_the_placeholder() {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("tokens", &[3]).unwrap();
    let y = x.exp().unwrap();

    let err = rt.run(&[&y], &Feeds::new()).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::MissingFeed { label } if label == "tokens"
    ));
    assert!(!y.has_data());
}

#[test]
fn failed_run_keeps_previous_root_values() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[2])?;
    let w = arena.parameter("w", vec![1.0, 3.0], &[2])?;
    let y = x.mul(&w)?;
    let z = w.add_scalar(1.0)?;

    rt.run(&[&y, &z], &Feeds::new().with(&x, vec![2.0, 2.0]))?;
    let err = rt.run(&[&y, &z], &Feeds::new()).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::MissingFeed { .. }));
    assert_eq!(y.data(), Some(vec![2.0, 6.0]));
    assert_eq!(z.data(), Some(vec![2.0, 4.0]));
    assert_eq!(w.data(), Some(vec![1.0, 3.0]));
    assert!(!x.has_data());
    Ok(())
}

#[test]
fn placeholder_roots_stay_unbound() -> anyhow::Result<()> {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[1])?;

    assert_eq!(rt.evaluate(&x, &Feeds::new().with(&x, vec![1.0]))?, vec![1.0]);
    assert!(!x.has_data());

    let y = x.mul_scalar(2.0)?;
    assert_eq!(rt.evaluate(&y, &Feeds::new().with(&x, vec![5.0]))?, vec![10.0]);
    rt.run(&[&x, &y], &Feeds::new().with(&x, vec![4.0]))?;
    assert!(!x.has_data());
    assert_eq!(y.data(), Some(vec![8.0]));
    Ok(())
}

#[test]
fn feed_length_must_match_placeholder() {
    let rt = runtime();
    let arena = GraphArena::new();
    let x = arena.placeholder("x", &[2, 2]).unwrap();
    let y = x.sum().unwrap();

    let feeds = Feeds::new().with(&x, vec![1.0, 2.0, 3.0]);
    let err = rt.run(&[&y], &feeds).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::DimensionMismatch {
            expected: 4,
            actual: 3,
            ..
        }
    ));
}

#[test]
fn roots_from_different_arenas_are_rejected() {
    let rt = runtime();
    let a = GraphArena::new().constant(vec![1.0], &[1]).unwrap();
    let b = GraphArena::new().constant(vec![1.0], &[1]).unwrap();
    let err = rt.run(&[&a, &b], &Feeds::new()).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ForeignNode { .. }));
}

#[test]
fn empty_root_list_is_an_error() {
    let rt = runtime();
    let err = rt.run(&[], &Feeds::new()).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::EmptyGraph));
}

#[test]
fn custom_entry_name_is_used() -> anyhow::Result<()> {
    init_logging();
    let rt = Runtime::with_config(
        Arc::new(CpuPortableBackend::new()),
        RuntimeConfig::new().with_entry_name("forward"),
    );
    let arena = GraphArena::new();
    let a = arena.constant(vec![1.0], &[1])?;
    assert_eq!(rt.evaluate(&a.neg()?, &Feeds::new())?, vec![-1.0]);
    Ok(())
}

#[test]
fn lowering_is_not_cached_between_builds() -> anyhow::Result<()> {
    let arena = GraphArena::new();
    let w = arena.parameter("w", vec![1.0], &[1])?;
    let y = w.mul_scalar(3.0)?;

    let first = GraphBuilder::build(&[&y])?;
    w.assign(vec![2.0])?;
    let second = GraphBuilder::build(&[&y])?;
    assert_eq!(first.node_count, second.node_count);

    let rt = runtime();
    assert_eq!(rt.evaluate(&y, &Feeds::new())?, vec![6.0]);
    Ok(())
}
