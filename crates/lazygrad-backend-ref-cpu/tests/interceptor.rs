use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lazygrad::backend::spec::{
    BackendError, BackendResult, ElementwiseUnaryOp, Operation, PortableBackend, Program,
    ProgramBuilder, Shape, SliceSpec, TensorLiteral, TensorSpec,
};
use lazygrad::{train, Feeds, GraphArena, GraphError, NodeOps, Runtime};
use lazygrad_backend_ref_cpu::{
    CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend,
};

/// Replaces `exp` with a kernel that returns zeros.
#[derive(Default)]
struct ZeroExp {
    hits: AtomicUsize,
}

impl CpuKernelInterceptor for ZeroExp {
    fn try_execute(
        &self,
        op: &Operation,
        _inputs: &[CpuTensor],
        output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        match op {
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp) => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                let len = output.element_count()?;
                Some(Ok(CpuTensor::new(output.clone(), vec![0.0; len])))
            }
            _ => None,
        }
    }
}

/// Fails every `exp` with an execution error.
struct FailingExp;

impl CpuKernelInterceptor for FailingExp {
    fn try_execute(
        &self,
        op: &Operation,
        _inputs: &[CpuTensor],
        _output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        match op {
            Operation::ElementwiseUnary(ElementwiseUnaryOp::Exp) => {
                Some(Err(BackendError::execution("exp unavailable")))
            }
            _ => None,
        }
    }
}

#[test]
fn backend_failure_leaves_node_data_unchanged() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let healthy = Runtime::new(Arc::new(CpuPortableBackend::new()));
    let failing = Runtime::new(Arc::new(GenericCpuBackend::with_interceptor(FailingExp)));

    let arena = GraphArena::new();
    let w = arena.parameter("w", vec![0.0, 1.0], &[2])?;
    let doubled = w.mul_scalar(2.0)?;
    let loss = w.exp()?.sum()?;
    healthy.run(&[&doubled, &loss], &Feeds::new())?;
    let before = loss.data();

    let err = failing.run(&[&doubled, &loss], &Feeds::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<GraphError>(),
        Some(GraphError::Backend(_))
    ));
    assert_eq!(doubled.data(), Some(vec![0.0, 2.0]));
    assert_eq!(loss.data(), before);

    assert!(train::step(&failing, &loss, &[w.clone()], 0.1, &Feeds::new()).is_err());
    assert_eq!(w.data(), Some(vec![0.0, 1.0]));
    assert_eq!(loss.data(), before);
    Ok(())
}

#[test]
fn interceptor_takes_over_matching_ops() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(GenericCpuBackend::with_interceptor(ZeroExp::default()));
    let runtime = Runtime::new(Arc::clone(&backend));

    let arena = GraphArena::new();
    let x = arena.constant(vec![1.0, 2.0], &[2])?;
    let y = x.exp()?.add_scalar(1.0)?;
    let values = runtime.evaluate(&y, &Feeds::new())?;

    assert_eq!(values, vec![1.0, 1.0]);
    assert_eq!(backend.interceptor().hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn kernel_errors_name_the_failing_instruction() {
    let mut builder = ProgramBuilder::new();
    let x = builder.add_parameter(TensorSpec::new(Shape::new([4])));
    let bad = builder.emit_single(
        Operation::Slice(SliceSpec {
            starts: vec![3],
            sizes: vec![2],
        }),
        vec![x],
        TensorSpec::new(Shape::new([2])),
    );
    let function = builder.finish("main", vec![bad]).unwrap();
    let program = Program::new("main").with_functions(vec![function]);

    let backend = CpuPortableBackend::new();
    let literal = TensorLiteral::from_f32(
        TensorSpec::new(Shape::new([4])),
        &[1.0, 2.0, 3.0, 4.0],
    );
    let input = backend.materialize(literal).unwrap();
    let err = backend.run_program(&program, &[input]).unwrap_err();
    match err {
        BackendError::Execution { message } => {
            assert!(message.contains("slice out of bounds"), "{message}");
            assert!(message.contains("instruction #0"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn entry_input_count_is_checked() {
    let mut builder = ProgramBuilder::new();
    let x = builder.add_parameter(TensorSpec::new(Shape::new([1])));
    let function = builder.finish("main", vec![x]).unwrap();
    let program = Program::new("main").with_functions(vec![function]);

    let backend = CpuPortableBackend::new();
    assert!(backend.run_program(&program, &[]).is_err());
}
