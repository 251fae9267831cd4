use std::sync::Arc;

use lazygrad_backend_ref_cpu::CpuPortableBackend;

lazygrad_backend_tests::define_backend_tests!(cpu_backend, || Arc::new(
    CpuPortableBackend::new()
));
