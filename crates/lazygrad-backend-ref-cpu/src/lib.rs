//! Reference CPU backend: a straightforward interpreter for lazygrad programs.
//!
//! Kernels favour readability over speed. A [`CpuKernelInterceptor`] can take over individual
//! operations without forking the backend.

pub mod cpu;

pub use cpu::{
    CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend, NoopInterceptor,
};
