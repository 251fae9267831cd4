pub mod autodiff;
pub mod emit;
pub mod shape_helpers;
pub mod spec;
pub mod topology;
