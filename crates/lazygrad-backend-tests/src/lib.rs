pub mod gradcheck;
pub mod recording_backend;
pub mod smoke;

/// Expands to a test module that runs every shared conformance case against the backend
/// returned by `$backend_ctor` (a closure producing `Arc<B>`).
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        smoke::$name(&backend);
                    }
                };
            }

            smoke_test!(broadcast_arithmetic_chain);
            smoke_test!(rerun_is_deterministic);
            smoke_test!(placeholders_read_from_feeds);
            smoke_test!(sum_reduces_to_single_element);
            smoke_test!(reductions_along_axes);
            smoke_test!(matmul_matches_expected);
            smoke_test!(shape_ops_move_data);
            smoke_test!(conv2d_single_window);
            smoke_test!(conv2d_zero_padding);
            smoke_test!(pooling_windows);
            smoke_test!(one_hot_encodes_indices);
            smoke_test!(softmax_rows_sum_to_one);
            smoke_test!(one_submission_per_call);
            smoke_test!(product_rule_gradients);
            smoke_test!(broadcast_gradients_are_summed);
            smoke_test!(unrelated_parameters_get_zero_gradients);
            smoke_test!(stop_gradient_blocks_flow);
            smoke_test!(one_hot_indices_get_zero_gradients);
            smoke_test!(max_pool_routes_gradient_to_winner);
            smoke_test!(gradcheck_elementwise);
            smoke_test!(gradcheck_linear_regression);
            smoke_test!(gradcheck_batched_matmul);
            smoke_test!(gradcheck_conv2d);
            smoke_test!(gradcheck_pooling);
            smoke_test!(gradcheck_reductions);
            smoke_test!(gradcheck_shape_ops);
            smoke_test!(gradcheck_softmax_cross_entropy);
            smoke_test!(sgd_step_updates_parameters);
            smoke_test!(trainer_fits_a_line);
            smoke_test!(gradients_are_keyed_by_node);
        }
    };
}
