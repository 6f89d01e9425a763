//! Dense tensor kernels: SIMD primitives plus the matmul/softmax/layer-norm
//! building blocks the forward and backward passes compose.

pub mod ops;
pub mod simd;

pub use ops::{
    col_sums, gelu, gelu_grad, hadamard, layer_norm, layer_norm_backward, matmul,
    matmul_add_bias, relu, relu_grad, scale, softmax_backward, softmax_rowwise, transpose, Mat,
};
