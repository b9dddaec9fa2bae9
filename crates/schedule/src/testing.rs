//! Shared graph fixtures for unit tests.

use crate::context::TransformState;
use std::sync::Arc;
use tileforge_intrinsics::{mma_sync_fp16_fp32, wmma_fp16_fp32, IntrinMatchResult};
use tileforge_ir::{axis, DataType, GraphBuilder};

/// Batched fp16 matmul with padded inputs and a trailing ReLU. `ko` is the
/// outer reduction extent; the inner 16x16x16 block is kept for the
/// tensor core instruction.
pub fn matmul_relu(ko: usize) -> TransformState {
    let mut builder = GraphBuilder::new();
    let a = builder.add_placeholder("A", &[4, ko, 16, 16], DataType::F16);
    let b = builder.add_placeholder("B", &[4, ko, 16, 16], DataType::F16);
    let a_pad = builder.add_elementwise("A_pad", a, DataType::F16);
    let b_pad = builder.add_elementwise("B_pad", b, DataType::F16);
    let c = builder.add_reduction(
        "C",
        vec![axis("io", 4), axis("jo", 4), axis("i", 16), axis("j", 16)],
        vec![axis("ko", ko), axis("k", 16)],
        &[a_pad, b_pad],
        DataType::F32,
    );
    builder.add_elementwise("D", c, DataType::F32);
    let graph = builder.build().unwrap();
    TransformState::new(graph, c)
}

pub fn wmma_match() -> IntrinMatchResult {
    IntrinMatchResult::new(Arc::new(wmma_fp16_fp32().unwrap()), "nnn", "16x16x16")
}

pub fn mma_sync_match() -> IntrinMatchResult {
    IntrinMatchResult::new(Arc::new(mma_sync_fp16_fp32().unwrap()), "nnn", "16x16x16")
}
