//! Built-in tensor core recipes.

use crate::config::{CapsuleSpec, InstructionScope, Intrinsic, ReserveAxes};
use crate::error::RecipeError;
use crate::recipe::{Recipe, RecipeBuilder};

/// Fragment shapes (m, n, k) supported by the fp16 tensor core path.
pub const WMMA_SHAPES: [(usize, usize, usize); 3] = [(16, 16, 16), (32, 8, 16), (8, 32, 16)];

/// Operand layouts: `n` is row-major, `t` transposed. The three letters are
/// A, B and the accumulator.
pub const WMMA_COMPUTE_KEYS: [&str; 2] = ["nnn", "ntn"];

pub fn shape_key(m: usize, n: usize, k: usize) -> String {
    format!("{}x{}x{}", m, n, k)
}

fn capsule_graph(builder: RecipeBuilder) -> RecipeBuilder {
    builder
        .capsule(CapsuleSpec::load("load_a", 0))
        .capsule(CapsuleSpec::load("load_b", 1))
        .capsule(CapsuleSpec::compute("mma", &["load_a", "load_b"]))
        .capsule(CapsuleSpec::store("store", "mma"))
        .main_capsule("mma")
}

fn with_shapes(
    mut builder: RecipeBuilder,
    shapes: &[(usize, usize, usize)],
    prefix: &str,
) -> RecipeBuilder {
    for compute_key in WMMA_COMPUTE_KEYS {
        for &(m, n, k) in shapes {
            let sk = shape_key(m, n, k);
            let b_axes = if compute_key == "ntn" { [n, k] } else { [k, n] };
            builder = builder
                .reserve(compute_key, &sk, "load_a", ReserveAxes::new(&[m, k], &[]))
                .reserve(compute_key, &sk, "load_b", ReserveAxes::new(&b_axes, &[]))
                .reserve(compute_key, &sk, "mma", ReserveAxes::new(&[m, n], &[k]))
                .reserve(compute_key, &sk, "store", ReserveAxes::new(&[m, n], &[]));
            for capsule in ["load_a", "load_b", "mma", "store"] {
                builder = builder.intrinsic(
                    compute_key,
                    &sk,
                    capsule,
                    Intrinsic::new(format!("{}_{}_{}_{}", prefix, capsule, compute_key, sk)),
                );
            }
        }
    }
    builder
}

/// Warp-level `wmma` fp16 inputs with fp32 accumulation.
pub fn wmma_fp16_fp32() -> Result<Recipe, RecipeError> {
    let builder = capsule_graph(Recipe::builder(
        "wmma_fp16_fp32",
        "cuda",
        InstructionScope::Warp,
    ));
    with_shapes(builder, &WMMA_SHAPES, "wmma").build()
}

/// Thread-level `mma.sync` variant of the same fragment structure.
pub fn mma_sync_fp16_fp32() -> Result<Recipe, RecipeError> {
    let builder = capsule_graph(Recipe::builder(
        "mma_sync_fp16_fp32",
        "cuda",
        InstructionScope::Thread,
    ));
    with_shapes(builder, &WMMA_SHAPES[..1], "mma_sync").build()
}
