//! Built-in program constructors.
//!
//! The dispatch core itself needs the pack/unpack conversion kernels, and
//! the elementwise/fill builders give callers (and the test suite) ready
//! instances of the `Program` extension point. Operator libraries build
//! their own programs the same way; nothing here is special-cased by the
//! backend.

use crate::layout::shape_as_3d;
use tensorloom_api::Program;

/// Dense -> packed conversion. Runs one thread per output texel, gathering
/// the 2x2 logical block with edge lanes zero-filled. Operates on the 3-D
/// `(batch, rows, cols)` view of the logical shape.
pub fn pack_program(shape: &[usize]) -> Program {
    let [_, rows, cols] = shape_as_3d(shape);
    let body = format!(
        r#"fn run() {{
    let coords = getOutputCoords();
    var result = vec4<f32>(0.0);
    result.x = getA(coords.x, coords.y, coords.z);
    if coords.z + 1 < {cols} {{
        result.y = getA(coords.x, coords.y, coords.z + 1);
    }}
    if coords.y + 1 < {rows} {{
        result.z = getA(coords.x, coords.y + 1, coords.z);
    }}
    if coords.y + 1 < {rows} && coords.z + 1 < {cols} {{
        result.w = getA(coords.x, coords.y + 1, coords.z + 1);
    }}
    setOutput(result);
}}"#
    );
    let mut program = Program::new(
        "pack",
        vec!["A".into()],
        shape_as_3d(shape).to_vec(),
        body,
    );
    program.packed_output = true;
    program.is_packing_kernel = true;
    program
}

/// Packed -> dense conversion. One thread per logical element; fetches the
/// containing texel and selects the lane.
pub fn unpack_program(shape: &[usize]) -> Program {
    let body = r#"fn run() {
    let coords = getOutputCoords();
    let texel = getA(coords.x, coords.y, coords.z);
    let lane = (coords.y % 2) * 2 + (coords.z % 2);
    setOutput(texel[lane]);
}"#;
    let mut program = Program::new(
        "unpack",
        vec!["A".into()],
        shape_as_3d(shape).to_vec(),
        body,
    );
    program.packed_inputs = true;
    program.is_packing_kernel = true;
    program
}

/// Elementwise binary program. `expr` combines `a` and `b`, e.g. `a + b`
/// or `max(a, b)`; the same expression text serves dense (f32) and packed
/// (vec4) variants.
pub fn binary_program(name: &str, expr: &str, shape: &[usize], packed: bool) -> Program {
    let body = format!(
        r#"fn run() {{
    let a = getAAtOutCoords();
    let b = getBAtOutCoords();
    setOutput({expr});
}}"#
    );
    let mut program = Program::new(name, vec!["A".into(), "B".into()], shape.to_vec(), body);
    program.packed_inputs = packed;
    program.packed_output = packed;
    program
}

/// Elementwise unary program. `expr` transforms `x`, e.g. `exp(x)`.
pub fn unary_program(name: &str, expr: &str, shape: &[usize], packed: bool) -> Program {
    let body = format!(
        r#"fn run() {{
    let x = getXAtOutCoords();
    setOutput({expr});
}}"#
    );
    let mut program = Program::new(name, vec!["X".into()], shape.to_vec(), body);
    program.packed_inputs = packed;
    program.packed_output = packed;
    program
}

/// Broadcast a single-element input across the whole output shape.
pub fn fill_program(shape: &[usize]) -> Program {
    Program::new(
        "fill",
        vec!["X".into()],
        shape.to_vec(),
        r#"fn run() {
    setOutput(getXAtOutCoords());
}"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_program_targets_the_3d_view() {
        let program = pack_program(&[5, 2, 3]);
        assert_eq!(program.output_shape, vec![5, 2, 3]);
        assert!(program.packed_output && !program.packed_inputs);
        assert!(program.is_packing_kernel);
        assert!(program.body.contains("coords.z + 1 < 3"));
        assert!(program.body.contains("coords.y + 1 < 2"));

        let flat = pack_program(&[7]);
        assert_eq!(flat.output_shape, vec![1, 1, 7]);
    }

    #[test]
    fn unpack_program_mirrors_pack_flags() {
        let program = unpack_program(&[4, 4]);
        assert_eq!(program.output_shape, vec![1, 4, 4]);
        assert!(program.packed_inputs && !program.packed_output);
        assert!(program.is_packing_kernel);
    }

    #[test]
    fn elementwise_builders_splice_expressions() {
        let add = binary_program("add", "a + b", &[2, 2], false);
        assert!(add.body.contains("setOutput(a + b);"));
        assert!(!add.packed_inputs);

        let scaled = unary_program("double", "x * 2.0", &[4], true);
        assert!(scaled.body.contains("setOutput(x * 2.0);"));
        assert!(scaled.packed_inputs && scaled.packed_output);
    }
}
