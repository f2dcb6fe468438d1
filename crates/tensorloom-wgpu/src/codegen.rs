//! WGSL synthesis for tensor programs.
//!
//! A complete kernel is stitched from: a fixed prelude, one generated
//! sampler per input variable (`get<Var>`), an output-relative accessor per
//! input (`get<Var>AtOutCoords`), the output coordinate decomposition
//! (`getOutputCoords`) and writer (`setOutput`), the caller-supplied body
//! (which must define `fn run()`), and the dispatch entry point.
//!
//! Shapes and strides are baked into the source as literals; the cache key
//! (see `program.rs`) covers everything baked here, so a cached kernel can
//! only ever be replayed against layouts it was generated for.
//!
//! Every generator below is a pure `(shape info) -> String` function,
//! exercised by unit tests without a GPU.

use crate::layout::{
    self, size_of, squeeze_shape, strides, texel_cols, texel_rows, PhysShape, MAX_PACKED_RANK,
    MAX_RANK,
};
use std::fmt::Write as _;
use tensorloom_api::{BackendError, Program};

/// Shape metadata for one variable as the compiler sees it: the logical
/// view plus how (and whether) it is physically stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeInfo {
    pub logical_shape: Vec<usize>,
    /// None for uniform-inlined inputs, which have no physical storage.
    pub phys_shape: Option<PhysShape>,
    pub is_uniform: bool,
    pub is_packed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputInfo {
    pub name: String,
    pub shape_info: ShapeInfo,
}

const PRELUDE: &str = r#"
fn nanValue() -> f32 {
    return bitcast<f32>(0x7fc00000u);
}

fn isNanCustom(v: f32) -> bool {
    return v != v;
}

struct Coords5 {
    d0: i32,
    d1: i32,
    d2: i32,
    d3: i32,
    d4: i32,
};

struct Coords6 {
    d0: i32,
    d1: i32,
    d2: i32,
    d3: i32,
    d4: i32,
    d5: i32,
};

var<private> outIndex: i32;
"#;

fn coords_type(rank: usize) -> &'static str {
    match rank {
        0 | 1 => "i32",
        2 => "vec2<i32>",
        3 => "vec3<i32>",
        4 => "vec4<i32>",
        5 => "Coords5",
        _ => "Coords6",
    }
}

/// Expressions naming each coordinate of a `getOutputCoords()` result.
fn coord_components(rank: usize) -> Vec<String> {
    match rank {
        0 => vec![],
        1 => vec!["coords".to_string()],
        2 => vec!["coords.x".into(), "coords.y".into()],
        3 => vec!["coords.x".into(), "coords.y".into(), "coords.z".into()],
        4 => vec![
            "coords.x".into(),
            "coords.y".into(),
            "coords.z".into(),
            "coords.w".into(),
        ],
        rank => (0..rank).map(|i| format!("coords.d{i}")).collect(),
    }
}

fn arg_list(rank: usize) -> String {
    (0..rank)
        .map(|i| format!("d{i}: i32"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn flat_index_expr(shape: &[usize]) -> String {
    let st = strides(shape);
    let terms: Vec<String> = shape
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if st[i] == 1 {
                format!("d{i}")
            } else {
                format!("d{i} * {}", st[i])
            }
        })
        .collect();
    terms.join(" + ")
}

fn check_rank(rank: usize, packed: bool) -> Result<(), BackendError> {
    let max = if packed { MAX_PACKED_RANK } else { MAX_RANK };
    if rank > max {
        return Err(BackendError::UnsupportedRank { rank, max });
    }
    Ok(())
}

/// Storage and uniform binding declarations, in binding order: inputs,
/// output, then the custom-uniform block when the program declares one.
fn emit_bindings(inputs: &[InputInfo], output: &ShapeInfo, program: &Program) -> String {
    let mut src = String::new();
    for (i, input) in inputs.iter().enumerate() {
        let name = &input.name;
        if input.shape_info.is_uniform {
            let n4 = size_of(&input.shape_info.logical_shape).div_ceil(4).max(1);
            let _ = writeln!(
                src,
                "@group(0) @binding({i}) var<uniform> {name}_vals: array<vec4<f32>, {n4}>;"
            );
        } else if input.shape_info.is_packed {
            let _ = writeln!(
                src,
                "@group(0) @binding({i}) var<storage, read> {name}_data: array<vec4<f32>>;"
            );
        } else {
            let _ = writeln!(
                src,
                "@group(0) @binding({i}) var<storage, read> {name}_data: array<f32>;"
            );
        }
    }
    let out_binding = inputs.len();
    let elem = if output.is_packed { "vec4<f32>" } else { "f32" };
    let _ = writeln!(
        src,
        "@group(0) @binding({out_binding}) var<storage, read_write> out_data: array<{elem}>;"
    );
    if !program.custom_uniforms.is_empty() {
        let mut block = String::from("struct CustomUniforms {\n");
        for u in &program.custom_uniforms {
            let _ = writeln!(block, "    {}: vec4<f32>,", u.name);
        }
        block.push_str("};\n");
        let _ = writeln!(
            src,
            "{block}@group(0) @binding({}) var<uniform> custom: CustomUniforms;",
            out_binding + 1
        );
    }
    src
}

/// Dense sampler without squeeze handling: direct stride arithmetic.
fn dense_sampler_raw(fn_name: &str, name: &str, shape: &[usize]) -> String {
    let rank = shape.len();
    if rank == 0 {
        return format!("fn {fn_name}() -> f32 {{\n    return {name}_data[0];\n}}\n");
    }
    format!(
        "fn {fn_name}({}) -> f32 {{\n    let index = {};\n    return {name}_data[index];\n}}\n",
        arg_list(rank),
        flat_index_expr(shape)
    )
}

/// Dense sampler. Shapes with redundant singleton dimensions sample through
/// a simplified inner function generated against the squeezed shape, with
/// the wrapper forwarding the kept coordinates.
fn dense_sampler(name: &str, shape: &[usize]) -> String {
    let rank = shape.len();
    if rank < 2 {
        return dense_sampler_raw(&format!("get{name}"), name, shape);
    }
    let (squeezed, kept) = squeeze_shape(shape);
    if squeezed.len() == rank {
        return dense_sampler_raw(&format!("get{name}"), name, shape);
    }
    let inner_name = format!("get{name}Squeezed");
    let mut src = dense_sampler_raw(&inner_name, name, &squeezed);
    let forwarded: Vec<String> = kept.iter().map(|&i| format!("d{i}")).collect();
    let _ = write!(
        src,
        "fn get{name}({}) -> f32 {{\n    return {inner_name}({});\n}}\n",
        arg_list(rank),
        forwarded.join(", ")
    );
    src
}

/// Sampler for a uniform-inlined input: index into the small constant
/// array instead of storage.
fn uniform_sampler(name: &str, shape: &[usize]) -> String {
    let rank = shape.len();
    if rank == 0 {
        return format!("fn get{name}() -> f32 {{\n    return {name}_vals[0][0];\n}}\n");
    }
    format!(
        "fn get{name}({}) -> f32 {{\n    let index = {};\n    return {name}_vals[index / 4][index % 4];\n}}\n",
        arg_list(rank),
        flat_index_expr(shape)
    )
}

/// Packed sampler: logical coordinates in, the containing texel out.
fn packed_sampler(name: &str, shape: &[usize]) -> Result<String, BackendError> {
    check_rank(shape.len(), true)?;
    let src = match shape.len() {
        0 => format!("fn get{name}() -> vec4<f32> {{\n    return {name}_data[0];\n}}\n"),
        1 => format!(
            "fn get{name}(d0: i32) -> vec4<f32> {{\n    return {name}_data[d0 / 2];\n}}\n"
        ),
        2 => {
            let tc = texel_cols(shape[1]);
            format!(
                "fn get{name}(d0: i32, d1: i32) -> vec4<f32> {{\n    return {name}_data[(d0 / 2) * {tc} + (d1 / 2)];\n}}\n"
            )
        }
        3 => {
            let tr = texel_rows(shape[1]);
            let tc = texel_cols(shape[2]);
            format!(
                "fn get{name}(d0: i32, d1: i32, d2: i32) -> vec4<f32> {{\n    return {name}_data[(d0 * {tr} + (d1 / 2)) * {tc} + (d2 / 2)];\n}}\n"
            )
        }
        _ => {
            let b1 = shape[1];
            let tr = texel_rows(shape[2]);
            let tc = texel_cols(shape[3]);
            format!(
                "fn get{name}(d0: i32, d1: i32, d2: i32, d3: i32) -> vec4<f32> {{\n    let batch = d0 * {b1} + d1;\n    return {name}_data[(batch * {tr} + (d2 / 2)) * {tc} + (d3 / 2)];\n}}\n"
            )
        }
    };
    Ok(src)
}

/// Output-relative accessor for a dense input against a dense output.
/// When the logical shapes agree the accessor is pure flat indexing with
/// zero coordinate math (the common elementwise case); otherwise the
/// output coordinate is decomposed and remapped with broadcast dimensions
/// pinned to zero.
fn dense_at_out_coords(
    name: &str,
    input: &ShapeInfo,
    out_shape: &[usize],
) -> Result<String, BackendError> {
    let in_shape = &input.logical_shape;
    if in_shape == out_shape {
        let fetch = if input.is_uniform {
            format!("{name}_vals[outIndex / 4][outIndex % 4]")
        } else {
            format!("{name}_data[outIndex]")
        };
        return Ok(format!(
            "fn get{name}AtOutCoords() -> f32 {{\n    return {fetch};\n}}\n"
        ));
    }
    let broadcast = layout::broadcast_dims(in_shape, out_shape)?;
    let out_rank = out_shape.len();
    let in_rank = in_shape.len();
    let components = coord_components(out_rank);
    let offset = out_rank - in_rank;
    let args: Vec<String> = (0..in_rank)
        .map(|j| {
            if broadcast.contains(&j) {
                "0".to_string()
            } else {
                components[offset + j].clone()
            }
        })
        .collect();
    let needs_coords = args.iter().any(|a| a.starts_with("coords"));
    let mut src = format!("fn get{name}AtOutCoords() -> f32 {{\n");
    if needs_coords {
        src.push_str("    let coords = getOutputCoords();\n");
    }
    let _ = writeln!(src, "    return get{name}({});", args.join(", "));
    src.push_str("}\n");
    Ok(src)
}

/// Output-relative accessor for a packed input against a packed output.
/// Supported forms: identical shapes (direct texel fetch) and scalar
/// inputs (lane splat). General packed broadcast would silently mis-pair
/// lanes, so it is rejected at compile time.
fn packed_at_out_coords(
    name: &str,
    input: &ShapeInfo,
    out_shape: &[usize],
) -> Result<String, BackendError> {
    let in_shape = &input.logical_shape;
    if in_shape == out_shape {
        return Ok(format!(
            "fn get{name}AtOutCoords() -> vec4<f32> {{\n    return {name}_data[outIndex];\n}}\n"
        ));
    }
    if size_of(in_shape) == 1 {
        return Ok(format!(
            "fn get{name}AtOutCoords() -> vec4<f32> {{\n    return vec4<f32>({name}_data[0].x);\n}}\n"
        ));
    }
    Err(BackendError::BroadcastError {
        lhs: in_shape.to_vec(),
        rhs: out_shape.to_vec(),
    })
}

/// Decompose the flat dispatch index into logical output coordinates.
fn dense_output_coords(shape: &[usize]) -> String {
    let rank = shape.len();
    match rank {
        0 => "fn getOutputCoords() -> i32 {\n    return 0;\n}\n".to_string(),
        1 => "fn getOutputCoords() -> i32 {\n    return outIndex;\n}\n".to_string(),
        _ => {
            let st = strides(shape);
            let mut body = String::new();
            let _ = writeln!(body, "    let d0 = outIndex / {};", st[0]);
            if rank == 2 {
                let _ = writeln!(body, "    let d1 = outIndex % {};", st[0]);
            } else {
                let _ = writeln!(body, "    var rest = outIndex % {};", st[0]);
                for i in 1..rank - 1 {
                    let _ = writeln!(body, "    let d{i} = rest / {};", st[i]);
                    if i + 1 < rank - 1 {
                        let _ = writeln!(body, "    rest = rest % {};", st[i]);
                    } else {
                        let _ = writeln!(body, "    let d{} = rest % {};", rank - 1, st[i]);
                    }
                }
            }
            let ctor_args: Vec<String> = (0..rank).map(|i| format!("d{i}")).collect();
            let ctor = match rank {
                2 => format!("vec2<i32>({})", ctor_args.join(", ")),
                3 => format!("vec3<i32>({})", ctor_args.join(", ")),
                4 => format!("vec4<i32>({})", ctor_args.join(", ")),
                5 => format!("Coords5({})", ctor_args.join(", ")),
                _ => format!("Coords6({})", ctor_args.join(", ")),
            };
            format!(
                "fn getOutputCoords() -> {} {{\n{body}    return {ctor};\n}}\n",
                coords_type(rank)
            )
        }
    }
}

/// Packed variant: the dispatch index addresses texels; the returned
/// coordinates are the logical position of the texel's first lane.
fn packed_output_coords(shape: &[usize]) -> Result<String, BackendError> {
    check_rank(shape.len(), true)?;
    let src = match shape.len() {
        0 => "fn getOutputCoords() -> i32 {\n    return 0;\n}\n".to_string(),
        1 => "fn getOutputCoords() -> i32 {\n    return outIndex * 2;\n}\n".to_string(),
        2 => {
            let tc = texel_cols(shape[1]);
            format!(
                "fn getOutputCoords() -> vec2<i32> {{\n    let trow = outIndex / {tc};\n    let tcol = outIndex % {tc};\n    return vec2<i32>(trow * 2, tcol * 2);\n}}\n"
            )
        }
        3 => {
            let tr = texel_rows(shape[1]);
            let tc = texel_cols(shape[2]);
            let tpi = tr * tc;
            format!(
                "fn getOutputCoords() -> vec3<i32> {{\n    let b = outIndex / {tpi};\n    let rest = outIndex % {tpi};\n    let trow = rest / {tc};\n    let tcol = rest % {tc};\n    return vec3<i32>(b, trow * 2, tcol * 2);\n}}\n"
            )
        }
        _ => {
            let b1 = shape[1];
            let tr = texel_rows(shape[2]);
            let tc = texel_cols(shape[3]);
            let tpi = tr * tc;
            format!(
                "fn getOutputCoords() -> vec4<i32> {{\n    let batch = outIndex / {tpi};\n    let rest = outIndex % {tpi};\n    let trow = rest / {tc};\n    let tcol = rest % {tc};\n    return vec4<i32>(batch / {b1}, batch % {b1}, trow * 2, tcol * 2);\n}}\n"
            )
        }
    };
    Ok(src)
}

fn emit_set_output(packed: bool) -> String {
    if packed {
        "fn setOutput(value: vec4<f32>) {\n    out_data[outIndex] = value;\n}\n".to_string()
    } else {
        "fn setOutput(value: f32) {\n    out_data[outIndex] = value;\n}\n".to_string()
    }
}

/// Number of threads the kernel needs: logical elements for dense outputs,
/// texels for packed outputs.
pub fn dispatch_elems(output: &ShapeInfo) -> usize {
    if output.is_packed {
        layout::packed_phys_shape(&output.logical_shape).num_elements()
    } else {
        size_of(&output.logical_shape)
    }
}

/// Synthesize the complete kernel source.
pub fn make_shader(
    inputs: &[InputInfo],
    output: &ShapeInfo,
    program: &Program,
    workgroup_size: u32,
) -> Result<String, BackendError> {
    check_rank(output.logical_shape.len(), output.is_packed)?;

    let mut src = String::new();
    src.push_str(PRELUDE);
    src.push('\n');
    src.push_str(&emit_bindings(inputs, output, program));
    src.push('\n');

    if output.is_packed {
        src.push_str(&packed_output_coords(&output.logical_shape)?);
    } else {
        src.push_str(&dense_output_coords(&output.logical_shape));
    }
    src.push_str(&emit_set_output(output.is_packed));
    src.push('\n');

    for input in inputs {
        let info = &input.shape_info;
        check_rank(info.logical_shape.len(), info.is_packed)?;
        if info.is_uniform {
            src.push_str(&uniform_sampler(&input.name, &info.logical_shape));
        } else if info.is_packed {
            src.push_str(&packed_sampler(&input.name, &info.logical_shape)?);
        } else {
            src.push_str(&dense_sampler(&input.name, &info.logical_shape));
        }
        if info.is_packed == output.is_packed {
            if output.is_packed {
                src.push_str(&packed_at_out_coords(
                    &input.name,
                    info,
                    &output.logical_shape,
                )?);
            } else {
                src.push_str(&dense_at_out_coords(
                    &input.name,
                    info,
                    &output.logical_shape,
                )?);
            }
        }
        src.push('\n');
    }

    src.push_str(&program.body);
    src.push('\n');

    let guard = dispatch_elems(output);
    let _ = write!(
        src,
        "\n@compute @workgroup_size({workgroup_size})\nfn main(@builtin(global_invocation_id) gid: vec3<u32>) {{\n    let idx = i32(gid.x);\n    if idx >= {guard} {{\n        return;\n    }}\n    outIndex = idx;\n    run();\n}}\n"
    );
    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(shape: &[usize]) -> ShapeInfo {
        ShapeInfo {
            logical_shape: shape.to_vec(),
            phys_shape: Some(layout::dense_phys_shape(shape, 16_384)),
            is_uniform: false,
            is_packed: false,
        }
    }

    fn uniform(shape: &[usize]) -> ShapeInfo {
        ShapeInfo {
            logical_shape: shape.to_vec(),
            phys_shape: None,
            is_uniform: true,
            is_packed: false,
        }
    }

    fn packed(shape: &[usize]) -> ShapeInfo {
        ShapeInfo {
            logical_shape: shape.to_vec(),
            phys_shape: Some(layout::packed_phys_shape(shape)),
            is_uniform: false,
            is_packed: true,
        }
    }

    fn add_program(shape: &[usize]) -> Program {
        Program::new(
            "add",
            vec!["A".into(), "B".into()],
            shape.to_vec(),
            "fn run() {\n    setOutput(getAAtOutCoords() + getBAtOutCoords());\n}",
        )
    }

    #[test]
    fn elementwise_shader_has_flat_accessors() {
        let inputs = [
            InputInfo {
                name: "A".into(),
                shape_info: dense(&[2, 3]),
            },
            InputInfo {
                name: "B".into(),
                shape_info: dense(&[2, 3]),
            },
        ];
        let src = make_shader(&inputs, &dense(&[2, 3]), &add_program(&[2, 3]), 256).unwrap();
        assert!(src.contains("fn getAAtOutCoords() -> f32 {\n    return A_data[outIndex];"));
        assert!(src.contains("var<storage, read> B_data: array<f32>;"));
        assert!(src.contains("var<storage, read_write> out_data: array<f32>;"));
        assert!(src.contains("@compute @workgroup_size(256)"));
        assert!(src.contains("if idx >= 6 {"));
    }

    #[test]
    fn uniform_inputs_sample_the_inlined_array() {
        let inputs = [
            InputInfo {
                name: "A".into(),
                shape_info: uniform(&[2, 2]),
            },
            InputInfo {
                name: "B".into(),
                shape_info: uniform(&[2, 2]),
            },
        ];
        let src = make_shader(&inputs, &dense(&[2, 2]), &add_program(&[2, 2]), 256).unwrap();
        assert!(src.contains("var<uniform> A_vals: array<vec4<f32>, 1>;"));
        assert!(src.contains("A_vals[outIndex / 4][outIndex % 4]"));
        assert!(!src.contains("A_data"));
    }

    #[test]
    fn broadcast_remaps_and_pins_singleton_dims() {
        let inputs = [
            InputInfo {
                name: "A".into(),
                shape_info: dense(&[1, 4]),
            },
            InputInfo {
                name: "B".into(),
                shape_info: dense(&[3, 4]),
            },
        ];
        let src = make_shader(&inputs, &dense(&[3, 4]), &add_program(&[3, 4]), 256).unwrap();
        assert!(src.contains("return getA(0, coords.y);"));
    }

    #[test]
    fn incompatible_broadcast_is_rejected_before_any_gpu_work() {
        let inputs = [
            InputInfo {
                name: "A".into(),
                shape_info: dense(&[2, 4]),
            },
            InputInfo {
                name: "B".into(),
                shape_info: dense(&[3, 4]),
            },
        ];
        let err = make_shader(&inputs, &dense(&[3, 4]), &add_program(&[3, 4]), 256).unwrap_err();
        assert!(matches!(err, BackendError::BroadcastError { .. }));
    }

    #[test]
    fn squeezed_sampler_forwards_kept_dims() {
        let src = dense_sampler("A", &[1, 3, 1, 4]);
        assert!(src.contains("fn getASqueezed(d0: i32, d1: i32) -> f32"));
        assert!(src.contains("return getASqueezed(d1, d3);"));
    }

    #[test]
    fn rank_limits_are_enforced() {
        let shape = vec![2usize; 7];
        let inputs = [InputInfo {
            name: "A".into(),
            shape_info: dense(&shape),
        }];
        let program = Program::new(
            "id",
            vec!["A".into()],
            shape.clone(),
            "fn run() {\n    setOutput(getAAtOutCoords());\n}",
        );
        let err = make_shader(&inputs, &dense(&shape), &program, 256).unwrap_err();
        assert_eq!(err, BackendError::UnsupportedRank { rank: 7, max: 6 });

        let err = packed_sampler("A", &[2, 2, 2, 2, 2]).unwrap_err();
        assert_eq!(err, BackendError::UnsupportedRank { rank: 5, max: 4 });
    }

    #[test]
    fn rank_six_output_coords_use_struct() {
        let shape = vec![2usize; 6];
        let src = dense_output_coords(&shape);
        assert!(src.contains("-> Coords6"));
        assert!(src.contains("return Coords6(d0, d1, d2, d3, d4, d5);"));
    }

    #[test]
    fn packed_equal_shapes_fetch_texels_directly() {
        let src = packed_at_out_coords("A", &packed(&[4, 4]), &[4, 4]).unwrap();
        assert!(src.contains("return A_data[outIndex];"));
        let err = packed_at_out_coords("A", &packed(&[1, 4]), &[4, 4]).unwrap_err();
        assert!(matches!(err, BackendError::BroadcastError { .. }));
    }

    #[test]
    fn packed_output_coords_step_by_two() {
        let src = packed_output_coords(&[4, 6]).unwrap();
        assert!(src.contains("return vec2<i32>(trow * 2, tcol * 2);"));
        assert_eq!(
            dispatch_elems(&packed(&[4, 6])),
            6 // 2x3 texels
        );
    }

    #[test]
    fn custom_uniforms_get_a_block() {
        let mut program = add_program(&[2, 2]);
        program.custom_uniforms = vec![tensorloom_api::CustomUniform {
            name: "offset".into(),
            arity: 2,
        }];
        let inputs = [
            InputInfo {
                name: "A".into(),
                shape_info: dense(&[2, 2]),
            },
            InputInfo {
                name: "B".into(),
                shape_info: dense(&[2, 2]),
            },
        ];
        let src = make_shader(&inputs, &dense(&[2, 2]), &program, 256).unwrap();
        assert!(src.contains("struct CustomUniforms {"));
        assert!(src.contains("offset: vec4<f32>,"));
        assert!(src.contains("@group(0) @binding(3) var<uniform> custom: CustomUniforms;"));
    }
}
