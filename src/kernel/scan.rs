//! Inclusive prefix scan as an up-sweep/down-sweep over halving layers.
//!
//! The up pass combines neighbouring pairs until one element (the total) is
//! left. Walking back down, every processed layer stores the raw layer value
//! at even positions and the exclusive prefix of that position at odd ones:
//!
//! ```text
//! P[2k]     = x[2k]
//! P[2k + 1] = x[0] + ... + x[2k - 1]
//! ```
//!
//! The insert pass seeds the top pair with the identity, each down pass
//! derives a finer processed layer from a coarser one and the matching
//! up-sweep layer, and the final pass turns the finest one into the
//! inclusive scan. The last element is then patched with the total.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::format::{Format, SimpleFormat};
use crate::gpu::dispatch::{Inputs, Params};
use crate::gpu::Gpu;

use super::compile::Program;
use super::fragment::{self, SourceFragments};
use super::model::{suffix, Formats, OutRegister, ProgramModel};
use super::Kernel;

pub const UP: &str = "up";
pub const INSERT: &str = "insert";
pub const DOWN: &str = "down";
pub const FINAL: &str = "final";

pub(crate) fn compile(formats: &Formats, fragments: &SourceFragments, source: &str) -> Vec<(&'static str, ProgramModel)> {
    let swapped = fragments.entrypoint().is_some_and(|e| e.args.len() >= 2);
    let call = |flag: u8| {
        if swapped {
            format!("scan({{i}}, {flag});")
        } else {
            "scan({i});".to_string()
        }
    };
    let fields = formats.write.fields();

    let mut up = ProgramModel::build(formats, fragments, source);
    up.vertex_id_multiplier = 8;
    up.main.call = call(0);

    let insert = insert_model(formats, fragments, source);

    let paired = formats.clone().with_scope2(&formats.read);

    let mut down = ProgramModel::build(&paired, fragments, source);
    down.vertex_id_multiplier = 8;
    down.main.call = call(1);
    down.main.after = down.snippet(&down_snippet(&fields));
    down.out_registers = down_registers(&fields);

    let mut last = ProgramModel::build(&paired, fragments, source);
    last.vertex_id_multiplier = 8;
    last.main.call = call(1);
    last.main.after = last.snippet(&final_snippet(&fields));
    last.out_registers = final_registers(&fields);

    vec![(UP, up), (INSERT, insert), (DOWN, down), (FINAL, last)]
}

/// `[x0, identity]` from a two-element layer. The user's identity
/// declarations are carried over so the seed matches them.
fn insert_model(formats: &Formats, fragments: &SourceFragments, source: &str) -> ProgramModel {
    let mut text = String::new();
    for id in &fragments.identities {
        text.push_str(id.span.text(source));
        text.push('\n');
    }
    text.push_str("fn scan(i: i32) {\n");
    for (key, _) in formats.write.fields() {
        let u = suffix(key);
        text.push_str(&format!(
            "    write{u}(read{u}(), identity{u}, identity{u}, identity{u});\n"
        ));
    }
    text.push('}');

    let (inserted, _) = fragment::extract(&text);
    let formats = Formats::new(formats.read.clone(), formats.write.clone(), Format::Null);
    ProgramModel::build(&formats, &inserted, &text)
}

fn down_snippet(fields: &[(Option<&str>, SimpleFormat)]) -> String {
    let mut out = String::new();
    for (key, _) in fields {
        let u = suffix(*key);
        for b in 0..4 {
            out.push_str(&format!(
                "glc_out_s_keepl{u}_{b} = read_s_scope2{u}(i * 2 + {});\n",
                4 * b
            ));
            out.push_str(&format!("glc_out_s_copy{u}_{b} = read{u}(i + {});\n", 2 * b + 1));
            out.push_str(&format!(
                "glc_out_s_keepr{u}_{b} = read_s_scope2{u}(i * 2 + {});\n",
                4 * b + 2
            ));
        }
    }
    out
}

fn final_snippet(fields: &[(Option<&str>, SimpleFormat)]) -> String {
    let mut out = String::new();
    for (key, _) in fields {
        let u = suffix(*key);
        for b in 0..4 {
            out.push_str(&format!("glc_out_s_copy{u}_{b} = read{u}(i + {});\n", 2 * b + 3));
        }
    }
    out
}

/// Sixteen elements per invocation: bank `b` covers fine positions
/// `4b..4b + 4` as kept-left, copied, kept-right and combined.
fn down_registers(fields: &[(Option<&str>, SimpleFormat)]) -> Vec<OutRegister> {
    let mut registers = Vec::new();
    for b in 0..4 {
        for &(key, format) in fields {
            registers.push(OutRegister::new("s_keepl_", key, format, b));
            registers.push(OutRegister::new("s_copy_", key, format, b));
            registers.push(OutRegister::new("s_keepr_", key, format, b));
            registers.push(OutRegister::new("", key, format, b));
        }
    }
    registers
}

/// Eight elements per invocation: combined and copied for each bank.
fn final_registers(fields: &[(Option<&str>, SimpleFormat)]) -> Vec<OutRegister> {
    let mut registers = Vec::new();
    for group in 0..2 {
        for &(key, format) in fields {
            for b in [2 * group, 2 * group + 1] {
                registers.push(OutRegister::new("", key, format, b));
                registers.push(OutRegister::new("s_copy_", key, format, b));
            }
        }
    }
    registers
}

/// Final-pass invocations for `n` outputs, eight per invocation.
fn final_points(n: u32) -> u32 {
    n.div_ceil(8)
}

/// Lengths of the up-sweep layers above an input of `n` elements.
pub fn layer_lengths(mut n: u32) -> Vec<u32> {
    let mut out = Vec::new();
    while n >= 2 {
        n = n.div_ceil(2);
        out.push(n);
    }
    out
}

/// Scan the first `n` elements of `read`. `read` is never freed.
pub(crate) async fn exec(gpu: &Gpu, kernel: &Kernel, read: &Buffer, scope: Option<&Buffer>, n: u32) -> Result<Buffer> {
    if n <= 1 {
        let result = read.copy().await?;
        result.set_count(n);
        return Ok(result);
    }
    let up = kernel.program(UP)?;
    let insert = kernel.program(INSERT)?;
    let down = kernel.program(DOWN)?;
    let last = kernel.program(FINAL)?;

    let mut layers: Vec<(Buffer, u32)> = Vec::new();
    for m in layer_lengths(n) {
        let input = layers.last().map_or(read, |(b, _)| b);
        let inputs = Inputs {
            read: Some(input),
            scope,
            scope2: None,
        };
        let next = gpu.run(up, m.div_ceil(4), m, inputs, Params::default()).await?;
        layers.push((next, m));
    }
    let Some((total, _)) = layers.pop() else {
        return read.copy().await;
    };

    let top = layers.pop();
    let seed = Inputs {
        read: Some(top.as_ref().map_or(read, |(b, _)| b)),
        ..Default::default()
    };
    let mut coarse = gpu.run(insert, 1, 2, seed, Params::default()).await?;
    let below_top = top.is_some();
    drop(top);

    while let Some((fine, length)) = layers.pop() {
        coarse = descend(gpu, down, &coarse, &fine, length, scope).await?;
    }
    if below_top {
        coarse = descend(gpu, down, &coarse, read, n, scope).await?;
    }

    let inputs = Inputs {
        read: Some(&coarse),
        scope,
        scope2: None,
    };
    let result = gpu.run(last, final_points(n), n, inputs, Params::default()).await?;
    patch_total(gpu, &total, &result, n)?;
    Ok(result)
}

async fn descend(
    gpu: &Gpu,
    down: &Program,
    coarse: &Buffer,
    fine: &Buffer,
    length: u32,
    scope: Option<&Buffer>,
) -> Result<Buffer> {
    let groups = length.div_ceil(4);
    let inputs = Inputs {
        read: Some(coarse),
        scope,
        scope2: Some(fine),
    };
    gpu.run(down, groups.div_ceil(4), groups * 4, inputs, Params::default())
        .await
}

/// Copy the single element of `total` over element `n - 1` of `result`.
fn patch_total(gpu: &Gpu, total: &Buffer, result: &Buffer, n: u32) -> Result<()> {
    let source = total.device()?;
    let target = result.device()?;
    let totals = total.attribs();
    let mut encoder = gpu
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("glc scan total"),
        });
    for a in result.attribs() {
        let Some(t) = totals.iter().find(|t| t.name == a.name) else {
            continue;
        };
        encoder.copy_buffer_to_buffer(
            &source,
            t.index(0) as u64 * 4,
            &target,
            a.index(n - 1) as u64 * 4,
            a.format.components as u64 * 4,
        );
    }
    gpu.queue().submit(Some(encoder.finish()));
    result.device_written();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FLOAT, INT, VEC2};
    use crate::kernel::template::render;

    fn passes(formats: &Formats, source: &str) -> Vec<(&'static str, ProgramModel)> {
        let (frags, diags) = fragment::extract(source);
        assert!(diags.is_empty());
        compile(formats, &frags, source)
    }

    fn all(model: &ProgramModel) -> Vec<usize> {
        (0..model.out_registers.len()).collect()
    }

    #[test]
    fn test_layer_lengths() {
        assert!(layer_lengths(1).is_empty());
        assert_eq!(layer_lengths(2), vec![1]);
        assert_eq!(layer_lengths(5), vec![3, 2, 1]);
        assert_eq!(layer_lengths(8), vec![4, 2, 1]);
    }

    #[test]
    fn test_pass_names() {
        let formats = Formats::new(FLOAT.into(), FLOAT.into(), Format::Null);
        let names: Vec<&str> = passes(&formats, "fn scan(i: i32) { write(read(i) + read(i + 1)); }")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec![UP, INSERT, DOWN, FINAL]);
    }

    #[test]
    fn test_insert_seeds_identity() {
        let formats = Formats::new(INT.into(), INT.into(), Format::Null);
        let source = "const identity = 1;\nfn scan(i: i32) { write(read(i) * read(i + 1)); }";
        let models = passes(&formats, source);
        let insert = &models[1].1;
        assert_eq!(insert.identities[0].value, "1");
        assert_eq!(insert.write_batch_size, 4);
        let wgsl = render(insert, &all(insert));
        assert!(wgsl.contains("glc_write(glc_read_i32(0), identity, identity, identity);"));
    }

    #[test]
    fn test_down_layout() {
        let formats = Formats::new(FLOAT.into(), FLOAT.into(), Format::Null);
        let source = "fn scan(i: i32, swapped: i32) { write(read(i) + read(i + 1)); }";
        let models = passes(&formats, source);
        let down = &models[2].1;
        let names: Vec<&str> = down.out_registers[..8].iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["s_keepl_0", "s_copy_0", "s_keepr_0", "0", "s_keepl_1", "s_copy_1", "s_keepr_1", "1"]
        );
        assert_eq!(down.samplers, [true, false, true]);
        let wgsl = render(down, &all(down));
        assert!(wgsl.contains("    scan(i + 6, 1);\n"));
        assert!(wgsl.contains("glc_out_s_keepl_3 = glc_read_s_scope2_f32(i * 2 + 12);"));
        assert!(wgsl.contains("glc_out_s_copy_2 = glc_read_f32(i + 5);"));
        assert!(wgsl.contains("glc_capture[vertex * 16u + 15u]"));
    }

    #[test]
    fn test_final_layout_complex() {
        let write = Format::complex([("a", VEC2), ("b", FLOAT)]);
        let formats = Formats::new(write.clone(), write, Format::Null);
        let source = "fn scan(i: i32) { write_a(read_a(i) + read_a(i + 1)); write_b(read_b(i) + read_b(i + 1)); }";
        let models = passes(&formats, source);
        let last = &models[3].1;
        let names: Vec<&str> = last.out_registers.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(&names[..4], &["a_0", "s_copy_a_0", "a_1", "s_copy_a_1"]);
        assert_eq!(&names[4..8], &["b_0", "s_copy_b_0", "b_1", "s_copy_b_1"]);
        assert_eq!(&names[8..10], &["a_2", "s_copy_a_2"]);
        let wgsl = render(last, &all(last));
        assert!(wgsl.contains("glc_out_s_copy_b_3 = glc_read_b_f32(i + 9);"));
    }

    #[test]
    fn test_final_points_cover_output() {
        let fields = [(None, FLOAT)];
        let per_point = final_registers(&fields).len() as u32;
        assert_eq!(per_point, 8);
        for n in [2u32, 3, 8, 9, 16, 100, 1025] {
            let points = final_points(n);
            assert!(points * per_point >= n, "n = {n}");
            assert!((points - 1) * per_point < n, "n = {n}");
        }
    }

    #[test]
    fn test_up_pass_pairs() {
        let formats = Formats::new(FLOAT.into(), FLOAT.into(), Format::Null);
        let models = passes(&formats, "fn scan(i: i32) { write(read(i) + read(i + 1)); }");
        let up = &models[0].1;
        assert_eq!(up.vertex_id_multiplier, 8);
        let wgsl = render(up, &all(up));
        assert!(wgsl.contains("let i = i32(vertex) * 8;"));
        assert!(wgsl.contains("    scan(i + 2);\n"));
    }
}
