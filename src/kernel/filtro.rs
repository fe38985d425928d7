//! Stream compaction: the indices of the elements the user code keeps.
//!
//! The main pass writes a keep flag per element. An inclusive prefix sum of
//! the flags gives every kept element its output slot, and a scatter draw
//! moves the element's index there. Slots past the kept count hold `-1`.

use crate::buffer::{standard_layout, Buffer};
use crate::error::Result;
use crate::format::{Format, INT};
use crate::gpu::dispatch::Params;
use crate::gpu::Gpu;

use super::compile::CompileContext;
use super::fragment::SourceFragments;
use super::model::{Formats, ProgramModel};
use super::{map, scan, Bind, Flag, Kernel, Output};

pub const MAIN: &str = "main";

const PREFIX_SUM: &str = "
const identity = 0;

fn scan(i: i32) {
    let a = read(i, f_vec4i);
    let b = read(i + 4, f_vec4i);
    let r = vec4i(a.xz, b.xz) + vec4i(a.yw, b.yw);
    write(r.x, r.y, r.z, r.w);
}";

#[derive(Debug)]
pub(crate) struct Plan {
    prefix: Kernel,
}

pub(crate) fn plan(ctx: &CompileContext) -> Result<Plan> {
    Ok(Plan {
        prefix: Kernel::new(ctx, INT.into(), INT.into(), Format::Null, PREFIX_SUM)?,
    })
}

pub(crate) fn compile(formats: &Formats, fragments: &SourceFragments, source: &str) -> Vec<(&'static str, ProgramModel)> {
    let mut model = ProgramModel::build(formats, fragments, source);
    model.main.after = (0..4)
        .map(|k| format!("glc_out_{k} = select(0, 1, glc_out_{k} != 0);\n"))
        .collect();
    vec![(MAIN, model)]
}

pub(crate) async fn exec(
    gpu: &Gpu,
    kernel: &Kernel,
    plan: &Plan,
    n: u32,
    bind: Bind<'_>,
    flags: &[Flag],
) -> Result<Output> {
    let keep = map::exec(gpu, kernel, n, bind.inputs(), Params::default()).await?;
    let prefix = scan::exec(gpu, &plan.prefix, &keep, None, n).await?;
    drop(keep);

    let length = if flags.contains(&Flag::Length) {
        Some(kept_count(gpu, &prefix, n)?)
    } else {
        None
    };
    let source = prefix.device()?;
    let result = gpu.scatter_filtro(&source, n)?;
    tracing::debug!(n, "filtro");
    Ok(Output {
        result,
        length,
        start: None,
        overflow: None,
    })
}

/// The last inclusive prefix as a one-element buffer, zero when `n == 0`.
fn kept_count(gpu: &Gpu, prefix: &Buffer, n: u32) -> Result<Buffer> {
    let attribs = standard_layout(&INT.into(), 1);
    let Some(last) = n.checked_sub(1) else {
        return Ok(Buffer::from_words(gpu, INT.into(), attribs, vec![0; 4]));
    };
    let source = prefix.device()?;
    let target = gpu.storage_buffer(16)?;
    let at = prefix.attribs().first().map_or(last, |a| a.index(last));
    let mut encoder = gpu
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("glc filtro length"),
        });
    encoder.clear_buffer(&target, 0, None);
    encoder.copy_buffer_to_buffer(&source, at as u64 * 4, &target, 0, 4);
    gpu.queue().submit(Some(encoder.finish()));
    Ok(Buffer::from_device(gpu, INT.into(), attribs, 16, target))
}
