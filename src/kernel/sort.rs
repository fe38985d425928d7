//! Bitonic sort of element indices by a user comparator.
//!
//! The permutation starts as the identity over the next power of two and
//! every pass compare-exchanges partners `i ^ distance`. Indices at or past
//! the logical length compare greater than any real element, so they sink
//! to the padding and the first `n` entries are the sorted order.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::format::{Format, INT};
use crate::gpu::dispatch::{Inputs, Params};
use crate::gpu::Gpu;

use super::compile::CompileContext;
use super::fragment::SourceFragments;
use super::model::{Formats, ProgramModel};
use super::{map, Bind, Kernel};

pub const MAIN: &str = "main";

const INIT: &str = "fn map(i: i32) { write(i, i + 1, i + 2, i + 3); }";

const STEP: &str = "
fn glc_sort_order(a: i32, b: i32) -> i32 {
    if (max(a, b) >= glc_params.limit) {
        return a - b;
    }
    sort(a, b);
    return glc_write_0;
}

fn glc_sort_step(i: i32, p: i32) {
    let part = glc_params.part;
    let j = i ^ part.y;
    let q = read_s_scope2(j);
    let lower = j > i;
    let ascending = (i & part.x) == 0;
    var order: i32;
    if (lower == ascending) {
        order = glc_sort_order(p, q);
    } else {
        order = glc_sort_order(q, p);
    }
    if (order > 0) {
        glc_write_0 = q;
    } else {
        glc_write_0 = p;
    }
}";

#[derive(Debug)]
pub(crate) struct Plan {
    init: Kernel,
}

pub(crate) fn plan(ctx: &CompileContext) -> Result<Plan> {
    Ok(Plan {
        init: Kernel::new(ctx, Format::Null, INT.into(), Format::Null, INIT)?,
    })
}

pub(crate) fn compile(formats: &Formats, fragments: &SourceFragments, source: &str) -> Vec<(&'static str, ProgramModel)> {
    let paired = formats.clone().with_scope2(&INT.into());
    let mut model = ProgramModel::build(&paired, fragments, source);
    model.main.before = model.snippet("let glc_sorted = read_s_scope2(i, f_vec4i);");
    model.helpers = model.snippet(STEP);
    model.main.call = "glc_sort_step({i}, glc_sorted.{c});".to_string();
    vec![(MAIN, model)]
}

/// `[phase, distance]` of every pass over `size` elements.
pub fn schedule(size: u32) -> Vec<[u32; 2]> {
    let mut passes = Vec::new();
    let mut phase = 2;
    while phase <= size {
        let mut distance = phase / 2;
        while distance >= 1 {
            passes.push([phase, distance]);
            distance /= 2;
        }
        phase *= 2;
    }
    passes
}

pub(crate) async fn exec(gpu: &Gpu, kernel: &Kernel, plan: &Plan, n: u32, bind: Bind<'_>) -> Result<Buffer> {
    let size = n.max(1).next_power_of_two();
    let mut order = map::exec(gpu, &plan.init, size, Inputs::default(), Params::default()).await?;
    let program = kernel.program(MAIN)?;
    let passes = schedule(size);
    tracing::debug!(n, passes = passes.len(), "sort");
    for [phase, distance] in passes {
        let inputs = Inputs {
            read: bind.read,
            scope: bind.scope,
            scope2: Some(&order),
        };
        let params = Params {
            part: [phase as i32, distance as i32],
            limit: n as i32,
        };
        order = gpu.run(program, size.div_ceil(4), size, inputs, params).await?;
    }
    order.set_count(n);
    Ok(order)
}
