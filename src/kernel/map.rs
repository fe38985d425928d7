//! One output element per index.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::gpu::dispatch::{Inputs, Params};
use crate::gpu::Gpu;

use super::fragment::SourceFragments;
use super::model::{Formats, ProgramModel};
use super::Kernel;

pub const MAIN: &str = "main";

pub(crate) fn compile(formats: &Formats, fragments: &SourceFragments, source: &str) -> Vec<(&'static str, ProgramModel)> {
    vec![(MAIN, ProgramModel::build(formats, fragments, source))]
}

/// Run the kernel's main pass over `n` elements, four per invocation.
pub(crate) async fn exec(gpu: &Gpu, kernel: &Kernel, n: u32, inputs: Inputs<'_>, params: Params) -> Result<Buffer> {
    let program = kernel.program(MAIN)?;
    gpu.run(program, n.div_ceil(4), n, inputs, params).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, FLOAT, VEC4};
    use crate::kernel::fragment::extract;

    #[test]
    fn test_single_pass() {
        let formats = Formats::new(FLOAT.into(), FLOAT.into(), Format::Null);
        let source = "fn map(i: i32) { write(read(i) * 2.0); }";
        let (frags, _) = extract(source);
        let passes = compile(&formats, &frags, source);
        assert_eq!(passes.len(), 1);
        let (name, model) = &passes[0];
        assert_eq!(*name, MAIN);
        assert_eq!(model.vertex_id_multiplier, 4);
        assert_eq!(model.out_registers.len(), 4);
    }

    #[test]
    fn test_batched_write_calls_once() {
        let formats = Formats::new(VEC4.into(), VEC4.into(), Format::Null);
        let source = "fn map(i: i32) { write(read(i), read(i + 1), read(i + 2), read(i + 3)); }";
        let (frags, _) = extract(source);
        let (_, model) = compile(&formats, &frags, source).remove(0);
        assert_eq!(model.write_batch_size, 4);
        let wgsl = crate::kernel::template::render(&model, &[0, 1, 2, 3]);
        assert_eq!(wgsl.matches("    map(i").count(), 1);
    }
}
