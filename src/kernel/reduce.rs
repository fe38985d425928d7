//! Tree reduction, sixteen elements into four per invocation.
//!
//! Each round maps `ceil(n / 4)` outputs from `n` inputs until a single
//! element is left. The user code reads four consecutive elements at `i`
//! and writes their combination, so the operator must be associative.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::gpu::dispatch::{Inputs, Params};
use crate::gpu::Gpu;

use super::fragment::SourceFragments;
use super::model::{Formats, ProgramModel};
use super::Kernel;

pub const MAIN: &str = "main";

pub(crate) fn compile(formats: &Formats, fragments: &SourceFragments, source: &str) -> Vec<(&'static str, ProgramModel)> {
    let mut model = ProgramModel::build(formats, fragments, source);
    model.vertex_id_multiplier = 16;
    vec![(MAIN, model)]
}

/// Number of elements left after each round, starting from `n`.
pub fn rounds(mut n: u32) -> Vec<u32> {
    let mut out = Vec::new();
    while n >= 2 {
        n = n.div_ceil(4);
        out.push(n);
    }
    out
}

/// Reduce the first `n` elements of `read`. Fewer than two elements yield a
/// copy; `read` itself is never returned or freed.
pub(crate) async fn exec(gpu: &Gpu, kernel: &Kernel, read: &Buffer, scope: Option<&Buffer>, n: u32) -> Result<Buffer> {
    let program = kernel.program(MAIN)?;
    let mut current: Option<Buffer> = None;
    for m in rounds(n) {
        let input = current.as_ref().unwrap_or(read);
        let inputs = Inputs {
            read: Some(input),
            scope,
            scope2: None,
        };
        // the previous round drops here and returns to the pool
        current = Some(gpu.run(program, m.div_ceil(4), m, inputs, Params::default()).await?);
    }
    match current {
        Some(result) => Ok(result),
        None => {
            let result = read.copy().await?;
            result.set_count(n);
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, FLOAT};
    use crate::kernel::fragment::extract;

    #[test]
    fn test_rounds() {
        assert!(rounds(0).is_empty());
        assert!(rounds(1).is_empty());
        assert_eq!(rounds(2), vec![1]);
        assert_eq!(rounds(8), vec![2, 1]);
        assert_eq!(rounds(37), vec![10, 3, 1]);
        assert_eq!(rounds(64), vec![16, 4, 1]);
    }

    #[test]
    fn test_reads_sixteen_per_invocation() {
        let formats = Formats::new(FLOAT.into(), FLOAT.into(), Format::Null);
        let source = "fn reduce(i: i32) { write(read(i) + read(i + 1) + read(i + 2) + read(i + 3)); }";
        let (frags, _) = extract(source);
        let (_, model) = compile(&formats, &frags, source).remove(0);
        let wgsl = crate::kernel::template::render(&model, &[0, 1, 2, 3]);
        assert!(wgsl.contains("let i = i32(vertex) * 16;"));
        assert!(wgsl.contains("    reduce(i + 12);\n"));
    }
}
