//! Hash grouping: up to four elements per group id in a table of buckets.
//!
//! The main pass writes a group id per element; negative ids are left out.
//! Ids hash into `modulus` buckets of four slots with a random offset, where
//! `modulus` is the first prime at or above a quarter of the expected group
//! count. A scatter draw fills each bucket with the indices of its elements,
//! `-1` marks empty slots. Elements that did not fit are only counted.

use std::cell::RefCell;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::format::{Format, INT};
use crate::gpu::dispatch::{Inputs, Params};
use crate::gpu::Gpu;
use crate::random;
use crate::range::Range;

use super::compile::CompileContext;
use super::fragment::SourceFragments;
use super::model::{Formats, ProgramModel};
use super::{map, reduce, Bind, Flag, Kernel, Output};

pub const MAIN: &str = "main";

/// First table slot of each element, or `-1` when it was not placed.
const START: &str = "
fn map(i: i32) {
    let id = read(i);
    var slot = -1;
    if (id >= 0) {
        let bucket = (u32(id) + u32(glc_params.part.y)) % u32(glc_params.part.x);
        let first = i32(bucket) * 4;
        for (var k = 0; k < 4; k++) {
            if (read_table(first + k) == i) {
                slot = first;
            }
        }
    }
    write(slot);
}";

const INDICATOR: &str = "fn map(i: i32) { write(select(0, 1, read(i) >= 0)); }";

const SUM: &str = "fn reduce(i: i32) { write(read(i) + read(i + 1) + read(i + 2) + read(i + 3)); }";

const DIFFERENCE: &str = "fn map(i: i32) { write(read(i) - read_placed()); }";

#[derive(Debug)]
pub(crate) struct Plan {
    start: Kernel,
    indicator: Kernel,
    sum: Kernel,
    difference: Kernel,
}

pub(crate) fn plan(ctx: &CompileContext) -> Result<Plan> {
    let table = Format::complex([("table", INT)]);
    let placed = Format::complex([("placed", INT)]);
    Ok(Plan {
        start: Kernel::new(ctx, INT.into(), INT.into(), table, START)?,
        indicator: Kernel::new(ctx, INT.into(), INT.into(), Format::Null, INDICATOR)?,
        sum: Kernel::new(ctx, INT.into(), INT.into(), Format::Null, SUM)?,
        difference: Kernel::new(ctx, INT.into(), INT.into(), placed, DIFFERENCE)?,
    })
}

pub(crate) fn compile(formats: &Formats, fragments: &SourceFragments, source: &str) -> Vec<(&'static str, ProgramModel)> {
    vec![(MAIN, ProgramModel::build(formats, fragments, source))]
}

pub(crate) async fn exec(
    gpu: &Gpu,
    kernel: &Kernel,
    plan: &Plan,
    range: &Range,
    bind: Bind<'_>,
    flags: &[Flag],
) -> Result<Output> {
    let n = range.len() as u32;
    let ids = map::exec(gpu, kernel, n, bind.inputs(), Params::default()).await?;

    let groups = range.group_size.unwrap_or(range.len()) as u32;
    let modulus = prime_at_least(groups.div_ceil(4));
    let offset = random::next_u32() % modulus;
    let source = ids.device()?;
    let table = gpu.scatter_group(&source, n, modulus, offset)?;
    tracing::debug!(n, modulus, offset, "group");

    let start = if flags.contains(&Flag::Start) {
        let scope = table.wrapped("table")?;
        let inputs = Inputs {
            read: Some(&ids),
            scope: Some(&scope),
            scope2: None,
        };
        let params = Params {
            part: [modulus as i32, offset as i32],
            limit: n as i32,
        };
        Some(map::exec(gpu, &plan.start, n, inputs, params).await?)
    } else {
        None
    };

    let counted = flags.contains(&Flag::Length) || flags.contains(&Flag::Overflow);
    let placed = if counted {
        Some(count_non_negative(gpu, plan, &table, modulus * 4).await?)
    } else {
        None
    };
    let overflow = match &placed {
        Some(placed) if flags.contains(&Flag::Overflow) => {
            let valid = count_non_negative(gpu, plan, &ids, n).await?;
            let scope = placed.wrapped("placed")?;
            let inputs = Inputs {
                read: Some(&valid),
                scope: Some(&scope),
                scope2: None,
            };
            Some(map::exec(gpu, &plan.difference, 1, inputs, Params::default()).await?)
        }
        _ => None,
    };
    let length = if flags.contains(&Flag::Length) { placed } else { None };

    Ok(Output {
        result: table,
        length,
        start,
        overflow,
    })
}

/// Number of non-negative values among the first `n`, as a one-element
/// buffer.
async fn count_non_negative(gpu: &Gpu, plan: &Plan, values: &Buffer, n: u32) -> Result<Buffer> {
    let inputs = Inputs {
        read: Some(values),
        ..Default::default()
    };
    let indicators = map::exec(gpu, &plan.indicator, n, inputs, Params::default()).await?;
    reduce::exec(gpu, &plan.sum, &indicators, None, n).await
}

const SIEVE_LIMIT: usize = 1 << 20;

/// Sieve of Eratosthenes grown on demand.
struct Sieve {
    composite: Vec<bool>,
    primes: Vec<u32>,
    next: usize,
}

impl Sieve {
    fn new() -> Self {
        Sieve {
            composite: Vec::new(),
            primes: Vec::new(),
            next: 2,
        }
    }

    fn at_least(&mut self, n: u32) -> u32 {
        let at = self.primes.partition_point(|&p| p < n);
        if let Some(&p) = self.primes.get(at) {
            return p;
        }
        if self.composite.is_empty() {
            self.composite = vec![false; SIEVE_LIMIT];
        }
        while self.next < SIEVE_LIMIT {
            let i = self.next;
            self.next += 1;
            if self.composite[i] {
                continue;
            }
            self.primes.push(i as u32);
            for j in (i.saturating_mul(i)..SIEVE_LIMIT).step_by(i) {
                self.composite[j] = true;
            }
            if i as u32 >= n {
                return i as u32;
            }
        }
        self.primes.last().copied().unwrap_or(2)
    }
}

thread_local! {
    static SIEVE: RefCell<Sieve> = RefCell::new(Sieve::new());
}

/// Smallest prime `>= n`, capped at the largest prime below 2^20.
pub fn prime_at_least(n: u32) -> u32 {
    SIEVE.with(|s| s.borrow_mut().at_least(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prime_at_least() {
        assert_eq!(prime_at_least(0), 2);
        assert_eq!(prime_at_least(2), 2);
        assert_eq!(prime_at_least(4), 5);
        assert_eq!(prime_at_least(14), 17);
        assert_eq!(prime_at_least(97), 97);
        assert_eq!(prime_at_least(1000), 1009);
        // already sieved past, answered from the prime list
        assert_eq!(prime_at_least(6), 7);
    }

    #[test]
    fn test_prime_cap() {
        assert_eq!(prime_at_least(u32::MAX), 1_048_573);
    }

    #[test]
    fn test_sieve_extends_lazily() {
        let mut sieve = Sieve::new();
        assert_eq!(sieve.at_least(10), 11);
        assert_eq!(sieve.primes, vec![2, 3, 5, 7, 11]);
        assert_eq!(sieve.at_least(3), 3);
        assert_eq!(sieve.primes.len(), 5);
    }

    #[test]
    fn test_helper_kernels() {
        let ctx = CompileContext::new(64);
        let plan = plan(&ctx).unwrap();
        let start = &plan.start.programs()[map::MAIN].model;
        assert_eq!(start.samplers, [true, true, false]);
        assert_eq!(plan.sum.method(), super::super::Method::Reduce);
        assert_eq!(plan.difference.formats().scope, Format::complex([("placed", INT)]));
    }
}
