//! Index ranges, the unit of work for every dispatch.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::gpu::Gpu;
use crate::kernel::{Bind, Flag, Kernel, Method, Output};

/// The interval `[start, end)` plus the expected number of groups for
/// [`Range::group`]. Ranges are plain values and can be reused freely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: usize,
    pub end: usize,
    pub group_size: Option<usize>,
}

/// `[0, n)`.
pub fn range(n: usize) -> Range {
    Range::new(0, n)
}

impl Range {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            group_size: None,
        }
    }

    pub fn with_group_size(mut self, group_size: usize) -> Self {
        self.group_size = Some(group_size);
        self
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn map(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>) -> Result<Buffer> {
        Ok(kernel.invoke(gpu, self, Method::Map, bind, &[]).await?.result)
    }

    pub async fn reduce(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>) -> Result<Buffer> {
        Ok(kernel.invoke(gpu, self, Method::Reduce, bind, &[]).await?.result)
    }

    pub async fn scan(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>) -> Result<Buffer> {
        Ok(kernel.invoke(gpu, self, Method::Scan, bind, &[]).await?.result)
    }

    /// Indices `0..n` ordered by the kernel's comparator.
    pub async fn sort(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>) -> Result<Buffer> {
        Ok(kernel.invoke(gpu, self, Method::Sort, bind, &[]).await?.result)
    }

    /// Indices of the kept elements, padded with `-1`.
    pub async fn filtro(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>) -> Result<Buffer> {
        Ok(self.filtro_with(gpu, kernel, bind, &[]).await?.result)
    }

    pub async fn filtro_with(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>, flags: &[Flag]) -> Result<Output> {
        kernel.invoke(gpu, self, Method::Filtro, bind, flags).await
    }

    /// The bucket table, four slots per bucket, `-1` where empty.
    pub async fn group(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>) -> Result<Buffer> {
        Ok(self.group_with(gpu, kernel, bind, &[]).await?.result)
    }

    pub async fn group_with(&self, gpu: &Gpu, kernel: &Kernel, bind: Bind<'_>, flags: &[Flag]) -> Result<Output> {
        kernel.invoke(gpu, self, Method::Group, bind, flags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_len() {
        assert_eq!(range(10).len(), 10);
        assert!(range(0).is_empty());
        assert_eq!(Range::new(4, 2).len(), 0);
        assert_eq!(Range::new(2, 7).len(), 5);
    }

    #[test]
    fn test_group_size() {
        let r = range(100).with_group_size(12);
        assert_eq!(r.group_size, Some(12));
        assert_eq!(range(100).group_size, None);
        assert_eq!(r.len(), 100);
    }
}
