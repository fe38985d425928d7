//! Array-parallel GPU primitives compiled from small WGSL kernels.
//!
//! A kernel is a few lines of WGSL with one entrypoint naming the primitive
//! it runs under (`map`, `filtro`, `reduce`, `scan`, `sort` or `group`) and
//! `read`/`write` calls in place of buffer plumbing. [`Kernel::new`] turns it
//! into one or more complete compute programs; a [`Range`] dispatches it.
//!
//! ```no_run
//! use glc::{range, Bind, Buffer, Gpu, FLOAT};
//!
//! # async fn run() -> glc::Result<()> {
//! let gpu = Gpu::new()?;
//! let kernel = gpu.kernel(
//!     FLOAT.into(),
//!     FLOAT.into(),
//!     glc::Format::Null,
//!     "fn map(i: i32) { write(read(i) * 2.0); }",
//! )?;
//! let input = Buffer::from_slice(&gpu, FLOAT, &[1.0f32, 2.0, 3.0])?;
//! let doubled = range(3).map(&gpu, &kernel, Bind::read(&input)).await?;
//! assert_eq!(doubled.read_slice::<f32>().await?, vec![2.0, 4.0, 6.0]);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod format;
pub mod gpu;
pub mod kernel;
pub mod lifetime;
pub mod random;
pub mod range;
pub mod span;

pub use buffer::{Buffer, Record, Rename, Representation, Value};
pub use config::GpuConfig;
pub use error::{Error, Result};
pub use format::{
    Base, Format, SimpleFormat, FLOAT, INT, IVEC2, IVEC3, IVEC4, UINT, UVEC2, UVEC3, UVEC4, VEC2, VEC3,
    VEC4,
};
pub use gpu::{Gpu, Support};
pub use kernel::{compose, dynamic, include, stub, trim_leading_space, Bind, Flag, Include, Kernel, Method, Output, Stub};
pub use lifetime::{Handle, Lifetime};
pub use range::{range, Range};
