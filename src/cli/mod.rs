pub mod check;
pub mod emit;
pub mod info;

use std::path::{Path, PathBuf};
use std::process;

use clap::Args;
use glc::format::Format;
use glc::kernel::compile::CompileContext;
use glc::kernel::model::Formats;

/// Kernel file plus the formats it is compiled against.
#[derive(Args)]
pub struct KernelArgs {
    /// WGSL kernel source file
    pub input: PathBuf,
    /// Read buffer format, e.g. `f32` or `pos:vec3f,id:i32`
    #[arg(long, default_value = "null")]
    pub read: Format,
    /// Write buffer format
    #[arg(long)]
    pub write: Format,
    /// Scope buffer format
    #[arg(long, default_value = "null")]
    pub scope: Format,
    /// Output words per program before it is partitioned
    #[arg(long, default_value_t = 64)]
    pub limit: u32,
}

impl KernelArgs {
    pub fn formats(&self) -> Formats {
        Formats::new(self.read.clone(), self.write.clone(), self.scope.clone())
    }

    pub fn context(&self) -> CompileContext {
        CompileContext::new(self.limit)
    }
}

/// Read a source file or exit with an error.
pub fn load_source(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

/// Display name of a source file in diagnostics.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
