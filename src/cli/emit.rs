use std::path::PathBuf;
use std::process;

use clap::Args;
use glc::kernel::Kernel;

use super::{load_source, KernelArgs};

#[derive(Args)]
pub struct EmitArgs {
    #[command(flatten)]
    pub kernel: KernelArgs,
    /// Only emit this pass (e.g. `main`, `up`, `down`)
    #[arg(long)]
    pub pass: Option<String>,
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn cmd_emit(args: EmitArgs) {
    let EmitArgs {
        kernel: k,
        pass,
        output,
    } = args;
    let source = load_source(&k.input);
    let ctx = k.context();
    let kernel = match Kernel::new(&ctx, k.read.clone(), k.write.clone(), k.scope.clone(), &source) {
        Ok(kernel) => kernel,
        Err(glc::Error::Authoring { rendered, .. }) => {
            eprintln!("{rendered}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let mut out = String::new();
    for (name, program) in kernel.programs() {
        if pass.as_deref().is_some_and(|p| p != *name) {
            continue;
        }
        for chunk in &program.chunks {
            out.push_str(&format!(
                "// {} ({}, {} words per invocation)\n",
                chunk.label, chunk.format, chunk.stride
            ));
            out.push_str(&chunk.source);
            out.push('\n');
        }
    }
    if out.is_empty() {
        let names: Vec<&str> = kernel.programs().keys().copied().collect();
        eprintln!(
            "error: {} kernel has no pass '{}' (passes: {})",
            kernel.method(),
            pass.unwrap_or_default(),
            names.join(", ")
        );
        process::exit(1);
    }

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &out) {
                eprintln!("error: cannot write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{out}"),
    }
}
