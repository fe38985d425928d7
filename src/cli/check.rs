use std::process;

use clap::Args;
use glc::diagnostic::render_diagnostics;
use glc::kernel::{fragment, validate, Kernel};

use super::{file_name, load_source, KernelArgs};

#[derive(Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub kernel: KernelArgs,
}

pub fn cmd_check(args: CheckArgs) {
    let CheckArgs { kernel: k } = args;
    let source = load_source(&k.input);
    let name = file_name(&k.input);

    let (fragments, mut diagnostics) = fragment::extract(&source);
    diagnostics.extend(validate::validate(&k.formats(), &fragments));
    render_diagnostics(&diagnostics, &name, &source);
    if diagnostics.iter().any(|d| d.is_error()) {
        process::exit(1);
    }

    let ctx = k.context();
    match Kernel::new(&ctx, k.read.clone(), k.write.clone(), k.scope.clone(), &source) {
        Ok(kernel) => {
            let chunks: usize = kernel.programs().values().map(|p| p.chunks.len()).sum();
            eprintln!(
                "OK: {} ({}, {} passes, {} programs)",
                k.input.display(),
                kernel.method(),
                kernel.programs().len(),
                chunks
            );
        }
        Err(glc::Error::Authoring { rendered, .. }) => {
            eprintln!("{rendered}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
