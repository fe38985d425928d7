mod cli;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glc", version, about = "Compile and inspect GPU array kernels")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a kernel and report authoring errors
    Check(cli::check::CheckArgs),
    /// Print the generated WGSL of a kernel
    Emit(cli::emit::EmitArgs),
    /// Show the GPU adapter, limits and effective configuration
    Info(cli::info::InfoArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => cli::check::cmd_check(args),
        Command::Emit(args) => cli::emit::cmd_emit(args),
        Command::Info(args) => cli::info::cmd_info(args),
    }
}
