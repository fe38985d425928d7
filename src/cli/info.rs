use std::path::PathBuf;
use std::process;

use clap::Args;
use glc::{Gpu, GpuConfig};

#[derive(Args)]
pub struct InfoArgs {
    /// Configuration file (defaults to the nearest glc.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn cmd_info(args: InfoArgs) {
    let config = match &args.config {
        Some(path) => GpuConfig::load(path),
        None => GpuConfig::discover(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    let gpu = match Gpu::with_config(config) {
        Ok(gpu) => gpu,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let info = gpu.adapter_info();
    println!("Adapter:  {}", info.name);
    println!("Backend:  {:?}", info.backend);
    println!("Type:     {:?}", info.device_type);
    println!("Driver:   {} {}", info.driver, info.driver_info);

    let support = gpu.support();
    println!();
    println!("Max texture dimension:        {}", support.max_texture_dimension);
    println!("Max storage buffer binding:   {}", support.max_storage_buffer_binding_size);
    println!("Max workgroups per dimension: {}", support.max_workgroups_per_dimension);
    println!("Max interleaved components:   {}", support.max_interleaved_components);

    let config = gpu.config();
    println!();
    println!("Pool capacity:  {}", config.pool_capacity);
    println!("Idle interval:  {}", config.idle_interval);
}
