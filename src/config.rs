use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Device and dispatch settings, read from `glc.toml` with environment
/// overrides.
#[derive(Clone, Debug, PartialEq)]
pub struct GpuConfig {
    /// Pooled resources kept per size class before further ones are destroyed.
    pub pool_capacity: usize,
    /// Dispatches between forced idle waits.
    pub idle_interval: u32,
    /// Output words one capture program may carry before it is partitioned.
    pub max_interleaved_components: u32,
    pub backends: wgpu::Backends,
    pub power_preference: wgpu::PowerPreference,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 16,
            idle_interval: 64,
            max_interleaved_components: 64,
            backends: wgpu::Backends::PRIMARY,
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

impl GpuConfig {
    /// Load a config file, then apply environment overrides.
    pub fn load(toml_path: &Path) -> Result<GpuConfig> {
        let content = std::fs::read_to_string(toml_path).map_err(|e| {
            Error::Config(format!("cannot read '{}': {}", toml_path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults plus environment overrides, or the nearest `glc.toml` when
    /// one exists above the current directory.
    pub fn discover() -> Result<GpuConfig> {
        let found = std::env::current_dir().ok().and_then(|dir| Self::find(&dir));
        match found {
            Some(path) => Self::load(&path),
            None => {
                let mut config = GpuConfig::default();
                config.apply_env(|key| std::env::var(key).ok())?;
                Ok(config)
            }
        }
    }

    /// Minimal TOML reading: `key = value` lines, `#` comments, section
    /// headers ignored.
    pub fn parse(content: &str) -> Result<GpuConfig> {
        let mut config = GpuConfig::default();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() || trimmed.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = trimmed.split_once('=') {
                let key = key.trim().trim_matches('"');
                let value = value.split('#').next().unwrap_or("").trim().trim_matches('"');
                config.set(key, value)?;
            }
        }
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        const OVERRIDES: [(&str, &str); 5] = [
            ("GLC_POOL_CAPACITY", "pool_capacity"),
            ("GLC_IDLE_INTERVAL", "idle_interval"),
            ("GLC_MAX_INTERLEAVED_COMPONENTS", "max_interleaved_components"),
            ("GLC_BACKEND", "backend"),
            ("GLC_POWER_PREFERENCE", "power_preference"),
        ];
        for (env, key) in OVERRIDES {
            if let Some(value) = var(env) {
                self.set(key, value.trim())?;
            }
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let number = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| Error::Config(format!("'{key}' expects an integer, got '{v}'")))
        };
        match key {
            "pool_capacity" => self.pool_capacity = number(value)? as usize,
            "idle_interval" => self.idle_interval = number(value)?.max(1),
            "max_interleaved_components" => {
                let limit = number(value)?;
                if limit < 4 {
                    return Err(Error::Config(format!(
                        "'max_interleaved_components' must be at least 4, got {limit}"
                    )));
                }
                self.max_interleaved_components = limit;
            }
            "backend" | "backends" => {
                self.backends = match value.to_ascii_lowercase().as_str() {
                    "primary" => wgpu::Backends::PRIMARY,
                    "all" => wgpu::Backends::all(),
                    "vulkan" => wgpu::Backends::VULKAN,
                    "metal" => wgpu::Backends::METAL,
                    "dx12" => wgpu::Backends::DX12,
                    "gl" => wgpu::Backends::GL,
                    other => return Err(Error::Config(format!("unknown backend '{other}'"))),
                }
            }
            "power_preference" => {
                self.power_preference = match value.to_ascii_lowercase().as_str() {
                    "high" | "high-performance" | "high_performance" => {
                        wgpu::PowerPreference::HighPerformance
                    }
                    "low" | "low-power" | "low_power" => wgpu::PowerPreference::LowPower,
                    "none" => wgpu::PowerPreference::None,
                    other => {
                        return Err(Error::Config(format!("unknown power preference '{other}'")))
                    }
                }
            }
            _ => tracing::warn!(key, "ignoring unknown config key"),
        }
        Ok(())
    }

    /// Try to find a glc.toml in the given directory or its ancestors.
    pub fn find(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join("glc.toml");
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
