//! Device context shared by kernels and buffers.
//!
//! A [`Gpu`] is a cheap handle (reference counted, single-threaded) to the
//! wgpu device and queue plus the state every dispatch needs: the resource
//! pool, the program compile context and the idle counter.

pub mod dispatch;
pub mod pool;
pub mod scatter;
pub mod shaders;
pub mod sync;

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;

use crate::buffer::Buffer;
use crate::config::GpuConfig;
use crate::error::{Error, Result};
use crate::format::Format;
use crate::kernel::compile::CompileContext;
use crate::kernel::Kernel;

use pool::{BufferKind, Pool, PooledBuffer, PooledTexture, SharedPool, TextureKind};
use scatter::Builtins;

/// Device capabilities relevant to dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Support {
    pub max_texture_dimension: u32,
    pub max_storage_buffer_binding_size: u32,
    pub max_workgroups_per_dimension: u32,
    /// Output words one program may write per invocation.
    pub max_interleaved_components: u32,
}

impl Support {
    fn new(limits: &wgpu::Limits, config: &GpuConfig) -> Self {
        Self {
            max_texture_dimension: limits.max_texture_dimension_2d,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
            max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_interleaved_components: config.max_interleaved_components,
        }
    }

    /// Whether an `R32Sint` target of this width can be copied straight into
    /// a buffer. Row pitch must be 256-byte aligned unless there is one row.
    pub fn direct_index_readback(width: u32, height: u32) -> bool {
        (width * 4) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT == 0 || height == 1
    }
}

#[derive(Clone)]
pub struct Gpu {
    inner: Rc<GpuInner>,
}

struct GpuInner {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    support: Support,
    config: GpuConfig,
    pool: SharedPool,
    compiler: CompileContext,
    dispatches: Cell<u32>,
    builtins: OnceCell<Builtins>,
}

impl Gpu {
    /// Open the preferred adapter with configuration from `glc.toml` (if one
    /// is found above the working directory) and the environment.
    pub fn new() -> Result<Gpu> {
        Self::with_config(GpuConfig::discover()?)
    }

    pub fn with_config(config: GpuConfig) -> Result<Gpu> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: config.backends,
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: config.power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(Error::NoAdapter)?;

        let adapter_info = adapter.get_info();
        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            device_type = ?adapter_info.device_type,
            "GPU adapter selected"
        );

        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("glc"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| Error::DeviceRequest(e.to_string()))?;

        let support = Support::new(&limits, &config);
        Ok(Gpu {
            inner: Rc::new(GpuInner {
                device,
                queue,
                adapter_info,
                limits,
                support,
                pool: Rc::new(RefCell::new(Pool::new(config.pool_capacity))),
                compiler: CompileContext::new(config.max_interleaved_components),
                config,
                dispatches: Cell::new(0),
                builtins: OnceCell::new(),
            }),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.inner.adapter_info
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.inner.limits
    }

    pub fn support(&self) -> Support {
        self.inner.support
    }

    pub fn config(&self) -> &GpuConfig {
        &self.inner.config
    }

    pub fn compiler(&self) -> &CompileContext {
        &self.inner.compiler
    }

    pub fn pool(&self) -> &SharedPool {
        &self.inner.pool
    }

    /// An empty buffer of `format`.
    pub fn buffer(&self, format: Format) -> Buffer {
        Buffer::new(self, format, 0)
    }

    /// Compile a kernel against this device's compile context.
    pub fn kernel(&self, read: Format, write: Format, scope: Format, source: &str) -> Result<Kernel> {
        Kernel::new(self.compiler(), read, write, scope, source)
    }

    /// Destroy every idle pooled resource.
    pub fn free_all(&self) {
        if let Ok(mut pool) = self.inner.pool.try_borrow_mut() {
            pool.clear();
        }
    }

    pub(crate) fn storage_buffer(&self, size: u64) -> Result<PooledBuffer> {
        self.pooled_buffer(size, BufferKind::Storage)
    }

    pub(crate) fn staging_buffer(&self, size: u64) -> Result<PooledBuffer> {
        self.pooled_buffer(size, BufferKind::Staging)
    }

    fn pooled_buffer(&self, size: u64, kind: BufferKind) -> Result<PooledBuffer> {
        let buffer = self.inner.pool.borrow_mut().get_buffer(self.device(), size, kind)?;
        Ok(PooledBuffer::new(buffer, kind, &self.inner.pool))
    }

    pub(crate) fn texture(&self, pixels: u32, kind: TextureKind) -> Result<PooledTexture> {
        let texture = self.inner.pool.borrow_mut().get_texture(self.device(), pixels, kind)?;
        Ok(PooledTexture::new(texture, kind, &self.inner.pool))
    }

    pub(crate) fn builtins(&self) -> &Builtins {
        self.inner
            .builtins
            .get_or_init(|| Builtins::new(self.device()))
    }

    /// Count one dispatch; every `idle_interval` dispatches wait for the
    /// queue to drain.
    pub(crate) async fn throttle(&self) -> Result<()> {
        let n = self.inner.dispatches.get() + 1;
        if n >= self.inner.config.idle_interval {
            self.inner.dispatches.set(0);
            tracing::debug!(interval = n, "waiting for device idle");
            self.wait_for_idle().await
        } else {
            self.inner.dispatches.set(n);
            Ok(())
        }
    }
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("adapter", &self.inner.adapter_info.name)
            .field("backend", &self.inner.adapter_info.backend)
            .finish()
    }
}
