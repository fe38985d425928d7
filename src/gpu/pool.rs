//! Power-of-two recycling of device buffers and textures.
//!
//! Resources are keyed by kind and size class. A pooled handle returns its
//! resource to the pool when dropped; the pool keeps at most `capacity`
//! resources per class and destroys the rest.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use crate::buffer::layout::texture_dimensions;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Capture output and dispatch input.
    Storage,
    /// Host readback.
    Staging,
}

impl BufferKind {
    fn usage(self) -> wgpu::BufferUsages {
        match self {
            BufferKind::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::VERTEX
            }
            BufferKind::Staging => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureKind {
    /// `Rgba32Uint` buffer contents.
    Data,
    /// `R32Sint` scatter target.
    Index,
    /// Depth and stencil for scatter passes.
    Mask,
}

impl TextureKind {
    pub fn format(self) -> wgpu::TextureFormat {
        match self {
            TextureKind::Data => wgpu::TextureFormat::Rgba32Uint,
            TextureKind::Index => wgpu::TextureFormat::R32Sint,
            TextureKind::Mask => wgpu::TextureFormat::Depth24PlusStencil8,
        }
    }

    fn usage(self) -> wgpu::TextureUsages {
        match self {
            TextureKind::Data => {
                wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::COPY_SRC
            }
            TextureKind::Index => {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
            }
            TextureKind::Mask => wgpu::TextureUsages::RENDER_ATTACHMENT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub destroyed: u64,
}

pub struct Pool {
    capacity: usize,
    buffers: HashMap<(BufferKind, u64), Vec<wgpu::Buffer>>,
    textures: HashMap<(TextureKind, u32), Vec<wgpu::Texture>>,
    stats: PoolStats,
}

/// Shared handle to a pool, held weakly by pooled resources.
pub type SharedPool = Rc<RefCell<Pool>>;

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            stats: PoolStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Change the per-class bound, destroying surplus resources.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        let mut destroyed = 0;
        for list in self.buffers.values_mut() {
            while list.len() > capacity {
                if let Some(b) = list.pop() {
                    b.destroy();
                    destroyed += 1;
                }
            }
        }
        for list in self.textures.values_mut() {
            while list.len() > capacity {
                if let Some(t) = list.pop() {
                    t.destroy();
                    destroyed += 1;
                }
            }
        }
        self.stats.destroyed += destroyed;
    }

    /// Idle resources across all classes.
    pub fn idle(&self) -> usize {
        self.buffers.values().map(Vec::len).sum::<usize>()
            + self.textures.values().map(Vec::len).sum::<usize>()
    }

    pub fn get_buffer(&mut self, device: &wgpu::Device, size: u64, kind: BufferKind) -> Result<wgpu::Buffer> {
        if !size.is_power_of_two() {
            return Err(Error::NotPowerOfTwo(size));
        }
        if let Some(buffer) = self.buffers.get_mut(&(kind, size)).and_then(Vec::pop) {
            self.stats.reused += 1;
            return Ok(buffer);
        }
        self.stats.created += 1;
        tracing::debug!(?kind, size, "allocating buffer");
        Ok(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(match kind {
                BufferKind::Storage => "glc storage",
                BufferKind::Staging => "glc staging",
            }),
            size,
            usage: kind.usage(),
            mapped_at_creation: false,
        }))
    }

    pub fn get_texture(&mut self, device: &wgpu::Device, pixels: u32, kind: TextureKind) -> Result<wgpu::Texture> {
        if !pixels.is_power_of_two() {
            return Err(Error::NotPowerOfTwo(pixels as u64));
        }
        if let Some(texture) = self.textures.get_mut(&(kind, pixels)).and_then(Vec::pop) {
            self.stats.reused += 1;
            return Ok(texture);
        }
        self.stats.created += 1;
        let (width, height) = texture_dimensions(pixels);
        tracing::debug!(?kind, width, height, "allocating texture");
        Ok(device.create_texture(&wgpu::TextureDescriptor {
            label: Some(match kind {
                TextureKind::Data => "glc data",
                TextureKind::Index => "glc index",
                TextureKind::Mask => "glc mask",
            }),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: kind.format(),
            usage: kind.usage(),
            view_formats: &[],
        }))
    }

    pub fn reclaim_buffer(&mut self, kind: BufferKind, buffer: wgpu::Buffer) {
        let list = self.buffers.entry((kind, buffer.size())).or_default();
        if list.len() < self.capacity {
            list.push(buffer);
        } else {
            buffer.destroy();
            self.stats.destroyed += 1;
        }
    }

    pub fn reclaim_texture(&mut self, kind: TextureKind, texture: wgpu::Texture) {
        let pixels = texture.width() * texture.height();
        let list = self.textures.entry((kind, pixels)).or_default();
        if list.len() < self.capacity {
            list.push(texture);
        } else {
            texture.destroy();
            self.stats.destroyed += 1;
        }
    }

    /// Destroy every idle resource.
    pub fn clear(&mut self) {
        let n = self.idle() as u64;
        for (_, list) in self.buffers.drain() {
            list.into_iter().for_each(|b| b.destroy());
        }
        for (_, list) in self.textures.drain() {
            list.into_iter().for_each(|t| t.destroy());
        }
        self.stats.destroyed += n;
    }
}

/// A buffer on loan from the pool.
pub struct PooledBuffer {
    buffer: Option<wgpu::Buffer>,
    kind: BufferKind,
    pool: Weak<RefCell<Pool>>,
}

impl PooledBuffer {
    pub fn new(buffer: wgpu::Buffer, kind: BufferKind, pool: &SharedPool) -> Self {
        Self {
            buffer: Some(buffer),
            kind,
            pool: Rc::downgrade(pool),
        }
    }

    /// Detach the buffer from the pool; it is destroyed when dropped.
    pub fn forget(mut self) -> Option<wgpu::Buffer> {
        self.buffer.take()
    }
}

impl Deref for PooledBuffer {
    type Target = wgpu::Buffer;

    fn deref(&self) -> &wgpu::Buffer {
        // Only `forget` and `drop` take the buffer, and both consume the handle.
        self.buffer.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            if let Ok(mut pool) = pool.try_borrow_mut() {
                pool.reclaim_buffer(self.kind, buffer);
            }
        }
    }
}

/// A texture on loan from the pool.
pub struct PooledTexture {
    texture: Option<wgpu::Texture>,
    kind: TextureKind,
    pool: Weak<RefCell<Pool>>,
}

impl PooledTexture {
    pub fn new(texture: wgpu::Texture, kind: TextureKind, pool: &SharedPool) -> Self {
        Self {
            texture: Some(texture),
            kind,
            pool: Rc::downgrade(pool),
        }
    }

    pub fn forget(mut self) -> Option<wgpu::Texture> {
        self.texture.take()
    }
}

impl Deref for PooledTexture {
    type Target = wgpu::Texture;

    fn deref(&self) -> &wgpu::Texture {
        self.texture.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledTexture {
    fn drop(&mut self) {
        let Some(texture) = self.texture.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            if let Ok(mut pool) = pool.try_borrow_mut() {
                pool.reclaim_texture(self.kind, texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_formats() {
        assert_eq!(TextureKind::Data.format(), wgpu::TextureFormat::Rgba32Uint);
        assert_eq!(TextureKind::Index.format(), wgpu::TextureFormat::R32Sint);
        assert_eq!(TextureKind::Mask.format(), wgpu::TextureFormat::Depth24PlusStencil8);
    }

    #[test]
    fn test_usages() {
        assert!(BufferKind::Storage.usage().contains(wgpu::BufferUsages::VERTEX));
        assert!(BufferKind::Staging.usage().contains(wgpu::BufferUsages::MAP_READ));
        assert!(!BufferKind::Storage.usage().contains(wgpu::BufferUsages::MAP_READ));
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = Pool::new(4);
        assert_eq!(pool.idle(), 0);
        pool.set_capacity(2);
        assert_eq!(pool.capacity(), 2);
        pool.clear();
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    #[ignore = "requires GPU"]
    fn test_non_power_of_two_rejected() {
        let gpu = crate::gpu::Gpu::new().unwrap();
        let mut pool = Pool::new(4);
        let err = pool.get_buffer(gpu.device(), 24, BufferKind::Storage).unwrap_err();
        assert!(matches!(err, Error::NotPowerOfTwo(24)));
        let err = pool.get_texture(gpu.device(), 3, TextureKind::Data).unwrap_err();
        assert!(matches!(err, Error::NotPowerOfTwo(3)));
    }

    #[test]
    #[ignore = "requires GPU"]
    fn test_reclaim_and_reuse() {
        let gpu = crate::gpu::Gpu::new().unwrap();
        let shared: SharedPool = Rc::new(RefCell::new(Pool::new(1)));
        let a = shared.borrow_mut().get_buffer(gpu.device(), 64, BufferKind::Storage).unwrap();
        let b = shared.borrow_mut().get_buffer(gpu.device(), 64, BufferKind::Storage).unwrap();
        drop(PooledBuffer::new(a, BufferKind::Storage, &shared));
        drop(PooledBuffer::new(b, BufferKind::Storage, &shared));
        let stats = shared.borrow().stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.destroyed, 1);
        assert_eq!(shared.borrow().idle(), 1);
        let _c = shared.borrow_mut().get_buffer(gpu.device(), 64, BufferKind::Storage).unwrap();
        assert_eq!(shared.borrow().stats().reused, 1);
    }
}
