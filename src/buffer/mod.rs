//! Buffers of formatted elements living on the host, the device, or both.
//!
//! A [`Buffer`] caches up to three representations of the same bytes: a host
//! word vector, a pooled storage buffer and a pooled `Rgba32Uint` texture.
//! [`Buffer::acquire`] converts between them on demand. Device resources are
//! shared through `Rc`, so buffers produced by `split` and `merge` can alias
//! the same storage; the pool gets a resource back once its last holder drops.

pub mod layout;
pub mod ops;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::format::{Base, Format, SimpleFormat};
use crate::gpu::pool::{PooledBuffer, PooledTexture, TextureKind};
use crate::gpu::Gpu;

pub use layout::{size_buffer, standard_layout, texture_dimensions, Attribute};
pub use ops::Rename;

/// Where a buffer's bytes can live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Representation {
    Host,
    Device,
    Texture,
}

#[derive(Default)]
pub(crate) struct Representations {
    pub host: Option<Vec<u32>>,
    pub device: Option<Rc<PooledBuffer>>,
    pub texture: Option<Rc<PooledTexture>>,
}

impl Representations {
    fn is_empty(&self) -> bool {
        self.host.is_none() && self.device.is_none() && self.texture.is_none()
    }

    fn holds(&self, r: Representation) -> bool {
        match r {
            Representation::Host => self.host.is_some(),
            Representation::Device => self.device.is_some(),
            Representation::Texture => self.texture.is_some(),
        }
    }

    fn count(&self) -> usize {
        [self.host.is_some(), self.device.is_some(), self.texture.is_some()]
            .iter()
            .filter(|&&b| b)
            .count()
    }
}

pub struct Buffer {
    gpu: Gpu,
    format: Format,
    attribs: RefCell<Vec<Attribute>>,
    byte_length: Cell<u64>,
    repr: RefCell<Representations>,
    consumed: Cell<bool>,
}

impl Buffer {
    /// A buffer of `count` elements with no contents yet; it reads as zeros.
    pub fn new(gpu: &Gpu, format: Format, count: u32) -> Buffer {
        let attribs = standard_layout(&format, count);
        Buffer {
            gpu: gpu.clone(),
            byte_length: Cell::new(size_buffer(&format, count)),
            format,
            attribs: RefCell::new(attribs),
            repr: RefCell::new(Representations::default()),
            consumed: Cell::new(false),
        }
    }

    pub(crate) fn from_device(
        gpu: &Gpu,
        format: Format,
        attribs: Vec<Attribute>,
        byte_length: u64,
        device: PooledBuffer,
    ) -> Buffer {
        Buffer {
            gpu: gpu.clone(),
            format,
            attribs: RefCell::new(attribs),
            byte_length: Cell::new(byte_length),
            repr: RefCell::new(Representations {
                device: Some(Rc::new(device)),
                ..Default::default()
            }),
            consumed: Cell::new(false),
        }
    }

    pub(crate) fn from_words(gpu: &Gpu, format: Format, attribs: Vec<Attribute>, words: Vec<u32>) -> Buffer {
        let buffer = Buffer {
            gpu: gpu.clone(),
            format,
            attribs: RefCell::new(attribs),
            byte_length: Cell::new(words.len() as u64 * 4),
            repr: RefCell::new(Representations::default()),
            consumed: Cell::new(false),
        };
        buffer.repr.borrow_mut().host = Some(words);
        buffer
    }

    /// A view with another format and layout over the same representations.
    pub(crate) fn alias(&self, format: Format, attribs: Vec<Attribute>) -> Buffer {
        let repr = self.repr.borrow();
        Buffer {
            gpu: self.gpu.clone(),
            format,
            attribs: RefCell::new(attribs),
            byte_length: Cell::new(self.byte_length()),
            repr: RefCell::new(Representations {
                host: repr.host.clone(),
                device: repr.device.clone(),
                texture: repr.texture.clone(),
            }),
            consumed: Cell::new(false),
        }
    }

    /// A buffer owning this buffer's contents, leaving this one freed.
    pub(crate) fn take(&self) -> Buffer {
        let repr = std::mem::take(&mut *self.repr.borrow_mut());
        let taken = Buffer {
            gpu: self.gpu.clone(),
            format: self.format.clone(),
            attribs: RefCell::new(self.attribs()),
            byte_length: Cell::new(self.byte_length()),
            repr: RefCell::new(repr),
            consumed: Cell::new(false),
        };
        self.free();
        taken
    }

    pub fn gpu(&self) -> &Gpu {
        &self.gpu
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn attribs(&self) -> Vec<Attribute> {
        self.attribs.borrow().clone()
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length.get()
    }

    /// Element count, or `None` when the attributes disagree.
    pub fn length(&self) -> Option<u32> {
        layout::common_count(&self.attribs.borrow())
    }

    pub fn checked_length(&self) -> Result<u32> {
        self.length().ok_or_else(|| Error::IncompleteRead {
            found: layout::describe_counts(&self.attribs.borrow()),
        })
    }

    pub(crate) fn set_count(&self, count: u32) {
        for a in self.attribs.borrow_mut().iter_mut() {
            a.count = count;
        }
    }

    pub(crate) fn set_attribs(&self, attribs: Vec<Attribute>) {
        *self.attribs.borrow_mut() = attribs;
    }

    pub(crate) fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    /// Mark the buffer as handed over: the next operation that reads it
    /// frees it afterwards.
    pub fn consume(&self) -> &Self {
        self.consumed.set(true);
        self
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.get()
    }

    pub(crate) fn set_consumed(&self, consumed: bool) {
        self.consumed.set(consumed);
    }

    pub fn holds(&self, r: Representation) -> bool {
        self.repr.borrow().holds(r)
    }

    pub fn representations(&self) -> Vec<Representation> {
        [Representation::Host, Representation::Device, Representation::Texture]
            .into_iter()
            .filter(|&r| self.holds(r))
            .collect()
    }

    pub(crate) fn device_buffer(&self) -> Option<Rc<PooledBuffer>> {
        self.repr.borrow().device.clone()
    }

    pub(crate) fn texture(&self) -> Option<Rc<PooledTexture>> {
        self.repr.borrow().texture.clone()
    }

    /// The storage buffer, uploaded from another representation if needed.
    pub(crate) fn device(&self) -> Result<Rc<PooledBuffer>> {
        self.ensure_device()
    }

    /// Forget the host and texture copies after the storage buffer was
    /// written in place.
    pub(crate) fn device_written(&self) {
        let mut repr = self.repr.borrow_mut();
        repr.host = None;
        repr.texture = None;
    }

    /// Drop every representation and reset the element counts.
    pub fn free(&self) {
        *self.repr.borrow_mut() = Representations::default();
        self.set_count(0);
        self.consumed.set(false);
    }

    /// Drop one cached representation, unless it is the only one.
    pub fn discard(&self, r: Representation) {
        let mut repr = self.repr.borrow_mut();
        if !repr.holds(r) || repr.count() < 2 {
            return;
        }
        match r {
            Representation::Host => repr.host = None,
            Representation::Device => repr.device = None,
            Representation::Texture => repr.texture = None,
        }
    }

    /// Make `target` available, converting from whatever is cached.
    pub async fn acquire(&self, target: Representation) -> Result<()> {
        if self.holds(target) {
            return Ok(());
        }
        match target {
            Representation::Host => {
                if self.repr.borrow().is_empty() {
                    self.repr.borrow_mut().host = Some(vec![0; self.words()]);
                    return Ok(());
                }
                let device = self.ensure_device()?;
                let words = self.gpu.read_words(&device, self.byte_length()).await?;
                self.repr.borrow_mut().host = Some(words);
            }
            Representation::Device => {
                self.ensure_device()?;
            }
            Representation::Texture => {
                let device = self.ensure_device()?;
                self.device_to_texture(&device)?;
            }
        }
        Ok(())
    }

    fn words(&self) -> usize {
        (self.byte_length() / 4) as usize
    }

    fn texture_pixels(&self) -> u32 {
        (self.byte_length() / layout::TEXEL_BYTES).max(1) as u32
    }

    fn ensure_device(&self) -> Result<Rc<PooledBuffer>> {
        if let Some(device) = self.device_buffer() {
            return Ok(device);
        }
        let device = self.gpu.storage_buffer(self.byte_length())?;
        {
            let repr = self.repr.borrow();
            let mut encoder = self
                .gpu
                .device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("glc upload"),
                });
            if let Some(host) = &repr.host {
                self.gpu.queue().write_buffer(&device, 0, bytemuck::cast_slice(host));
            } else if let Some(texture) = &repr.texture {
                let (width, height) = texture_dimensions(self.texture_pixels());
                encoder.copy_texture_to_buffer(
                    texture.as_image_copy(),
                    wgpu::TexelCopyBufferInfo {
                        buffer: &device,
                        layout: texel_layout(width, height),
                    },
                    wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                );
            } else {
                encoder.clear_buffer(&device, 0, None);
            }
            self.gpu.queue().submit(Some(encoder.finish()));
        }
        let device = Rc::new(device);
        self.repr.borrow_mut().device = Some(Rc::clone(&device));
        Ok(device)
    }

    fn device_to_texture(&self, device: &PooledBuffer) -> Result<()> {
        let pixels = self.texture_pixels();
        let texture = self.gpu.texture(pixels, TextureKind::Data)?;
        let (width, height) = texture_dimensions(pixels);
        let mut encoder = self
            .gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc texture upload"),
            });
        encoder.copy_buffer_to_texture(
            wgpu::TexelCopyBufferInfo {
                buffer: device,
                layout: texel_layout(width, height),
            },
            texture.as_image_copy(),
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.gpu.queue().submit(Some(encoder.finish()));
        self.repr.borrow_mut().texture = Some(Rc::new(texture));
        Ok(())
    }

    /// Raw words of the buffer, fetched to the host if necessary.
    pub async fn read_words(&self) -> Result<Vec<u32>> {
        self.acquire(Representation::Host).await?;
        Ok(self.repr.borrow().host.clone().unwrap_or_default())
    }

    /// Build a buffer of a simple format from flat component data.
    pub fn from_slice<T: Scalar>(gpu: &Gpu, format: SimpleFormat, data: &[T]) -> Result<Buffer> {
        let mut buffer = Buffer::new(gpu, format.into(), 0);
        buffer.write_slice(data)?;
        Ok(buffer)
    }

    /// Replace the contents with flat component data.
    pub fn write_slice<T: Scalar>(&mut self, data: &[T]) -> Result<()> {
        let Format::Simple(format) = self.format else {
            return Err(Error::FormatMismatch(format!(
                "write_slice needs a simple format, buffer is {}",
                self.format
            )));
        };
        check_base::<T>(format)?;
        let components = format.components as usize;
        if data.len() % components != 0 {
            return Err(Error::FormatMismatch(format!(
                "{} values do not fill whole {} elements",
                data.len(),
                format
            )));
        }
        let count = (data.len() / components) as u32;
        let attribs = standard_layout(&self.format, count);
        let mut words = vec![0u32; (size_buffer(&self.format, count) / 4) as usize];
        words[..data.len()].copy_from_slice(bytemuck::cast_slice(data));
        self.replace(attribs, words);
        Ok(())
    }

    /// Flat component data of a simple-format buffer.
    pub async fn read_slice<T: Scalar>(&self) -> Result<Vec<T>> {
        let Format::Simple(format) = self.format else {
            return Err(Error::FormatMismatch(format!(
                "read_slice needs a simple format, buffer is {}",
                self.format
            )));
        };
        check_base::<T>(format)?;
        let words = self.read_words().await?;
        let attribs = self.attribs();
        let Some(attrib) = attribs.first() else {
            return Ok(Vec::new());
        };
        let out = gather(attrib, &words);
        Ok(bytemuck::cast_slice::<u32, T>(&out).to_vec())
    }

    /// Build a buffer of a complex format from per-attribute columns.
    pub fn from_records(gpu: &Gpu, format: Format, record: &Record) -> Result<Buffer> {
        let mut buffer = Buffer::new(gpu, format, 0);
        buffer.write_records(record)?;
        Ok(buffer)
    }

    /// Replace the contents with per-attribute columns. Columns may hold
    /// different element counts; missing columns are empty.
    pub fn write_records(&mut self, record: &Record) -> Result<()> {
        if !self.format.is_complex() {
            return Err(Error::FormatMismatch(format!(
                "write_records needs a complex format, buffer is {}",
                self.format
            )));
        }
        if let Some(key) = record.keys().find(|k| self.format.get(Some(k.as_str())).is_none()) {
            return Err(Error::FormatMismatch(format!(
                "format {} has no attribute \"{key}\"",
                self.format
            )));
        }
        let mut counts = BTreeMap::new();
        for (key, format) in self.format.fields() {
            let Some(key) = key else { continue };
            let count = match record.get(key) {
                Some(value) => value.elements(format)?,
                None => 0,
            };
            counts.insert(key, count);
        }
        let max = counts.values().copied().max().unwrap_or(0);
        let mut attribs = standard_layout(&self.format, max);
        let mut words = vec![0u32; (size_buffer(&self.format, max) / 4) as usize];
        for attrib in attribs.iter_mut() {
            let key = attrib.name.as_deref().unwrap_or_default();
            attrib.count = counts.get(key).copied().unwrap_or(0);
            let Some(value) = record.get(key) else { continue };
            let source = value.words();
            let c = attrib.format.components as usize;
            for e in 0..attrib.count {
                let at = e as usize * c;
                words[attrib.words(e)].copy_from_slice(&source[at..at + c]);
            }
        }
        self.replace(attribs, words);
        Ok(())
    }

    /// Per-attribute columns of a complex-format buffer.
    pub async fn read_records(&self) -> Result<Record> {
        if !self.format.is_complex() {
            return Err(Error::FormatMismatch(format!(
                "read_records needs a complex format, buffer is {}",
                self.format
            )));
        }
        let words = self.read_words().await?;
        Ok(self
            .attribs()
            .iter()
            .filter_map(|a| {
                let name = a.name.clone()?;
                Some((name, Value::from_words(a.format.base, gather(a, &words))))
            })
            .collect())
    }

    fn replace(&self, attribs: Vec<Attribute>, words: Vec<u32>) {
        self.byte_length.set(words.len() as u64 * 4);
        *self.attribs.borrow_mut() = attribs;
        *self.repr.borrow_mut() = Representations {
            host: Some(words),
            ..Default::default()
        };
    }
}

fn check_base<T: Scalar>(format: SimpleFormat) -> Result<()> {
    if format.base == T::BASE {
        Ok(())
    } else {
        Err(Error::FormatMismatch(format!(
            "{} data does not fit a {} buffer",
            T::BASE.scalar(),
            format
        )))
    }
}

fn gather(attrib: &Attribute, words: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(attrib.count as usize * attrib.format.components as usize);
    for e in 0..attrib.count {
        let range = attrib.words(e);
        if range.end > words.len() {
            break;
        }
        out.extend_from_slice(&words[range]);
    }
    out
}

/// Row layout of a data texture copy. Single-row copies may leave the row
/// pitch unset and so skip the 256-byte alignment.
pub(crate) fn texel_layout(width: u32, height: u32) -> wgpu::TexelCopyBufferLayout {
    wgpu::TexelCopyBufferLayout {
        offset: 0,
        bytes_per_row: (height > 1).then_some(width * layout::TEXEL_BYTES as u32),
        rows_per_image: None,
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("format", &self.format)
            .field("length", &self.length())
            .field("byte_length", &self.byte_length())
            .field("representations", &self.representations())
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Element scalar types that map onto a [`Base`].
pub trait Scalar: bytemuck::Pod {
    const BASE: Base;
}

impl Scalar for f32 {
    const BASE: Base = Base::Float;
}

impl Scalar for i32 {
    const BASE: Base = Base::Int;
}

impl Scalar for u32 {
    const BASE: Base = Base::Uint;
}

/// One attribute's elements, components flattened.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(Vec<f32>),
    Int(Vec<i32>),
    Uint(Vec<u32>),
}

/// Column data of a complex buffer, keyed by attribute name.
pub type Record = BTreeMap<String, Value>;

impl Value {
    pub fn base(&self) -> Base {
        match self {
            Value::Float(_) => Base::Float,
            Value::Int(_) => Base::Int,
            Value::Uint(_) => Base::Uint,
        }
    }

    /// Scalar count.
    pub fn len(&self) -> usize {
        match self {
            Value::Float(v) => v.len(),
            Value::Int(v) => v.len(),
            Value::Uint(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn words(&self) -> Vec<u32> {
        match self {
            Value::Float(v) => bytemuck::cast_slice(v).to_vec(),
            Value::Int(v) => bytemuck::cast_slice(v).to_vec(),
            Value::Uint(v) => v.clone(),
        }
    }

    fn from_words(base: Base, words: Vec<u32>) -> Value {
        match base {
            Base::Float => Value::Float(bytemuck::cast_slice(&words).to_vec()),
            Base::Int => Value::Int(bytemuck::cast_slice(&words).to_vec()),
            Base::Uint => Value::Uint(words),
        }
    }

    /// Whole elements of `format` in this column.
    fn elements(&self, format: SimpleFormat) -> Result<u32> {
        let c = format.components as usize;
        if self.base() != format.base || self.len() % c != 0 {
            return Err(Error::FormatMismatch(format!(
                "{} {} values do not fill whole {format} elements",
                self.len(),
                self.base().scalar()
            )));
        }
        Ok((self.len() / c) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FLOAT, INT, VEC2, VEC3};

    #[test]
    fn test_gather_interleaved() {
        // two attributes, a: f32 at offset 0, b: vec2 at offset 4, repeat 12
        let attribs = standard_layout(&Format::complex([("a", FLOAT), ("b", VEC2)]), 5);
        let words: Vec<u32> = (0..24).collect();
        assert_eq!(gather(&attribs[0], &words), vec![0, 1, 2, 3, 12]);
        assert_eq!(gather(&attribs[1], &words), vec![4, 5, 6, 7, 8, 9, 10, 11, 16, 17]);
    }

    #[test]
    fn test_value_elements() {
        assert_eq!(Value::Float(vec![0.0; 6]).elements(VEC3).unwrap(), 2);
        assert!(Value::Float(vec![0.0; 5]).elements(VEC3).is_err());
        assert!(Value::Int(vec![1]).elements(FLOAT).is_err());
        assert_eq!(Value::Int(vec![1, 2]).elements(INT).unwrap(), 2);
    }

    #[test]
    fn test_value_words_round_trip() {
        let v = Value::Float(vec![1.5, -2.0]);
        assert_eq!(Value::from_words(Base::Float, v.words()), v);
        let v = Value::Int(vec![-1, 7]);
        assert_eq!(v.words(), vec![u32::MAX, 7]);
    }

    #[test]
    fn test_texel_layout() {
        assert_eq!(texel_layout(4, 1).bytes_per_row, None);
        assert_eq!(texel_layout(16, 4).bytes_per_row, Some(256));
    }

    #[test]
    fn test_representation_count() {
        let mut r = Representations::default();
        assert!(r.is_empty());
        r.host = Some(vec![0; 4]);
        assert!(r.holds(Representation::Host));
        assert!(!r.holds(Representation::Device));
        assert_eq!(r.count(), 1);
    }
}
