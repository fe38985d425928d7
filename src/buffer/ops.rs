//! Structural operations on buffers: copying, joining, splitting and
//! relabelling attributes.
//!
//! Results never alias a consumed input's resources with the input still
//! holding them; consumed inputs are freed once their contents moved.

use std::collections::BTreeMap;

use super::layout::{self, size_buffer, standard_layout, Attribute};
use super::Buffer;
use crate::error::{Error, Result};
use crate::format::{Format, SimpleFormat};
use crate::gpu::Gpu;
use crate::kernel::{Bind, Kernel, Method};
use crate::range::range;

/// How [`Buffer::rename`] relabels attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rename {
    /// Put a simple buffer under a single key.
    Wrap(String),
    /// Pull one key out as a simple buffer.
    Unwrap(String),
    /// Rename keys, old to new. Keys not listed are dropped.
    Keys(BTreeMap<String, String>),
}

const SPLIT_SCALAR: &str = "fn map(i: i32) { let v = read(i, f_vec4u); write(v.x, v.y, v.z, v.w); }";
const SPLIT_PAIR: &str = "fn map(i: i32) { let v = read(i, f_vec4u); write(v.xy, v.zw); }";
const SPLIT_WIDE: &str = "fn map(i: i32) { write(read(i)); }";

impl Buffer {
    /// A buffer with the same contents. A consumed buffer hands its
    /// representations over instead and is left freed.
    pub async fn copy(&self) -> Result<Buffer> {
        if self.is_consumed() {
            return Ok(self.take());
        }
        let source = self.device()?;
        let target = self.gpu.storage_buffer(self.byte_length())?;
        let mut encoder = self.encoder("glc copy");
        encoder.copy_buffer_to_buffer(&source, 0, &target, 0, self.byte_length());
        self.gpu.queue().submit(Some(encoder.finish()));
        Ok(Buffer::from_device(
            &self.gpu,
            self.format.clone(),
            self.attribs(),
            self.byte_length(),
            target,
        ))
    }

    /// Elements of `parts` one after the other. All parts share a format and
    /// each must have a well-defined length.
    pub async fn concat(parts: &[&Buffer]) -> Result<Buffer> {
        let Some(first) = parts.first() else {
            return Err(Error::FormatMismatch("nothing to concatenate".to_string()));
        };
        for (index, part) in parts.iter().enumerate() {
            if part.length().is_none() {
                return Err(Error::UnequalLengths {
                    index,
                    found: layout::describe_counts(&part.attribs()),
                });
            }
            if part.format != first.format {
                return Err(Error::FormatMismatch(format!(
                    "cannot concatenate {} with {}",
                    part.format, first.format
                )));
            }
        }

        match &first.format {
            Format::Complex(fields) => {
                let mut columns: BTreeMap<String, Vec<Buffer>> = BTreeMap::new();
                for part in parts {
                    for (key, column) in part.split().await? {
                        columns.entry(key).or_default().push(column);
                    }
                }
                let mut joined = Vec::with_capacity(fields.len());
                for (key, column) in columns {
                    let refs: Vec<&Buffer> = column.iter().collect();
                    joined.push((key, concat_simple(&first.gpu, &refs)?));
                }
                let named: Vec<(Option<&str>, &Buffer)> =
                    joined.iter().map(|(k, b)| (Some(k.as_str()), b)).collect();
                Buffer::merge(&named)
            }
            _ => concat_simple(&first.gpu, parts),
        }
    }

    /// Attributes of several buffers side by side in one resource. Simple
    /// parts need a name; complex parts keep theirs. A key present in more
    /// than one part takes the later part's attribute.
    pub fn merge(parts: &[(Option<&str>, &Buffer)]) -> Result<Buffer> {
        let Some((_, first)) = parts.first() else {
            return Err(Error::FormatMismatch("nothing to merge".to_string()));
        };
        let gpu = first.gpu.clone();
        let total: u64 = parts.iter().map(|(_, b)| b.byte_length()).sum();
        let size = total.max(layout::MIN_BYTES).next_power_of_two();

        let mut fields: BTreeMap<String, SimpleFormat> = BTreeMap::new();
        let mut attribs: BTreeMap<String, Attribute> = BTreeMap::new();
        let mut sources = Vec::with_capacity(parts.len());
        let mut cursor = 0u64;
        for (name, part) in parts {
            for mut a in part.attribs() {
                let key = match (&part.format, name) {
                    (Format::Simple(_), Some(name)) => name.to_string(),
                    (Format::Complex(_), _) => a.name.clone().unwrap_or_default(),
                    _ => {
                        return Err(Error::FormatMismatch(format!(
                            "cannot merge an unnamed {} buffer",
                            part.format
                        )))
                    }
                };
                a.name = Some(key.clone());
                a.offset += (cursor / 4) as u32;
                fields.insert(key.clone(), a.format);
                attribs.insert(key, a);
            }
            sources.push((part.device()?, cursor, part.byte_length()));
            cursor += part.byte_length();
        }

        let target = gpu.storage_buffer(size)?;
        let mut encoder = gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc merge"),
            });
        for (source, at, bytes) in &sources {
            encoder.copy_buffer_to_buffer(source, 0, &target, *at, *bytes);
        }
        gpu.queue().submit(Some(encoder.finish()));
        drop(sources);

        for (_, part) in parts {
            if part.is_consumed() {
                part.free();
            }
        }
        Ok(Buffer::from_device(
            &gpu,
            Format::Complex(fields),
            attribs.into_values().collect(),
            size,
            target,
        ))
    }

    /// A copy with relabelled attributes.
    pub async fn rename(&self, how: Rename) -> Result<Buffer> {
        let (format, attribs) = self.relabel(&how)?;
        let mut renamed = self.copy().await?;
        renamed.set_format(format);
        renamed.set_attribs(attribs);
        Ok(renamed)
    }

    /// This simple buffer viewed as a single-key complex one, sharing its
    /// resources.
    pub(crate) fn wrapped(&self, name: &str) -> Result<Buffer> {
        let (format, attribs) = self.relabel(&Rename::Wrap(name.to_string()))?;
        Ok(self.alias(format, attribs))
    }

    fn relabel(&self, how: &Rename) -> Result<(Format, Vec<Attribute>)> {
        let attribs = self.attribs();
        match (how, &self.format) {
            (Rename::Wrap(name), Format::Simple(f)) => {
                let attribs = attribs
                    .into_iter()
                    .map(|mut a| {
                        a.name = Some(name.clone());
                        a
                    })
                    .collect();
                Ok((Format::complex([(name.as_str(), *f)]), attribs))
            }
            (Rename::Unwrap(key), Format::Complex(fields)) => {
                let (Some(f), Some(mut a)) = (
                    fields.get(key),
                    attribs.into_iter().find(|a| a.name.as_deref() == Some(key)),
                ) else {
                    return Err(Error::FormatMismatch(format!(
                        "format {} has no attribute \"{key}\"",
                        self.format
                    )));
                };
                a.name = None;
                Ok((Format::Simple(*f), vec![a]))
            }
            (Rename::Keys(map), Format::Complex(_)) => {
                let mut fields = BTreeMap::new();
                let mut kept = Vec::new();
                for mut a in attribs {
                    let Some(to) = a.name.as_ref().and_then(|n| map.get(n)) else {
                        continue;
                    };
                    a.name = Some(to.clone());
                    fields.insert(to.clone(), a.format);
                    kept.push(a);
                }
                kept.sort_by(|x, y| x.name.cmp(&y.name));
                Ok((Format::Complex(fields), kept))
            }
            (how, format) => Err(Error::FormatMismatch(format!("cannot apply {how:?} to a {format} buffer"))),
        }
    }

    /// Elements `start..end`. A negative `end` counts back from the longest
    /// attribute, `None` means up to it. Starts on a group boundary reuse the
    /// resource with shifted offsets; other starts copy.
    pub async fn slice(&self, start: u32, end: Option<i64>) -> Result<Buffer> {
        let max = self.attribs().iter().map(|a| a.count).max().unwrap_or(0);
        let end = match end {
            None => max,
            Some(e) if e < 0 => (max as i64 + e).max(0) as u32,
            Some(e) => (e as u64).min(max as u64) as u32,
        };
        let start = start.min(end);

        if start % 4 == 0 {
            let attribs: Vec<Attribute> = self
                .attribs()
                .into_iter()
                .map(|mut a| {
                    a.offset += (start / 4) * a.repeat;
                    a.count = a.count.min(end).saturating_sub(start);
                    a
                })
                .collect();
            let sliced = self.copy().await?;
            sliced.set_attribs(attribs);
            return Ok(sliced);
        }

        if !self.format.is_complex() {
            let sliced = slice_simple(self, start, end)?;
            if self.is_consumed() {
                self.free();
            }
            return Ok(sliced);
        }
        let columns = self.split().await?;
        let mut sliced = Vec::with_capacity(columns.len());
        for (key, column) in &columns {
            sliced.push((key.as_str(), slice_simple(column, start, end)?));
        }
        let named: Vec<(Option<&str>, &Buffer)> = sliced.iter().map(|(k, b)| (Some(*k), b)).collect();
        Buffer::merge(&named)
    }

    /// One simple buffer per attribute, in standard layout.
    pub async fn split(&self) -> Result<BTreeMap<String, Buffer>> {
        let mut out = BTreeMap::new();
        for attrib in self.attribs() {
            let Some(name) = attrib.name.clone() else {
                continue;
            };
            let native = attrib.format;
            let raw = native.as_uint();
            let view = self.alias(
                Format::Simple(raw),
                vec![Attribute {
                    name: None,
                    format: raw,
                    ..attrib.clone()
                }],
            );
            let source = match native.components {
                1 => SPLIT_SCALAR,
                2 => SPLIT_PAIR,
                _ => SPLIT_WIDE,
            };
            let kernel = Kernel::new(
                self.gpu.compiler(),
                raw.into(),
                raw.into(),
                Format::Null,
                source,
            )?;
            let mut column = kernel
                .invoke(&self.gpu, &range(attrib.count as usize), Method::Map, Bind::read(&view), &[])
                .await?
                .result;
            column.set_format(native.into());
            column.set_attribs(standard_layout(&native.into(), attrib.count));
            out.insert(name, column);
        }
        if self.is_consumed() {
            self.free();
        }
        Ok(out)
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }
}

/// Join simple buffers on the device. Consumed parts are freed.
fn concat_simple(gpu: &Gpu, parts: &[&Buffer]) -> Result<Buffer> {
    let format = parts.first().map(|p| p.format.clone()).unwrap_or_default();
    let components = format.components();
    let total: u32 = parts.iter().filter_map(|p| p.length()).sum();
    let size = size_buffer(&format, total);
    let target = gpu.storage_buffer(size)?;
    let mut encoder = gpu
        .device()
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("glc concat"),
        });
    let mut cursor = 0u32;
    for part in parts {
        let Some(attrib) = part.attribs().into_iter().next() else {
            continue;
        };
        let source = part.device()?;
        copy_elements(&mut encoder, &attrib, 0, attrib.count, &source, &target, cursor * components);
        cursor += attrib.count;
    }
    gpu.queue().submit(Some(encoder.finish()));
    for part in parts {
        if part.is_consumed() {
            part.free();
        }
    }
    Ok(Buffer::from_device(
        gpu,
        format.clone(),
        standard_layout(&format, total),
        size,
        target,
    ))
}

/// Copy of elements `start..end` of a simple buffer.
fn slice_simple(buffer: &Buffer, start: u32, end: u32) -> Result<Buffer> {
    let count = end.saturating_sub(start);
    let format = buffer.format.clone();
    let size = size_buffer(&format, count);
    let target = buffer.gpu.storage_buffer(size)?;
    let mut encoder = buffer.encoder("glc slice");
    if let Some(attrib) = buffer.attribs().into_iter().next() {
        let available = attrib.count.min(end).saturating_sub(start);
        let source = buffer.device()?;
        copy_elements(&mut encoder, &attrib, start, available, &source, &target, 0);
    }
    buffer.gpu.queue().submit(Some(encoder.finish()));
    Ok(Buffer::from_device(
        &buffer.gpu,
        format.clone(),
        standard_layout(&format, count),
        size,
        target,
    ))
}

/// Encode copies of `count` elements of `attrib` from element `first` into
/// `target` at word `at`, packed back to back.
fn copy_elements(
    encoder: &mut wgpu::CommandEncoder,
    attrib: &Attribute,
    first: u32,
    count: u32,
    source: &wgpu::Buffer,
    target: &wgpu::Buffer,
    at: u32,
) {
    for (from, words, to) in element_runs(attrib, first, count, at) {
        encoder.copy_buffer_to_buffer(source, from as u64 * 4, target, to as u64 * 4, words as u64 * 4);
    }
}

/// `(source word, words, target word)` of each contiguous run.
fn element_runs(attrib: &Attribute, first: u32, count: u32, at: u32) -> Vec<(u32, u32, u32)> {
    let c = attrib.format.components as u32;
    let packed = attrib.repeat == 4 * c;
    let mut runs = Vec::new();
    let mut e = first;
    let mut to = at;
    while e < first + count {
        let left = first + count - e;
        let run = if packed { left } else { left.min(4 - e % 4) };
        runs.push((attrib.index(e), run * c, to));
        e += run;
        to += run * c;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FLOAT, INT, VEC3};

    #[test]
    fn test_packed_runs_coalesce() {
        let attrib = standard_layout(&VEC3.into(), 10).remove(0);
        assert_eq!(element_runs(&attrib, 0, 10, 0), vec![(0, 30, 0)]);
        assert_eq!(element_runs(&attrib, 3, 2, 6), vec![(9, 6, 6)]);
    }

    #[test]
    fn test_interleaved_runs_per_group() {
        let format = Format::complex([("a", FLOAT), ("b", INT)]);
        let b = standard_layout(&format, 9).remove(1);
        assert_eq!(b.repeat, 8);
        assert_eq!(
            element_runs(&b, 2, 7, 0),
            vec![(4 + 2, 2, 0), (8 + 4, 4, 2), (16 + 4, 1, 6)]
        );
    }

    #[test]
    fn test_empty_runs() {
        let attrib = standard_layout(&FLOAT.into(), 0).remove(0);
        assert!(element_runs(&attrib, 0, 0, 0).is_empty());
    }
}
