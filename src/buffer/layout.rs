//! Interleaved attribute layout and resource sizing.
//!
//! All offsets are in 32-bit words. Elements are stored in groups of four per
//! attribute, so element `e` of an attribute lives at
//! `(e / 4) * repeat + offset + (e % 4) * components`.

use crate::format::{Format, SimpleFormat};

/// Bytes per texel of the `Rgba32Uint` texture representation.
pub const TEXEL_BYTES: u64 = 16;

/// Smallest pooled resource, in bytes.
pub const MIN_BYTES: u64 = 16;

/// One named sub-field of an interleaved buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub name: Option<String>,
    pub format: SimpleFormat,
    /// Word offset of element 0.
    pub offset: u32,
    /// Words between consecutive groups of four elements.
    pub repeat: u32,
    /// Populated element count.
    pub count: u32,
}

impl Attribute {
    /// Word index of element `e`.
    pub fn index(&self, e: u32) -> u32 {
        (e / 4) * self.repeat + self.offset + (e % 4) * self.format.components as u32
    }

    /// Word range covered by element `e`.
    pub fn words(&self, e: u32) -> std::ops::Range<usize> {
        let start = self.index(e) as usize;
        start..start + self.format.components as usize
    }
}

/// Attributes of `format` packed in canonical key order.
pub fn standard_layout(format: &Format, count: u32) -> Vec<Attribute> {
    let repeat = format.components() * 4;
    let mut offset = 0;
    format
        .fields()
        .into_iter()
        .map(|(name, f)| {
            let attrib = Attribute {
                name: name.map(str::to_string),
                format: f,
                offset,
                repeat,
                count,
            };
            offset += f.components as u32 * 4;
            attrib
        })
        .collect()
}

/// Element count shared by all attributes, `None` when they differ.
pub fn common_count(attribs: &[Attribute]) -> Option<u32> {
    let first = attribs.first().map_or(0, |a| a.count);
    attribs.iter().all(|a| a.count == first).then_some(first)
}

/// Human-readable `name:count` list, for errors.
pub fn describe_counts(attribs: &[Attribute]) -> String {
    attribs
        .iter()
        .map(|a| format!("{}:{}", a.name.as_deref().unwrap_or("_"), a.count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Byte size of the pooled resource holding `count` elements of `format`.
pub fn size_buffer(format: &Format, count: u32) -> u64 {
    let words = count.div_ceil(4) as u64 * 4 * format.components() as u64;
    (words.max(1).next_power_of_two() * 4).max(MIN_BYTES)
}

/// Width and height of a texture with `pixels` texels. Rows are at least 16
/// texels wide once there is more than one, which keeps copies 256-byte
/// aligned.
pub fn texture_dimensions(pixels: u32) -> (u32, u32) {
    if pixels <= 16 {
        return (pixels.max(1), 1);
    }
    let root = (pixels as f64).sqrt().ceil() as u32;
    let width = root.next_power_of_two().max(16);
    (width, pixels.div_ceil(width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FLOAT, INT, VEC2, VEC3};

    #[test]
    fn test_standard_layout() {
        let format = Format::complex([("pos", VEC3), ("id", INT)]);
        let attribs = standard_layout(&format, 10);
        assert_eq!(attribs[0].name.as_deref(), Some("id"));
        assert_eq!(attribs[0].offset, 0);
        assert_eq!(attribs[1].offset, 4);
        assert!(attribs.iter().all(|a| a.repeat == 16));
        // id: element 5 is in the second group, second slot
        assert_eq!(attribs[0].index(5), 16 + 1);
        // pos: element 6 is in the second group, third slot
        assert_eq!(attribs[1].index(6), 16 + 4 + 6);
        assert_eq!(attribs[1].words(0), 4..7);
    }

    #[test]
    fn test_simple_layout() {
        let attribs = standard_layout(&VEC2.into(), 3);
        assert_eq!(attribs.len(), 1);
        assert_eq!(attribs[0].name, None);
        assert_eq!(attribs[0].repeat, 8);
        assert_eq!(attribs[0].index(3), 6);
        assert!(standard_layout(&Format::Null, 3).is_empty());
    }

    #[test]
    fn test_size_buffer() {
        assert_eq!(size_buffer(&FLOAT.into(), 0), 16);
        assert_eq!(size_buffer(&FLOAT.into(), 1), 16);
        assert_eq!(size_buffer(&FLOAT.into(), 5), 32);
        assert_eq!(size_buffer(&FLOAT.into(), 37), 256);
        assert_eq!(size_buffer(&VEC3.into(), 4), 64);
        assert_eq!(size_buffer(&Format::Null, 100), 16);
    }

    #[test]
    fn test_texture_dimensions() {
        assert_eq!(texture_dimensions(1), (1, 1));
        assert_eq!(texture_dimensions(16), (16, 1));
        assert_eq!(texture_dimensions(32), (16, 2));
        assert_eq!(texture_dimensions(1024), (32, 32));
        assert_eq!(texture_dimensions(2048), (64, 32));
    }

    #[test]
    fn test_common_count() {
        let mut attribs = standard_layout(&Format::complex([("a", FLOAT), ("b", INT)]), 4);
        assert_eq!(common_count(&attribs), Some(4));
        attribs[1].count = 3;
        assert_eq!(common_count(&attribs), None);
        assert_eq!(describe_counts(&attribs), "a:4, b:3");
        assert_eq!(common_count(&[]), Some(0));
    }
}
