//! Numeric layouts of buffer elements.
//!
//! A [`SimpleFormat`] is one of `f32`, `i32`, `u32` with 1 to 4 components. A
//! [`Format`] is either empty, simple, or a complex mapping from attribute
//! name to simple format. Complex keys are always visited in sorted order since
//! interleaved byte offsets are derived from that order.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Base {
    Float,
    Int,
    Uint,
}

impl Base {
    /// WGSL scalar type name.
    pub fn scalar(&self) -> &'static str {
        match self {
            Base::Float => "f32",
            Base::Int => "i32",
            Base::Uint => "u32",
        }
    }

    fn suffix(&self) -> char {
        match self {
            Base::Float => 'f',
            Base::Int => 'i',
            Base::Uint => 'u',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimpleFormat {
    pub base: Base,
    pub components: u8,
}

pub const FLOAT: SimpleFormat = SimpleFormat { base: Base::Float, components: 1 };
pub const VEC2: SimpleFormat = SimpleFormat { base: Base::Float, components: 2 };
pub const VEC3: SimpleFormat = SimpleFormat { base: Base::Float, components: 3 };
pub const VEC4: SimpleFormat = SimpleFormat { base: Base::Float, components: 4 };
pub const INT: SimpleFormat = SimpleFormat { base: Base::Int, components: 1 };
pub const IVEC2: SimpleFormat = SimpleFormat { base: Base::Int, components: 2 };
pub const IVEC3: SimpleFormat = SimpleFormat { base: Base::Int, components: 3 };
pub const IVEC4: SimpleFormat = SimpleFormat { base: Base::Int, components: 4 };
pub const UINT: SimpleFormat = SimpleFormat { base: Base::Uint, components: 1 };
pub const UVEC2: SimpleFormat = SimpleFormat { base: Base::Uint, components: 2 };
pub const UVEC3: SimpleFormat = SimpleFormat { base: Base::Uint, components: 3 };
pub const UVEC4: SimpleFormat = SimpleFormat { base: Base::Uint, components: 4 };

impl SimpleFormat {
    pub const fn new(base: Base, components: u8) -> Option<Self> {
        match components {
            1..=4 => Some(Self { base, components }),
            _ => None,
        }
    }

    /// WGSL type name, using the predeclared aliases (`vec2f`, `vec4i`, ...).
    pub fn wgsl(&self) -> String {
        match self.components {
            1 => self.base.scalar().to_string(),
            n => format!("vec{}{}", n, self.base.suffix()),
        }
    }

    /// Parse a WGSL type name, either an alias (`vec3u`) or the long
    /// spelling (`vec3<u32>`).
    pub fn from_wgsl(name: &str) -> Option<Self> {
        let name = name.trim();
        let base_of = |s: &str| match s {
            "f32" | "f" => Some(Base::Float),
            "i32" | "i" => Some(Base::Int),
            "u32" | "u" => Some(Base::Uint),
            _ => None,
        };
        if let Some(base) = base_of(name).filter(|_| name.len() == 3) {
            return Self::new(base, 1);
        }
        let rest = name.strip_prefix("vec")?;
        let components = rest.chars().next()?.to_digit(10)? as u8;
        let tail = &rest[1..];
        let base = match tail.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            Some(inner) if inner.trim().len() == 3 => base_of(inner.trim())?,
            Some(_) => return None,
            None if tail.len() == 1 => base_of(tail)?,
            None => return None,
        };
        Self::new(base, components)
    }

    pub fn with_components(self, components: u8) -> Option<Self> {
        Self::new(self.base, components)
    }

    /// Same component count, reinterpreted as `u32` words.
    pub fn as_uint(self) -> Self {
        Self {
            base: Base::Uint,
            components: self.components,
        }
    }

    /// WGSL zero-value constructor, e.g. `vec2f()`.
    pub fn zero(&self) -> String {
        format!("{}()", self.wgsl())
    }
}

impl fmt::Display for SimpleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wgsl())
    }
}

/// Layout of one buffer element.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    #[default]
    Null,
    Simple(SimpleFormat),
    Complex(BTreeMap<String, SimpleFormat>),
}

impl From<SimpleFormat> for Format {
    fn from(f: SimpleFormat) -> Self {
        Format::Simple(f)
    }
}

impl Format {
    /// Build a complex format from `(name, format)` pairs.
    pub fn complex<I, K>(fields: I) -> Format
    where
        I: IntoIterator<Item = (K, SimpleFormat)>,
        K: Into<String>,
    {
        Format::Complex(fields.into_iter().map(|(k, f)| (k.into(), f)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Format::Null)
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, Format::Simple(_))
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Format::Complex(_))
    }

    /// Fields in canonical order; simple formats yield one unnamed field.
    pub fn fields(&self) -> Vec<(Option<&str>, SimpleFormat)> {
        match self {
            Format::Null => Vec::new(),
            Format::Simple(f) => vec![(None, *f)],
            Format::Complex(map) => map.iter().map(|(k, f)| (Some(k.as_str()), *f)).collect(),
        }
    }

    /// Total component count across all fields.
    pub fn components(&self) -> u32 {
        self.fields().iter().map(|(_, f)| f.components as u32).sum()
    }

    /// Look up a field. Simple formats answer the unnamed key only.
    pub fn get(&self, key: Option<&str>) -> Option<SimpleFormat> {
        match (self, key) {
            (Format::Simple(f), None) => Some(*f),
            (Format::Complex(map), Some(k)) => map.get(k).copied(),
            _ => None,
        }
    }

    /// The format restricted to `keys`, keeping its shape.
    pub fn subformat(&self, keys: &[Option<&str>]) -> Format {
        match self {
            Format::Complex(map) => Format::Complex(
                map.iter()
                    .filter(|(k, _)| keys.contains(&Some(k.as_str())))
                    .map(|(k, f)| (k.clone(), *f))
                    .collect(),
            ),
            Format::Simple(f) if keys.contains(&None) => Format::Simple(*f),
            _ => Format::Null,
        }
    }
}

/// Structural comparison of a bound buffer's format against a declared one.
/// A missing buffer only matches the null format.
pub fn formats_match(bound: Option<&Format>, declared: &Format) -> bool {
    match bound {
        None | Some(Format::Null) => declared.is_null(),
        Some(f) => f == declared,
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Null => f.write_str("null"),
            Format::Simple(s) => write!(f, "{s}"),
            Format::Complex(map) => {
                let fields: Vec<String> = map.iter().map(|(k, s)| format!("{k}:{s}")).collect();
                f.write_str(&fields.join(","))
            }
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    /// Parses `null`, a WGSL type (`vec3f`) or named fields (`pos:vec3f,id:i32`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}').trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Format::Null);
        }
        if !trimmed.contains(':') {
            return SimpleFormat::from_wgsl(trimmed)
                .map(Format::Simple)
                .ok_or_else(|| Error::InvalidFormat(s.to_string()));
        }
        let mut map = BTreeMap::new();
        for field in trimmed.split(',') {
            let (name, ty) = field
                .split_once(':')
                .ok_or_else(|| Error::InvalidFormat(s.to_string()))?;
            let name = name.trim();
            let valid_name = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            let format = SimpleFormat::from_wgsl(ty).filter(|_| valid_name);
            match format {
                Some(f) if !map.contains_key(name) => {
                    map.insert(name.to_string(), f);
                }
                _ => return Err(Error::InvalidFormat(s.to_string())),
            }
        }
        Ok(Format::Complex(map))
    }
}
