//! Resolved description of one capture program.
//!
//! A [`ProgramModel`] is built from a kernel's formats and its source
//! fragments. It lists the typed read functions the source needs, the identity
//! constants for out-of-range reads, the output registers each invocation
//! fills, and the rewritten user code. Primitives adjust the model (multiplier,
//! extra snippets, register layout) before it is rendered.

use std::collections::BTreeSet;

use crate::diagnostic::Diagnostic;
use crate::format::{Format, SimpleFormat};
use crate::span::Span;

use super::fragment::{self, SourceFragments};
use super::validate::parse_format_tag;

/// Key prefix of attributes bound through the second scope slot.
pub const SCOPE2_PREFIX: &str = "s_scope2";

/// Input binding slots, in attribute-table order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Read,
    Scope,
    Scope2,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Read, Slot::Scope, Slot::Scope2];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Slot::Read => "read",
            Slot::Scope => "scope",
            Slot::Scope2 => "scope2",
        }
    }
}

/// The formats one program is compiled against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Formats {
    pub read: Format,
    pub write: Format,
    pub scope: Format,
    pub scope2: Format,
}

impl Formats {
    pub fn new(read: Format, write: Format, scope: Format) -> Self {
        Self {
            read,
            write,
            scope,
            scope2: Format::Null,
        }
    }

    /// Bind `format` in the second scope slot, its keys prefixed with
    /// `s_scope2` so they never collide with user attributes.
    pub fn with_scope2(mut self, format: &Format) -> Self {
        if format.is_null() {
            self.scope2 = Format::Null;
            return self;
        }
        self.scope2 = Format::complex(
            format
                .fields()
                .into_iter()
                .map(|(key, f)| (scope2_key(key), f)),
        );
        self
    }

    pub fn slot(&self, slot: Slot) -> &Format {
        match slot {
            Slot::Read => &self.read,
            Slot::Scope => &self.scope,
            Slot::Scope2 => &self.scope2,
        }
    }

    /// Every readable attribute, in attribute-table order.
    pub fn inputs(&self) -> Vec<InputField> {
        Slot::ALL
            .iter()
            .flat_map(|&slot| {
                self.slot(slot)
                    .fields()
                    .into_iter()
                    .map(move |(key, format)| InputField {
                        slot,
                        key: key.map(str::to_string),
                        format,
                    })
            })
            .collect()
    }
}

/// `s_scope2` or `s_scope2_key`.
pub fn scope2_key(key: Option<&str>) -> String {
    match key {
        Some(k) => format!("{SCOPE2_PREFIX}_{k}"),
        None => SCOPE2_PREFIX.to_string(),
    }
}

/// `_key` or nothing, for generated identifiers.
pub fn suffix(key: Option<&str>) -> String {
    key.map(|k| format!("_{k}")).unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputField {
    pub slot: Slot,
    pub key: Option<String>,
    pub format: SimpleFormat,
}

impl InputField {
    /// Name of the attribute in the bound buffer.
    pub fn attribute_name(&self) -> Option<&str> {
        let key = self.key.as_deref();
        if self.slot != Slot::Scope2 {
            return key;
        }
        match key.and_then(|k| k.strip_prefix(SCOPE2_PREFIX)) {
            Some(rest) => rest.strip_prefix('_'),
            None => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub key: Option<String>,
    pub format: SimpleFormat,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadFunction {
    pub key: Option<String>,
    pub attrib_index: usize,
    pub slot: Slot,
    pub native: SimpleFormat,
    pub request: SimpleFormat,
    pub batch_size: u8,
}

impl ReadFunction {
    pub fn name(&self) -> String {
        read_function_name(self.key.as_deref(), self.request)
    }
}

pub fn read_function_name(key: Option<&str>, request: SimpleFormat) -> String {
    format!("glc_read{}_{}", suffix(key), request.wgsl())
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutRegister {
    pub key: Option<String>,
    pub format: SimpleFormat,
    /// Suffix of the `glc_out_` variable.
    pub name: String,
}

impl OutRegister {
    pub fn new(prefix: &str, key: Option<&str>, format: SimpleFormat, index: usize) -> Self {
        let key_part = key.map(|k| format!("{k}_")).unwrap_or_default();
        Self {
            key: key.map(str::to_string),
            format,
            name: format!("{prefix}{key_part}{index}"),
        }
    }

    pub fn var(&self) -> String {
        format!("glc_out_{}", self.name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteFunction {
    pub key: Option<String>,
    pub format: SimpleFormat,
}

/// How `glc_main` runs user code.
#[derive(Clone, Debug, PartialEq)]
pub struct Main {
    /// Statement per bank. `{i}` becomes the element index, `{k}` the bank
    /// number and `{c}` the matching vector component.
    pub call: String,
    pub before: String,
    pub after: String,
}

impl Main {
    pub fn render_call(&self, index: &str, bank: usize) -> String {
        self.call
            .replace("{i}", index)
            .replace("{k}", &bank.to_string())
            .replace("{c}", ["x", "y", "z", "w"][bank % 4])
    }
}

/// Which bindings a rendered program declares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Bindings {
    pub attribs: bool,
    pub samplers: [bool; 3],
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgramModel {
    pub inputs: Vec<InputField>,
    pub samplers: [bool; 3],
    pub identities: Vec<Identity>,
    pub read_functions: Vec<ReadFunction>,
    pub out_registers: Vec<OutRegister>,
    pub write_functions: Vec<WriteFunction>,
    pub write_batch_size: usize,
    pub user_code: String,
    pub helpers: String,
    pub main: Main,
    /// Logical elements consumed per invocation (4, 8 or 16).
    pub vertex_id_multiplier: u32,
    declared_identities: Vec<(Option<String>, String)>,
}

impl ProgramModel {
    /// Model for running `source` once per element, four elements per
    /// invocation.
    pub fn build(formats: &Formats, fragments: &SourceFragments, source: &str) -> ProgramModel {
        let entry = fragments
            .entrypoint()
            .and_then(|e| e.key())
            .unwrap_or("map");
        let mut model = ProgramModel {
            inputs: formats.inputs(),
            samplers: [false; 3],
            identities: Vec::new(),
            read_functions: Vec::new(),
            out_registers: standard_registers(&formats.write, 4),
            write_functions: formats
                .write
                .fields()
                .into_iter()
                .map(|(key, format)| WriteFunction {
                    key: key.map(str::to_string),
                    format,
                })
                .collect(),
            write_batch_size: fragments.write_batch_size(),
            user_code: String::new(),
            helpers: String::new(),
            main: Main {
                call: format!("{entry}({{i}});"),
                before: String::new(),
                after: String::new(),
            },
            vertex_id_multiplier: 4,
            declared_identities: fragments
                .identities
                .iter()
                .filter_map(|f| Some((f.key.clone(), f.args.first()?.clone())))
                .collect(),
        };
        model.user_code = model.rewrite(fragments, source);
        let declared: Vec<Option<String>> =
            model.declared_identities.iter().map(|(k, _)| k.clone()).collect();
        for key in declared {
            model.ensure_identity(key.as_deref());
        }
        model
    }

    /// Rewrite an internal snippet (written in kernel syntax) and register the
    /// read functions it uses.
    pub fn snippet(&mut self, code: &str) -> String {
        let (fragments, _) = fragment::extract(code);
        self.rewrite(&fragments, code)
    }

    pub fn bindings(&self) -> Bindings {
        Bindings {
            attribs: !self.read_functions.is_empty(),
            samplers: self.samplers,
        }
    }

    /// Output words per invocation for the given registers.
    pub fn stride(&self, captured: &[usize]) -> u32 {
        captured
            .iter()
            .map(|&r| self.out_registers[r].format.components as u32)
            .sum()
    }

    /// Split the output registers into groups that each carry at most `limit`
    /// words per invocation. Registers of one attribute always stay together.
    pub fn partition(&self, limit: u32) -> Result<Vec<Vec<usize>>, Diagnostic> {
        let mut fields: Vec<(Option<&str>, u32)> = Vec::new();
        for reg in &self.out_registers {
            let words = reg.format.components as u32;
            match fields.iter_mut().find(|(k, _)| *k == reg.key.as_deref()) {
                Some((_, total)) => *total += words,
                None => fields.push((reg.key.as_deref(), words)),
            }
        }
        if let Some((key, total)) = fields.iter().find(|(_, total)| *total > limit) {
            return Err(Diagnostic::error(
                format!(
                    "attribute \"{}\" needs {total} output components per invocation, \
                     more than the limit of {limit}",
                    key.unwrap_or("")
                ),
                Span::dummy(),
            ));
        }

        let mut order: Vec<usize> = (0..fields.len()).collect();
        order.sort_by(|&a, &b| fields[b].1.cmp(&fields[a].1));
        let mut bins: Vec<(u32, BTreeSet<Option<&str>>)> = Vec::new();
        for idx in order {
            let (key, total) = fields[idx];
            match bins.iter_mut().find(|(used, _)| used + total <= limit) {
                Some((used, keys)) => {
                    *used += total;
                    keys.insert(key);
                }
                None => bins.push((total, BTreeSet::from([key]))),
            }
        }

        Ok(bins
            .into_iter()
            .map(|(_, keys)| {
                (0..self.out_registers.len())
                    .filter(|&r| keys.contains(&self.out_registers[r].key.as_deref()))
                    .collect()
            })
            .collect())
    }

    /// Format of the attributes written by `captured` registers.
    pub fn captured_format(&self, write: &Format, captured: &[usize]) -> Format {
        let keys: Vec<Option<&str>> = captured
            .iter()
            .map(|&r| self.out_registers[r].key.as_deref())
            .collect();
        write.subformat(&keys)
    }

    fn rewrite(&mut self, fragments: &SourceFragments, source: &str) -> String {
        let mut edits: Vec<(Span, String)> = Vec::new();

        for id in &fragments.identities {
            edits.push((id.span, String::new()));
        }

        for read in &fragments.reads {
            let Some((attrib_index, field)) = self.input(read.key()) else {
                continue;
            };
            let native = field.format;
            let request = read
                .args
                .get(1)
                .and_then(|tag| parse_format_tag(tag))
                .unwrap_or(native);
            self.ensure_read(read.key(), attrib_index, request);
            edits.push((read.name_span, read_function_name(read.key(), request)));
            match read.args.len() {
                0 => {
                    let at = read.span.end - 1;
                    edits.push((Span::new(at, at), "0".to_string()));
                }
                2 => edits.push((
                    Span::new(read.arg_spans[0].end, read.arg_spans[1].end),
                    String::new(),
                )),
                _ => {}
            }
        }

        for write in &fragments.writes {
            edits.push((write.name_span, format!("glc_write{}", suffix(write.key()))));
        }

        apply_edits(source, edits)
    }

    fn input(&self, key: Option<&str>) -> Option<(usize, InputField)> {
        self.inputs
            .iter()
            .position(|f| f.key.as_deref() == key)
            .map(|i| (i, self.inputs[i].clone()))
    }

    fn ensure_read(&mut self, key: Option<&str>, attrib_index: usize, request: SimpleFormat) {
        let field = self.inputs[attrib_index].clone();
        self.samplers[field.slot.index()] = true;
        self.ensure_identity(key);
        let exists = self
            .read_functions
            .iter()
            .any(|r| r.key.as_deref() == key && r.request == request);
        if !exists {
            self.read_functions.push(ReadFunction {
                key: key.map(str::to_string),
                attrib_index,
                slot: field.slot,
                native: field.format,
                request,
                batch_size: request.components / field.format.components,
            });
        }
    }

    fn ensure_identity(&mut self, key: Option<&str>) {
        if self.identities.iter().any(|i| i.key.as_deref() == key) {
            return;
        }
        let Some((_, field)) = self.input(key) else {
            return;
        };
        let value = self
            .declared_identities
            .iter()
            .find(|(k, _)| k.as_deref() == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| field.format.zero());
        self.identities.push(Identity {
            key: key.map(str::to_string),
            format: field.format,
            value,
        });
    }
}

/// Four registers per attribute per group of four elements, ordered group,
/// attribute, element. This matches the interleaved buffer layout.
pub fn standard_registers(write: &Format, elements: usize) -> Vec<OutRegister> {
    let mut registers = Vec::new();
    for chunk in 0..elements.div_ceil(4) {
        for (key, format) in write.fields() {
            for e in 0..4 {
                registers.push(OutRegister::new("", key, format, chunk * 4 + e));
            }
        }
    }
    registers
}

/// Apply non-overlapping span replacements.
pub fn apply_edits(source: &str, mut edits: Vec<(Span, String)>) -> String {
    edits.sort_by_key(|(span, _)| (span.start, span.end));
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0usize;
    for (span, text) in edits {
        let range = span.range();
        if range.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..range.start]);
        out.push_str(&text);
        cursor = range.end;
    }
    out.push_str(&source[cursor..]);
    out
}
