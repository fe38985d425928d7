//! Authoring rules for kernel source.
//!
//! Every violation becomes a [`Diagnostic`] with the span of the offending
//! fragment. Kernel construction fails if any of them is an error.

use crate::diagnostic::Diagnostic;
use crate::format::{Format, SimpleFormat, INT};
use crate::span::Span;

use super::fragment::{SourceFragment, SourceFragments};
use super::model::Formats;
use super::Method;

/// Largest write format, in components.
pub const MAX_WRITE_COMPONENTS: u32 = 16;

pub fn validate(formats: &Formats, fragments: &SourceFragments) -> Vec<Diagnostic> {
    let mut v = Validator {
        formats,
        fragments,
        diagnostics: Vec::new(),
    };
    if let Some(method) = v.entrypoint() {
        v.formats_for(method);
        v.keys_unique();
        v.identities();
        v.reads();
        v.writes(method);
    }
    v.diagnostics
}

/// Parse a read format tag such as `f_vec4i`.
pub fn parse_format_tag(tag: &str) -> Option<SimpleFormat> {
    SimpleFormat::from_wgsl(tag.trim().strip_prefix("f_")?)
}

struct Validator<'a> {
    formats: &'a Formats,
    fragments: &'a SourceFragments,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Validator<'a> {
    fn error(&mut self, message: String, span: Span) {
        self.diagnostics.push(Diagnostic::error(message, span));
    }

    fn error_with_help(&mut self, message: String, span: Span, help: &str) {
        self.diagnostics
            .push(Diagnostic::error(message, span).with_help(help.to_string()));
    }

    /// Exactly one entrypoint, with a whitelisted signature and no return type.
    fn entrypoint(&mut self) -> Option<Method> {
        let fragments: &'a SourceFragments = self.fragments;
        let entrypoints = &fragments.entrypoints;
        let names = Method::ALL.map(|m| m.name()).join(", ");
        let Some(ep) = entrypoints.first() else {
            self.error(
                format!("expected to find exactly 1 of {names}. Found none"),
                Span::dummy(),
            );
            return None;
        };
        if entrypoints.len() > 1 {
            let found: Vec<&str> = entrypoints.iter().filter_map(|e| e.key()).collect();
            self.error(
                format!("expected to find exactly 1 of {names}. Found {}", found.join(", ")),
                entrypoints[1].span,
            );
        }

        let Some(method) = ep.key().and_then(|k| k.parse::<Method>().ok()) else {
            self.error_with_help(
                "\"filter\" is a reserved word".to_string(),
                ep.name_span,
                "name the entrypoint \"filtro\"",
            );
            return None;
        };

        if let Some(ty) = &ep.ty {
            self.error_with_help(
                format!("expected no return type, found \"{ty}\""),
                ep.span,
                "entrypoints hand back results through write(...)",
            );
        }

        let found: Vec<&str> = ep
            .args
            .iter()
            .map(|a| a.split_once(':').map_or("", |(_, ty)| ty.trim()))
            .collect();
        let valid = method
            .signatures()
            .iter()
            .any(|sig| sig.len() == found.len() && sig.iter().zip(&found).all(|(e, f)| e == f));
        if !valid {
            let expected = method
                .signatures()
                .iter()
                .map(|sig| format!("\"({})\"", sig.join(", ")))
                .collect::<Vec<_>>()
                .join(" or ");
            self.error(
                format!(
                    "expected parameter types {expected}. Found \"({})\"",
                    found.join(", ")
                ),
                ep.span,
            );
        }
        Some(method)
    }

    fn formats_for(&mut self, method: Method) {
        let formats: &'a Formats = self.formats;
        let span = self.entry_span();
        if matches!(method, Method::Filtro | Method::Group | Method::Sort)
            && formats.write != Format::Simple(INT)
        {
            self.error(
                format!("write format for \"{method}\" must be i32, got {}", formats.write),
                span,
            );
        }
        if matches!(method, Method::Reduce | Method::Scan) && formats.read != formats.write {
            self.error(
                format!(
                    "read and write format must match for \"{method}\", got {} and {}",
                    formats.read, formats.write
                ),
                span,
            );
        }
        if formats.scope.is_simple() {
            self.error_with_help(
                format!("scope format must be null or named fields, got {}", formats.scope),
                Span::dummy(),
                "wrap the value in a field, e.g. \"offset:f32\"",
            );
        }
        let components = formats.write.components();
        if components > MAX_WRITE_COMPONENTS {
            self.error(
                format!(
                    "too many components in write format ({components} > {MAX_WRITE_COMPONENTS})"
                ),
                Span::dummy(),
            );
        }
        if formats.write.is_null() {
            self.error("write format must not be null".to_string(), Span::dummy());
        }
    }

    fn keys_unique(&mut self) {
        let mut seen: Vec<Option<String>> = Vec::new();
        for field in self.formats.inputs() {
            if seen.contains(&field.key) {
                let name = field.key.clone().unwrap_or_default();
                self.error(
                    format!("key conflict between read and scope format on \"{name}\""),
                    Span::dummy(),
                );
            }
            seen.push(field.key);
        }
    }

    fn identities(&mut self) {
        let fragments: &'a SourceFragments = self.fragments;
        let inputs = self.formats.inputs();
        for id in &fragments.identities {
            if id.qualifier.as_deref() != Some("const") {
                let found = id
                    .qualifier
                    .as_ref()
                    .map_or("no qualifier".to_string(), |q| format!("\"{q}\""));
                self.error(
                    format!("expected qualifier to be \"const\", but found {found}"),
                    id.name_span,
                );
            }
            if id.args.is_empty() {
                self.error("identity declaration needs a value".to_string(), id.span);
            }
            match inputs.iter().find(|f| f.key.as_deref() == id.key()) {
                Some(field) => {
                    if let Some(ty) = &id.ty {
                        if SimpleFormat::from_wgsl(ty) != Some(field.format) {
                            self.error(
                                format!(
                                    "identity is declared as {ty}, but the attribute is {}",
                                    field.format
                                ),
                                id.span,
                            );
                        }
                    }
                }
                None => self.diagnostics.push(Diagnostic::warning(
                    "identity does not match any read or scope attribute".to_string(),
                    id.name_span,
                )),
            }
        }
    }

    fn reads(&mut self) {
        let fragments: &'a SourceFragments = self.fragments;
        let inputs = self.formats.inputs();
        for read in &fragments.reads {
            let Some(field) = inputs.iter().find(|f| f.key.as_deref() == read.key()) else {
                let reason = missing_reason(read, !inputs.is_empty(), "read");
                self.error(format!("cannot read. {reason}"), read.span);
                continue;
            };
            if read.args.len() > 2 {
                self.error(
                    format!("read takes at most 2 arguments, found {}", read.args.len()),
                    read.span,
                );
                continue;
            }
            let native = field.format;
            let request = match read.args.get(1) {
                None => native,
                Some(tag) => match parse_format_tag(tag) {
                    Some(f) => f,
                    None => {
                        self.error_with_help(
                            format!("unknown format tag \"{tag}\""),
                            read.arg_spans[1],
                            "tags name a WGSL type, e.g. f_vec4f or f_vec2i",
                        );
                        continue;
                    }
                },
            };
            let batch = request.components / native.components;
            let exact = request.components % native.components == 0;
            if native.base != request.base || !exact || ![1, 2, 4].contains(&batch) {
                self.error(
                    format!("cannot read {native} as {request}, the formats are incompatible"),
                    read.span,
                );
            }
        }
    }

    fn writes(&mut self, method: Method) {
        let fragments: &'a SourceFragments = self.fragments;
        let Some(first) = fragments.writes.first() else {
            self.error("must write something".to_string(), self.entry_span());
            return;
        };
        let batch = first.args.len();
        if matches!(method, Method::Reduce | Method::Sort) && batch > 1 {
            self.error(format!("write batch size must be \"1\" for {method}"), first.span);
        }
        if ![1, 2, 4].contains(&batch) {
            self.error(
                format!("expected write batch size to be 1, 2 or 4. Got {batch}"),
                first.span,
            );
        }
        for w in &fragments.writes[1..] {
            if w.args.len() != batch {
                self.error(
                    format!(
                        "write batch size must be consistent. Found \"{batch}\" and \"{}\"",
                        w.args.len()
                    ),
                    w.span,
                );
            }
        }

        let fields = self.formats.write.fields();
        for w in &fragments.writes {
            if !fields.iter().any(|(k, _)| *k == w.key()) {
                let reason = missing_reason(w, !fields.is_empty(), "write");
                self.error(format!("cannot write. {reason}"), w.span);
            }
        }
        let missing: Vec<String> = fields
            .iter()
            .filter(|(k, _)| !fragments.writes.iter().any(|w| w.key() == *k))
            .map(|(k, _)| format!("\"{}\"", k.unwrap_or("")))
            .collect();
        if !missing.is_empty() {
            self.error(
                format!(
                    "must write something to all keys in write format. {} missing",
                    missing.join(", ")
                ),
                self.entry_span(),
            );
        }
    }

    fn entry_span(&self) -> Span {
        self.fragments
            .entrypoint()
            .map_or(Span::dummy(), |e| e.span)
    }
}

fn missing_reason(frag: &SourceFragment, has_fields: bool, kind: &str) -> String {
    match frag.key() {
        Some(key) => format!("\"{key}\" is missing from the {kind} format"),
        None if has_fields => "format is complex, key is required".to_string(),
        None => "format was not provided".to_string(),
    }
}
