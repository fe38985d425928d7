//! Kernels: small WGSL entrypoints compiled into GPU passes.
//!
//! A [`Kernel`] is built from a read, write and scope format plus source
//! text holding exactly one entrypoint (`map`, `filtro`, `reduce`, `scan`,
//! `group` or `sort`). Construction extracts and validates the source, then
//! hands it to the primitive named by the entrypoint, which produces one or
//! more [`Program`]s and, for the scatter primitives, helper kernels of its
//! own. Dispatch goes through [`Kernel::invoke`], usually via
//! [`Range`](crate::range::Range).

pub mod compile;
pub mod filtro;
pub mod fragment;
pub mod group;
pub mod lexer;
pub mod map;
pub mod model;
pub mod reduce;
pub mod scan;
pub mod sort;
pub mod template;
pub mod validate;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::buffer::Buffer;
use crate::diagnostic::{render_diagnostics_to_string, Diagnostic};
use crate::error::{Error, Result};
use crate::format::{formats_match, Format};
use crate::gpu::dispatch::{Inputs, Params};
use crate::gpu::Gpu;
use crate::range::Range;

use compile::{CompileContext, Program};
use model::{Formats, ProgramModel};

/// The parallel primitive a kernel's entrypoint selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Map,
    Filtro,
    Reduce,
    Scan,
    Group,
    Sort,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Map,
        Method::Filtro,
        Method::Reduce,
        Method::Scan,
        Method::Group,
        Method::Sort,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Method::Map => "map",
            Method::Filtro => "filtro",
            Method::Reduce => "reduce",
            Method::Scan => "scan",
            Method::Group => "group",
            Method::Sort => "sort",
        }
    }

    /// Accepted entrypoint parameter types.
    pub fn signatures(self) -> &'static [&'static [&'static str]] {
        match self {
            Method::Map | Method::Filtro | Method::Reduce | Method::Group => &[&["i32"]],
            Method::Scan => &[&["i32"], &["i32", "i32"]],
            Method::Sort => &[&["i32", "i32"]],
        }
    }

    /// Flags the primitive can return alongside its result.
    pub fn flags(self) -> &'static [Flag] {
        match self {
            Method::Filtro => &[Flag::Length],
            Method::Group => &[Flag::Length, Flag::Start, Flag::Overflow],
            _ => &[],
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| Error::UnknownToken {
                kind: "method",
                token: s.to_string(),
            })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Auxiliary outputs a scatter primitive can be asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Number of placed elements, as a one-element `i32` buffer.
    Length,
    /// Per element, the first slot of its group, or -1.
    Start,
    /// Number of elements that found no free slot.
    Overflow,
}

impl Flag {
    pub fn name(self) -> &'static str {
        match self {
            Flag::Length => "length",
            Flag::Start => "start",
            Flag::Overflow => "overflow",
        }
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [Flag::Length, Flag::Start, Flag::Overflow]
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| Error::UnknownToken {
                kind: "flag",
                token: s.to_string(),
            })
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Buffers bound to one dispatch.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bind<'a> {
    pub read: Option<&'a Buffer>,
    pub scope: Option<&'a Buffer>,
}

impl<'a> Bind<'a> {
    pub fn read(read: &'a Buffer) -> Self {
        Self {
            read: Some(read),
            scope: None,
        }
    }

    pub fn scope(mut self, scope: &'a Buffer) -> Self {
        self.scope = Some(scope);
        self
    }

    pub(crate) fn inputs(&self) -> Inputs<'a> {
        Inputs {
            read: self.read,
            scope: self.scope,
            scope2: None,
        }
    }
}

/// Result of a dispatch plus the flagged auxiliary buffers.
#[derive(Debug)]
pub struct Output {
    pub result: Buffer,
    pub length: Option<Buffer>,
    pub start: Option<Buffer>,
    pub overflow: Option<Buffer>,
}

impl From<Buffer> for Output {
    fn from(result: Buffer) -> Self {
        Output {
            result,
            length: None,
            start: None,
            overflow: None,
        }
    }
}

/// Reusable source spliced into a kernel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Include {
    pub source: String,
    /// Declarations the spliced source provides, for tooling.
    pub header: String,
}

/// Header describing a fragment only assembled at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stub {
    pub header: String,
}

/// A static piece of source. Its header is the source itself.
pub fn include(source: &str) -> Include {
    let source = trim_leading_space(source, 0);
    Include {
        header: source.clone(),
        source,
    }
}

/// Runtime-generated source, e.g. repetitive per-attribute code, described
/// to tooling by `stub`.
pub fn dynamic(source: &str, stub: Option<&Stub>) -> Include {
    Include {
        source: trim_leading_space(source, 0),
        header: stub.map(|s| s.header.clone()).unwrap_or_default(),
    }
}

pub fn stub(header: &str) -> Stub {
    Stub {
        header: trim_leading_space(header, 0),
    }
}

/// Interleave `pieces` with the sources of `includes` and strip the common
/// indentation. There is one more piece than includes, as with a template
/// literal.
pub fn compose(pieces: &[&str], includes: &[&Include]) -> String {
    let mut source = String::new();
    for (n, piece) in pieces.iter().enumerate() {
        source.push_str(piece);
        if let Some(include) = includes.get(n) {
            source.push_str(&include.source);
        }
    }
    trim_leading_space(&source, 0)
}

/// Remove the indentation of the first line that starts with a word
/// character from every line carrying it, then indent those lines by
/// `to_remain` spaces.
pub fn trim_leading_space(source: &str, to_remain: usize) -> String {
    let indent = source
        .split('\n')
        .find_map(|line| {
            let rest = line.trim_start_matches(' ');
            rest.starts_with(|c: char| c.is_alphanumeric() || c == '_')
                .then(|| line.len() - rest.len())
        })
        .unwrap_or(0);
    let prefix = " ".repeat(indent);
    let fill = " ".repeat(to_remain);
    source
        .split('\n')
        .map(|line| match line.strip_prefix(prefix.as_str()) {
            Some(rest) => format!("{fill}{rest}"),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Helper kernels and programs a primitive dispatches besides `main`.
#[derive(Debug)]
pub(crate) enum Plan {
    Map,
    Reduce,
    Scan,
    Filtro(Box<filtro::Plan>),
    Group(Box<group::Plan>),
    Sort(Box<sort::Plan>),
}

/// A compiled kernel.
#[derive(Debug)]
pub struct Kernel {
    source: String,
    formats: Formats,
    method: Method,
    programs: BTreeMap<&'static str, Program>,
    plan: Plan,
}

impl Kernel {
    /// Compile `source` against the given formats. Every authoring error is
    /// reported at once, rendered against the source.
    pub fn new(ctx: &CompileContext, read: Format, write: Format, scope: Format, source: &str) -> Result<Kernel> {
        let formats = Formats::new(read, write, scope);
        let (fragments, mut diagnostics) = fragment::extract(source);
        diagnostics.extend(validate::validate(&formats, &fragments));

        for d in diagnostics.iter().filter(|d| !d.is_error()) {
            tracing::warn!(message = %d.message, "kernel source");
        }
        if diagnostics.iter().any(Diagnostic::is_error) {
            return Err(authoring(diagnostics, source));
        }

        let method = fragments
            .entrypoint()
            .and_then(|e| e.key())
            .unwrap_or_default()
            .parse::<Method>()?;

        let models: Vec<(&'static str, ProgramModel)> = match method {
            Method::Map => map::compile(&formats, &fragments, source),
            Method::Filtro => filtro::compile(&formats, &fragments, source),
            Method::Reduce => reduce::compile(&formats, &fragments, source),
            Method::Scan => scan::compile(&formats, &fragments, source),
            Method::Group => group::compile(&formats, &fragments, source),
            Method::Sort => sort::compile(&formats, &fragments, source),
        };

        let mut programs = BTreeMap::new();
        for (name, model) in models {
            let program = Program::new(name, model, &formats.write, ctx.limit())
                .map_err(|d| authoring(vec![d], source))?;
            ctx.register(&program);
            programs.insert(name, program);
        }

        let plan = match method {
            Method::Map => Plan::Map,
            Method::Reduce => Plan::Reduce,
            Method::Scan => Plan::Scan,
            Method::Filtro => Plan::Filtro(Box::new(filtro::plan(ctx)?)),
            Method::Group => Plan::Group(Box::new(group::plan(ctx)?)),
            Method::Sort => Plan::Sort(Box::new(sort::plan(ctx)?)),
        };

        tracing::debug!(%method, programs = programs.len(), "kernel compiled");
        Ok(Kernel {
            source: source.to_string(),
            formats,
            method,
            programs,
            plan,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn formats(&self) -> &Formats {
        &self.formats
    }

    pub fn programs(&self) -> &BTreeMap<&'static str, Program> {
        &self.programs
    }

    pub(crate) fn program(&self, name: &str) -> Result<&Program> {
        self.programs
            .get(name)
            .ok_or_else(|| Error::ShaderCompilation(format!("{} kernel has no {name} pass", self.method)))
    }

    /// Dispatch the kernel over `range` through `method`.
    ///
    /// Bound buffers marked consumed are freed on every exit path, including
    /// errors.
    pub async fn invoke(
        &self,
        gpu: &Gpu,
        range: &Range,
        method: Method,
        bind: Bind<'_>,
        flags: &[Flag],
    ) -> Result<Output> {
        let _guard = ConsumeGuard(bind);

        if method != self.method {
            return Err(Error::MethodMismatch {
                expected: self.method,
                found: method,
            });
        }
        if range.start != 0 {
            return Err(Error::UnsupportedRange {
                start: range.start,
                end: range.end,
            });
        }
        if let Some(flag) = flags.iter().find(|f| !self.method.flags().contains(f)) {
            return Err(Error::UnsupportedFlag {
                flag: flag.to_string(),
                method: self.method,
            });
        }
        self.warn_formats(bind);

        gpu.compiler().link_pending(gpu.device()).await?;
        gpu.throttle().await?;
        if let Some(read) = bind.read {
            read.checked_length()?;
        }

        self.exec(gpu, range, bind, flags).await
    }

    async fn exec(&self, gpu: &Gpu, range: &Range, bind: Bind<'_>, flags: &[Flag]) -> Result<Output> {
        let n = range.len() as u32;
        tracing::debug!(method = %self.method, n, "invoke");
        match &self.plan {
            Plan::Map => map::exec(gpu, self, n, bind.inputs(), Params::default())
                .await
                .map(Output::from),
            Plan::Reduce => reduce::exec(gpu, self, required_read(bind)?, bind.scope, n)
                .await
                .map(Output::from),
            Plan::Scan => scan::exec(gpu, self, required_read(bind)?, bind.scope, n)
                .await
                .map(Output::from),
            Plan::Filtro(plan) => filtro::exec(gpu, self, plan, n, bind, flags).await,
            Plan::Group(plan) => group::exec(gpu, self, plan, range, bind, flags).await,
            Plan::Sort(plan) => sort::exec(gpu, self, plan, n, bind).await.map(Output::from),
        }
    }

    fn warn_formats(&self, bind: Bind<'_>) {
        let checks = [
            ("read", bind.read, &self.formats.read),
            ("scope", bind.scope, &self.formats.scope),
        ];
        for (slot, buffer, declared) in checks {
            if !formats_match(buffer.map(Buffer::format), declared) {
                let found = buffer.map_or("nothing".to_string(), |b| b.format().to_string());
                tracing::warn!(slot, expected = %declared, %found, "bound buffer format does not match kernel");
            }
        }
    }
}

fn required_read<'a>(bind: Bind<'a>) -> Result<&'a Buffer> {
    bind.read.ok_or(Error::MissingInput { slot: "read" })
}

fn authoring(diagnostics: Vec<Diagnostic>, source: &str) -> Error {
    let rendered = render_diagnostics_to_string(&diagnostics, "kernel", source);
    Error::Authoring {
        diagnostics,
        rendered,
    }
}

/// Frees consumed bound buffers when dropped.
struct ConsumeGuard<'a>(Bind<'a>);

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        for buffer in [self.0.read, self.0.scope].into_iter().flatten() {
            if buffer.is_consumed() {
                buffer.free();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FLOAT, INT};

    fn ctx() -> CompileContext {
        CompileContext::new(64)
    }

    #[test]
    fn test_method_tokens() {
        for m in Method::ALL {
            assert_eq!(m.name().parse::<Method>().unwrap(), m);
            assert_eq!(m.to_string(), m.name());
        }
        let err = "filter".parse::<Method>().unwrap_err();
        assert!(matches!(err, Error::UnknownToken { kind: "method", .. }));
    }

    #[test]
    fn test_flag_tokens() {
        assert_eq!("length".parse::<Flag>().unwrap(), Flag::Length);
        assert_eq!("overflow".parse::<Flag>().unwrap(), Flag::Overflow);
        assert!("count".parse::<Flag>().is_err());
        assert!(Method::Filtro.flags().contains(&Flag::Length));
        assert!(!Method::Filtro.flags().contains(&Flag::Start));
        assert!(Method::Map.flags().is_empty());
    }

    #[test]
    fn test_trim_leading_space() {
        let src = "\n    fn map(i: i32) {\n      write(1.0);\n    }";
        assert_eq!(trim_leading_space(src, 0), "\nfn map(i: i32) {\n  write(1.0);\n}");
        assert_eq!(trim_leading_space(src, 2), "\n  fn map(i: i32) {\n    write(1.0);\n  }");
        assert_eq!(trim_leading_space("a\n b", 0), "a\n b");
    }

    #[test]
    fn test_compose_includes() {
        let helper = include(
            "
            fn twice(x: f32) -> f32 {
                return x * 2.0;
            }",
        );
        assert_eq!(helper.source, helper.header);
        let stub = stub("fn extra(x: f32) -> f32;");
        let generated = dynamic("fn extra(x: f32) -> f32 { return x; }", Some(&stub));
        assert_eq!(generated.header, "fn extra(x: f32) -> f32;");

        let source = compose(
            &["", "\n", "\nfn map(i: i32) { write(extra(twice(read(i)))); }"],
            &[&helper, &generated],
        );
        let kernel = Kernel::new(&ctx(), FLOAT.into(), FLOAT.into(), Format::Null, &source).unwrap();
        assert_eq!(kernel.method(), Method::Map);
        assert!(kernel.source().contains("fn twice"));
    }

    #[test]
    fn test_new_compiles_each_method() {
        let cases = [
            (FLOAT, FLOAT, "fn map(i: i32) { write(read(i) * 2.0); }", Method::Map, 1),
            (FLOAT, FLOAT, "fn reduce(i: i32) { write(read(i) + read(i + 1) + read(i + 2) + read(i + 3)); }", Method::Reduce, 1),
            (FLOAT, FLOAT, "fn scan(i: i32) { write(read(i) + read(i + 1)); }", Method::Scan, 4),
            (INT, INT, "fn filtro(i: i32) { write(read(i) % 2); }", Method::Filtro, 1),
            (INT, INT, "fn group(i: i32) { write(read(i) / 10); }", Method::Group, 1),
            (FLOAT, INT, "fn sort(a: i32, b: i32) { write(i32(sign(read(a) - read(b)))); }", Method::Sort, 1),
        ];
        for (read, write, source, method, passes) in cases {
            let kernel = Kernel::new(&ctx(), read.into(), write.into(), Format::Null, source)
                .unwrap_or_else(|e| panic!("{source}: {e}"));
            assert_eq!(kernel.method(), method);
            assert_eq!(kernel.programs().len(), passes, "{method}");
        }
    }

    #[test]
    fn test_new_registers_helper_kernels() {
        let ctx = ctx();
        let _kernel = Kernel::new(&ctx, INT.into(), INT.into(), Format::Null, "fn filtro(i: i32) { write(read(i)); }").unwrap();
        // main plus the four passes of the prefix sum
        assert_eq!(ctx.pending(), 5);
    }

    #[test]
    fn test_authoring_errors_fail_construction() {
        let err = Kernel::new(&ctx(), FLOAT.into(), FLOAT.into(), Format::Null, "fn map(i: i32) -> f32 { return 1.0; }")
            .unwrap_err();
        let Error::Authoring {
            diagnostics,
            rendered,
        } = err
        else {
            panic!("expected an authoring error");
        };
        assert!(diagnostics.iter().any(|d| d.message.contains("return type")));
        assert!(diagnostics.iter().any(|d| d.message == "must write something"));
        assert!(rendered.contains("return type"));
    }

    #[test]
    fn test_write_component_limit() {
        let write = Format::complex((0..5).map(|n| (format!("v{n}"), crate::format::VEC4)));
        let body: String = (0..5).map(|n| format!("write_v{n}(vec4f());")).collect();
        let err = Kernel::new(&ctx(), Format::Null, write, Format::Null, &format!("fn map(i: i32) {{ {body} }}"))
            .unwrap_err();
        assert!(err.to_string().contains("too many components"));
    }

    #[test]
    fn test_bind_builder() {
        let bind = Bind::default();
        assert!(bind.read.is_none() && bind.scope.is_none());
        let inputs = bind.inputs();
        assert!(inputs.scope2.is_none());
    }
}
