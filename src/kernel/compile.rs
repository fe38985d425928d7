//! Chunked programs and their linked compute pipelines.
//!
//! A [`Program`] is one pass of a primitive. When its output registers exceed
//! the interleaved-component limit it is split into several [`Chunk`]s, each
//! rendered and dispatched on its own. Chunks are linked lazily: the
//! [`CompileContext`] tracks every chunk not yet linked and builds all of them
//! in one parallel batch on the next dispatch. Identical sources share a
//! pipeline through a content-hash cache.

use std::borrow::Cow;
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rayon::prelude::*;

use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::format::Format;

use super::model::{Bindings, ProgramModel};
use super::template;

/// Entry point of every generated program.
pub const ENTRY_POINT: &str = "glc_main";

pub struct Linked {
    pub pipeline: wgpu::ComputePipeline,
    pub layout: wgpu::BindGroupLayout,
}

/// One dispatchable piece of a program.
pub struct Chunk {
    pub label: String,
    pub source: String,
    pub bindings: Bindings,
    /// Format of the attributes this chunk writes.
    pub format: Format,
    /// Output words per invocation.
    pub stride: u32,
    /// Logical output elements per invocation.
    pub elements_per_point: u32,
    hash: blake3::Hash,
    linked: OnceCell<Rc<Linked>>,
}

impl Chunk {
    pub fn linked(&self) -> Option<&Rc<Linked>> {
        self.linked.get()
    }

    pub fn hash(&self) -> blake3::Hash {
        self.hash
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("label", &self.label)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .field("linked", &self.linked.get().is_some())
            .finish()
    }
}

/// A pass of a primitive, split into chunks.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub model: ProgramModel,
    pub chunks: Vec<Rc<Chunk>>,
}

impl Program {
    /// Render `model` into chunks that each write at most `limit` words per
    /// invocation.
    pub fn new(name: &str, model: ProgramModel, write: &Format, limit: u32) -> Result<Program, Diagnostic> {
        let groups = model.partition(limit)?;
        let chunks = groups
            .iter()
            .enumerate()
            .map(|(n, captured)| {
                let format = model.captured_format(write, captured);
                let fields = format.fields().len().max(1);
                let source = template::render(&model, captured);
                Rc::new(Chunk {
                    label: format!("{name}#{n}"),
                    hash: blake3::hash(source.as_bytes()),
                    source,
                    bindings: model.bindings(),
                    format,
                    stride: model.stride(captured),
                    elements_per_point: (captured.len() / fields) as u32,
                    linked: OnceCell::new(),
                })
            })
            .collect();
        Ok(Program {
            name: name.to_string(),
            model,
            chunks,
        })
    }

    pub fn is_linked(&self) -> bool {
        self.chunks.iter().all(|c| c.linked.get().is_some())
    }
}

/// Device-wide registry of unlinked chunks and linked pipelines.
pub struct CompileContext {
    limit: u32,
    pending: RefCell<Vec<Weak<Chunk>>>,
    cache: RefCell<HashMap<blake3::Hash, Rc<Linked>>>,
}

impl CompileContext {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            pending: RefCell::new(Vec::new()),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Interleaved-component limit programs are chunked against.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Queue the chunks of `program` for the next link.
    pub fn register(&self, program: &Program) {
        let mut pending = self.pending.borrow_mut();
        pending.extend(program.chunks.iter().map(Rc::downgrade));
    }

    pub fn pending(&self) -> usize {
        self.pending
            .borrow()
            .iter()
            .filter(|c| c.upgrade().is_some_and(|c| c.linked.get().is_none()))
            .count()
    }

    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Link every registered chunk that is still alive and unlinked.
    pub async fn link_pending(&self, device: &wgpu::Device) -> Result<()> {
        let chunks: Vec<Rc<Chunk>> = self
            .pending
            .borrow_mut()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        self.link(device, &chunks).await
    }

    /// Link `chunks`, compiling distinct sources in parallel.
    pub async fn link(&self, device: &wgpu::Device, chunks: &[Rc<Chunk>]) -> Result<()> {
        let mut sources: Vec<(blake3::Hash, &str, Bindings, &str)> = Vec::new();
        {
            let cache = self.cache.borrow();
            for chunk in chunks.iter().filter(|c| c.linked.get().is_none()) {
                if let Some(linked) = cache.get(&chunk.hash) {
                    let _ = chunk.linked.set(Rc::clone(linked));
                } else if !sources.iter().any(|(h, ..)| *h == chunk.hash) {
                    sources.push((chunk.hash, &chunk.source, chunk.bindings, &chunk.label));
                }
            }
        }
        if sources.is_empty() {
            return Ok(());
        }

        let start = std::time::Instant::now();
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let built: Vec<(blake3::Hash, wgpu::ComputePipeline, wgpu::BindGroupLayout)> = sources
            .par_iter()
            .map(|(hash, source, bindings, label)| {
                let (pipeline, layout) = create_pipeline(device, label, source, *bindings);
                (*hash, pipeline, layout)
            })
            .collect();
        if let Some(err) = device.pop_error_scope().await {
            tracing::error!(programs = sources.len(), "program failed to compile");
            for (_, source, _, label) in &sources {
                tracing::debug!(program = %label, "generated source:\n{source}");
            }
            return Err(Error::ShaderCompilation(err.to_string()));
        }
        tracing::debug!(
            programs = built.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "linked programs"
        );

        let mut cache = self.cache.borrow_mut();
        for (hash, pipeline, layout) in built {
            cache.insert(hash, Rc::new(Linked { pipeline, layout }));
        }
        for chunk in chunks {
            if let Some(linked) = cache.get(&chunk.hash) {
                let _ = chunk.linked.set(Rc::clone(linked));
            }
        }
        Ok(())
    }
}

/// Bind group layout entries for a program's bindings.
pub fn layout_entries(bindings: Bindings) -> Vec<wgpu::BindGroupLayoutEntry> {
    let buffer = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };
    let mut entries = vec![buffer(0, wgpu::BufferBindingType::Uniform)];
    if bindings.attribs {
        entries.push(buffer(1, wgpu::BufferBindingType::Storage { read_only: true }));
    }
    for (slot, used) in bindings.samplers.iter().enumerate() {
        if *used {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: 2 + slot as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Uint,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
        }
    }
    entries.push(buffer(5, wgpu::BufferBindingType::Storage { read_only: false }));
    entries
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    bindings: Bindings,
) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
    });
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &layout_entries(bindings),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some(ENTRY_POINT),
        compilation_options: Default::default(),
        cache: None,
    });
    (pipeline, layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FLOAT, VEC4};
    use crate::kernel::fragment::extract;
    use crate::kernel::model::Formats;

    fn program(write: Format, source: &str, limit: u32) -> Program {
        let formats = Formats::new(Format::Null, write.clone(), Format::Null);
        let (frags, _) = extract(source);
        let model = ProgramModel::build(&formats, &frags, source);
        Program::new("map", model, &write, limit).unwrap()
    }

    #[test]
    fn test_single_chunk() {
        let p = program(FLOAT.into(), "fn map(i: i32) { write(1.0); }", 64);
        assert_eq!(p.chunks.len(), 1);
        assert_eq!(p.chunks[0].stride, 4);
        assert_eq!(p.chunks[0].elements_per_point, 4);
        assert_eq!(p.chunks[0].format, Format::Simple(FLOAT));
        assert!(!p.is_linked());
    }

    #[test]
    fn test_chunks_split_by_field() {
        let write = Format::complex([("a", VEC4), ("b", VEC4), ("c", FLOAT)]);
        let p = program(
            write,
            "fn map(i: i32) { write_a(vec4f()); write_b(vec4f()); write_c(1.0); }",
            20,
        );
        assert_eq!(p.chunks.len(), 2);
        assert_eq!(p.chunks[0].format, Format::complex([("a", VEC4), ("c", FLOAT)]));
        assert_eq!(p.chunks[0].stride, 20);
        assert_eq!(p.chunks[1].format, Format::complex([("b", VEC4)]));
        assert_ne!(p.chunks[0].hash(), p.chunks[1].hash());
    }

    #[test]
    fn test_register_and_pending() {
        let ctx = CompileContext::new(64);
        let p = program(FLOAT.into(), "fn map(i: i32) { write(1.0); }", 64);
        ctx.register(&p);
        assert_eq!(ctx.pending(), 1);
        drop(p);
        assert_eq!(ctx.pending(), 0);
    }

    #[test]
    fn test_layout_entries() {
        let entries = layout_entries(Bindings {
            attribs: true,
            samplers: [true, false, true],
        });
        let slots: Vec<u32> = entries.iter().map(|e| e.binding).collect();
        assert_eq!(slots, vec![0, 1, 2, 4, 5]);
        assert_eq!(layout_entries(Bindings::default()).len(), 2);
    }

    #[tokio::test]
    #[ignore = "requires GPU"]
    async fn test_link_shares_identical_sources() {
        let gpu = crate::gpu::Gpu::new().unwrap();
        let ctx = CompileContext::new(64);
        let a = program(FLOAT.into(), "fn map(i: i32) { write(1.0); }", 64);
        let b = program(FLOAT.into(), "fn map(i: i32) { write(1.0); }", 64);
        ctx.register(&a);
        ctx.register(&b);
        ctx.link_pending(gpu.device()).await.unwrap();
        assert!(a.is_linked() && b.is_linked());
        assert_eq!(ctx.cached(), 1);
    }
}
