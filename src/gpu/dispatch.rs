//! Running one program over a number of points.

use wgpu::util::DeviceExt;

use super::Gpu;
use crate::buffer::layout::standard_layout;
use crate::buffer::{size_buffer, Attribute, Buffer, Representation};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::kernel::compile::{Chunk, Program};
use crate::kernel::model::{ProgramModel, Slot};
use crate::kernel::template::dispatch_grid;
use crate::random;

/// Buffers bound to the three sampler slots.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inputs<'a> {
    pub read: Option<&'a Buffer>,
    pub scope: Option<&'a Buffer>,
    pub scope2: Option<&'a Buffer>,
}

impl<'a> Inputs<'a> {
    pub fn get(&self, slot: Slot) -> Option<&'a Buffer> {
        match slot {
            Slot::Read => self.read,
            Slot::Scope => self.scope,
            Slot::Scope2 => self.scope2,
        }
    }
}

/// Per-dispatch values of the `glc_params` uniform other than the seed and
/// point count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Params {
    /// Bitonic phase and partner distance.
    pub part: [i32; 2],
    /// Logical length for passes that run over padding.
    pub limit: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct ParamsUniform {
    seed: [u32; 4],
    part: [i32; 2],
    limit: i32,
    points: u32,
}

/// `{repeat, offset, count, pad}` per readable attribute.
pub(crate) fn attribute_table(model: &ProgramModel, inputs: Inputs<'_>) -> Result<Vec<[i32; 4]>> {
    let mut table = Vec::with_capacity(model.inputs.len());
    for (index, field) in model.inputs.iter().enumerate() {
        let used = model.read_functions.iter().any(|r| r.attrib_index == index);
        let found = inputs.get(field.slot).and_then(|buffer| {
            buffer
                .attribs()
                .into_iter()
                .find(|a| a.name.as_deref() == field.attribute_name())
        });
        match found {
            Some(a) => table.push([a.repeat as i32, a.offset as i32, a.count as i32, 0]),
            None if used => {
                return Err(Error::MissingAttribute {
                    slot: field.slot.name(),
                    name: field.attribute_name().map(str::to_string),
                })
            }
            None => table.push([0; 4]),
        }
    }
    if table.is_empty() {
        table.push([0; 4]);
    }
    Ok(table)
}

impl Gpu {
    /// Dispatch `points` invocations of every chunk of `program` and merge
    /// the captured attributes into one buffer of `count` elements.
    pub(crate) async fn run(
        &self,
        program: &Program,
        points: u32,
        count: u32,
        inputs: Inputs<'_>,
        params: Params,
    ) -> Result<Buffer> {
        self.compiler().link(self.device(), &program.chunks).await?;
        let model = &program.model;

        let mut views: [Option<wgpu::TextureView>; 3] = Default::default();
        for slot in Slot::ALL {
            if !model.samplers[slot.index()] {
                continue;
            }
            let buffer = inputs
                .get(slot)
                .ok_or(Error::MissingInput { slot: slot.name() })?;
            buffer.acquire(Representation::Texture).await?;
            let texture = buffer
                .texture()
                .ok_or(Error::MissingInput { slot: slot.name() })?;
            views[slot.index()] = Some(texture.create_view(&wgpu::TextureViewDescriptor::default()));
        }

        let [a, b, c] = random::seed();
        let uniform = ParamsUniform {
            seed: [a, b, c, 0],
            part: params.part,
            limit: params.limit,
            points,
        };
        let uniform = self
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("glc params"),
                contents: bytemuck::bytes_of(&uniform),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let attribs = if model.bindings().attribs {
            let table = attribute_table(model, inputs)?;
            Some(
                self.device()
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("glc attribs"),
                        contents: bytemuck::cast_slice(&table),
                        usage: wgpu::BufferUsages::STORAGE,
                    }),
            )
        } else {
            None
        };

        let mut parts = Vec::with_capacity(program.chunks.len());
        for chunk in &program.chunks {
            let size = size_buffer(&chunk.format, points * chunk.elements_per_point);
            let output = self.storage_buffer(size)?;
            if points > 0 {
                self.dispatch_chunk(chunk, points, &uniform, attribs.as_ref(), &views, &output)?;
            }
            parts.push((chunk.format.clone(), size, output));
        }
        tracing::debug!(
            program = %program.name,
            points,
            chunks = program.chunks.len(),
            "dispatch"
        );

        if parts.len() == 1 {
            if let Some((format, size, output)) = parts.pop() {
                let attribs = standard_layout(&format, count);
                return Ok(Buffer::from_device(self, format, attribs, size, output));
            }
        }
        self.merge_chunks(parts, count)
    }

    fn dispatch_chunk(
        &self,
        chunk: &Chunk,
        points: u32,
        uniform: &wgpu::Buffer,
        attribs: Option<&wgpu::Buffer>,
        views: &[Option<wgpu::TextureView>; 3],
        output: &wgpu::Buffer,
    ) -> Result<()> {
        let linked = chunk
            .linked()
            .ok_or_else(|| Error::ShaderCompilation(format!("{} was never linked", chunk.label)))?;

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        if let Some(attribs) = attribs {
            entries.push(wgpu::BindGroupEntry {
                binding: 1,
                resource: attribs.as_entire_binding(),
            });
        }
        for (slot, view) in views.iter().enumerate() {
            if let Some(view) = view {
                entries.push(wgpu::BindGroupEntry {
                    binding: 2 + slot as u32,
                    resource: wgpu::BindingResource::TextureView(view),
                });
            }
        }
        entries.push(wgpu::BindGroupEntry {
            binding: 5,
            resource: output.as_entire_binding(),
        });
        let bind_group = self.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&chunk.label),
            layout: &linked.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&chunk.label),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&chunk.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&linked.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (x, y, z) = dispatch_grid(points);
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue().submit(Some(encoder.finish()));
        Ok(())
    }

    /// Concatenate chunk outputs into one buffer, shifting each chunk's
    /// attribute offsets by its position.
    fn merge_chunks(&self, parts: Vec<(Format, u64, super::pool::PooledBuffer)>, count: u32) -> Result<Buffer> {
        let total: u64 = parts.iter().map(|(_, size, _)| size).sum();
        let size = total.next_power_of_two();
        let merged = self.storage_buffer(size)?;
        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc merge chunks"),
            });
        let mut fields = std::collections::BTreeMap::new();
        let mut attribs: Vec<Attribute> = Vec::new();
        let mut cursor = 0u64;
        for (format, part_size, output) in &parts {
            encoder.copy_buffer_to_buffer(output, 0, &merged, cursor, *part_size);
            for mut a in standard_layout(format, count) {
                a.offset += (cursor / 4) as u32;
                if let Some(name) = &a.name {
                    fields.insert(name.clone(), a.format);
                }
                attribs.push(a);
            }
            cursor += part_size;
        }
        self.queue().submit(Some(encoder.finish()));
        attribs.sort_by(|x, y| x.name.cmp(&y.name));
        Ok(Buffer::from_device(self, Format::Complex(fields), attribs, size, merged))
    }
}
