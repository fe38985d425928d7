//! Point scatter into an integer render target.
//!
//! Filtro and group move elements to computed destinations without atomics:
//! each source element is drawn as one point on its destination pixel of an
//! `R32Sint` target cleared to `-1`, and the stencil buffer decides which
//! point wins a pixel. The target is then copied back into a linear buffer,
//! through a relinearisation compute pass when its row pitch is not copyable.

use std::borrow::Cow;

use wgpu::util::DeviceExt;

use super::pool::{PooledBuffer, PooledTexture, TextureKind};
use super::shaders;
use super::{Gpu, Support};
use crate::buffer::layout::{texture_dimensions, MIN_BYTES};
use crate::buffer::Buffer;
use crate::error::Result;
use crate::format::{Format, INT};
use crate::kernel::template::dispatch_grid;

/// Uniform of the scatter shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct TargetParams {
    width: u32,
    height: u32,
    modulus: u32,
    offset: u32,
    count: u32,
    slot: u32,
    pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct ExtentParams {
    pixels: u32,
    width: u32,
    pad: [u32; 2],
}

/// Pipelines shared by every filtro and group dispatch on one device.
pub struct Builtins {
    scatter_layout: wgpu::BindGroupLayout,
    filtro: wgpu::RenderPipeline,
    group_first: wgpu::RenderPipeline,
    group_rest: wgpu::RenderPipeline,
    relinearize_layout: wgpu::BindGroupLayout,
    relinearize: wgpu::ComputePipeline,
}

fn stencil(compare: wgpu::CompareFunction, op: wgpu::StencilOperation) -> wgpu::StencilState {
    let face = wgpu::StencilFaceState {
        compare,
        fail_op: op,
        depth_fail_op: wgpu::StencilOperation::Keep,
        pass_op: op,
    };
    wgpu::StencilState {
        front: face,
        back: face,
        read_mask: 0xff,
        write_mask: 0xff,
    }
}

impl Builtins {
    pub fn new(device: &wgpu::Device) -> Builtins {
        let scatter = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("glc scatter"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(shaders::SCATTER)),
        });
        let scatter_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("glc scatter"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let scatter_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("glc scatter"),
            bind_group_layouts: &[&scatter_layout],
            push_constant_ranges: &[],
        });

        let render = |label: &str, entry: &str, depth: (bool, wgpu::CompareFunction), stencil: wgpu::StencilState| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&scatter_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &scatter,
                    entry_point: Some(entry),
                    compilation_options: Default::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: 4,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[wgpu::VertexAttribute {
                            format: wgpu::VertexFormat::Sint32,
                            offset: 0,
                            shader_location: 0,
                        }],
                    }],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::PointList,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: TextureKind::Mask.format(),
                    depth_write_enabled: depth.0,
                    depth_compare: depth.1,
                    stencil,
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &scatter,
                    entry_point: Some("scatter_fragment"),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TextureKind::Index.format(),
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                multiview: None,
                cache: None,
            })
        };

        use wgpu::{CompareFunction as Cmp, StencilOperation as Op};
        let filtro = render(
            "glc filtro scatter",
            "filtro_vertex",
            (false, Cmp::Always),
            stencil(Cmp::Equal, Op::IncrementClamp),
        );
        let group_first = render(
            "glc group nearest",
            "group_vertex",
            (true, Cmp::Less),
            stencil(Cmp::Always, Op::Keep),
        );
        let group_rest = render(
            "glc group routed",
            "group_vertex",
            (false, Cmp::Always),
            stencil(Cmp::Equal, Op::IncrementClamp),
        );

        let relinearize_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("glc relinearize"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(shaders::RELINEARIZE)),
        });
        let relinearize_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("glc relinearize"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Sint,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        let relinearize_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("glc relinearize"),
            bind_group_layouts: &[&relinearize_layout],
            push_constant_ranges: &[],
        });
        let relinearize = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("glc relinearize"),
            layout: Some(&relinearize_pipeline_layout),
            module: &relinearize_module,
            entry_point: Some("relinearize"),
            compilation_options: Default::default(),
            cache: None,
        });

        Builtins {
            scatter_layout,
            filtro,
            group_first,
            group_rest,
            relinearize_layout,
            relinearize,
        }
    }
}

/// Colour and mask attachments covering at least `slots` pixels.
struct Target {
    index: PooledTexture,
    mask: PooledTexture,
    pixels: u32,
    width: u32,
    height: u32,
}

impl Gpu {
    fn scatter_target(&self, slots: u32) -> Result<Target> {
        let pixels = slots.max(1).next_power_of_two();
        let (width, height) = texture_dimensions(pixels);
        Ok(Target {
            index: self.texture(pixels, TextureKind::Index)?,
            mask: self.texture(pixels, TextureKind::Mask)?,
            pixels,
            width,
            height,
        })
    }

    fn scatter_bind_group(&self, params: TargetParams) -> wgpu::BindGroup {
        let uniform = self
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("glc scatter params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        self.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("glc scatter"),
            layout: &self.builtins().scatter_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniform.as_entire_binding(),
            }],
        })
    }

    /// Move every kept element to slot `prefix - 1`. `prefix` holds the
    /// inclusive count of kept elements; the first element drawn on a slot
    /// is the kept one, later elements sharing its prefix are rejected by
    /// the stencil.
    pub(crate) fn scatter_filtro(&self, prefix: &wgpu::Buffer, n: u32) -> Result<Buffer> {
        let target = self.scatter_target(n)?;
        let bind_group = self.scatter_bind_group(TargetParams {
            width: target.width,
            height: target.height,
            count: n,
            ..Default::default()
        });
        let color = target.index.create_view(&wgpu::TextureViewDescriptor::default());
        let mask = target.mask.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc filtro scatter"),
            });
        {
            let mut pass = begin_scatter(&mut encoder, &color, &mask);
            if n > 0 {
                pass.set_pipeline(&self.builtins().filtro);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, prefix.slice(..));
                pass.set_stencil_reference(0);
                pass.draw(0..n, 0..1);
            }
        }
        self.queue().submit(Some(encoder.finish()));
        tracing::debug!(n, pixels = target.pixels, "filtro scatter");

        let linear = self.read_index_target(&target)?;
        Ok(index_buffer(self, linear, target.pixels, n))
    }

    /// Place up to four elements per bucket into a table of `4 * modulus`
    /// slots. Slot 0 of a bucket takes the element drawn first (by depth),
    /// slot `k` the `k`-th one (by stencil count).
    pub(crate) fn scatter_group(&self, ids: &wgpu::Buffer, n: u32, modulus: u32, offset: u32) -> Result<Buffer> {
        let slots = modulus * 4;
        let target = self.scatter_target(slots)?;
        let bind_groups: Vec<wgpu::BindGroup> = (0..4u32)
            .map(|slot| {
                self.scatter_bind_group(TargetParams {
                    width: target.width,
                    height: target.height,
                    modulus,
                    offset,
                    count: n,
                    slot,
                    ..Default::default()
                })
            })
            .collect();
        let color = target.index.create_view(&wgpu::TextureViewDescriptor::default());
        let mask = target.mask.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc group scatter"),
            });
        {
            let mut pass = begin_scatter(&mut encoder, &color, &mask);
            if n > 0 {
                pass.set_vertex_buffer(0, ids.slice(..));
                pass.set_pipeline(&self.builtins().group_first);
                pass.set_bind_group(0, &bind_groups[0], &[]);
                pass.draw(0..n, 0..1);
                pass.set_pipeline(&self.builtins().group_rest);
                for (k, bind_group) in bind_groups.iter().enumerate().skip(1) {
                    pass.set_bind_group(0, bind_group, &[]);
                    pass.set_stencil_reference(k as u32);
                    pass.draw(0..n, 0..1);
                }
            }
        }
        self.queue().submit(Some(encoder.finish()));
        tracing::debug!(n, modulus, offset, "group scatter");

        let linear = self.read_index_target(&target)?;
        Ok(index_buffer(self, linear, target.pixels, slots))
    }

    fn read_index_target(&self, target: &Target) -> Result<PooledBuffer> {
        let size = (target.pixels as u64 * 4).max(MIN_BYTES);
        let linear = self.storage_buffer(size)?;
        let mut encoder = self
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("glc index readback"),
            });

        if Support::direct_index_readback(target.width, target.height) {
            encoder.copy_texture_to_buffer(
                target.index.as_image_copy(),
                wgpu::TexelCopyBufferInfo {
                    buffer: &linear,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: (target.height > 1).then_some(target.width * 4),
                        rows_per_image: None,
                    },
                },
                wgpu::Extent3d {
                    width: target.width,
                    height: target.height,
                    depth_or_array_layers: 1,
                },
            );
        } else {
            tracing::debug!(width = target.width, "relinearizing index target");
            let uniform = self
                .device()
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("glc relinearize params"),
                    contents: bytemuck::bytes_of(&ExtentParams {
                        pixels: target.pixels,
                        width: target.width,
                        pad: [0; 2],
                    }),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let view = target.index.create_view(&wgpu::TextureViewDescriptor::default());
            let bind_group = self.device().create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("glc relinearize"),
                layout: &self.builtins().relinearize_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: linear.as_entire_binding(),
                    },
                ],
            });
            let (x, y, z) = dispatch_grid(target.pixels);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("glc relinearize"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.builtins().relinearize);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.queue().submit(Some(encoder.finish()));
        Ok(linear)
    }
}

fn begin_scatter<'e>(
    encoder: &'e mut wgpu::CommandEncoder,
    color: &wgpu::TextureView,
    mask: &wgpu::TextureView,
) -> wgpu::RenderPass<'e> {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some("glc scatter"),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: color,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(wgpu::Color {
                    r: -1.0,
                    g: 0.0,
                    b: 0.0,
                    a: 0.0,
                }),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
            view: mask,
            depth_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(1.0),
                store: wgpu::StoreOp::Discard,
            }),
            stencil_ops: Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(0),
                store: wgpu::StoreOp::Discard,
            }),
        }),
        timestamp_writes: None,
        occlusion_query_set: None,
    })
}

fn index_buffer(gpu: &Gpu, linear: PooledBuffer, pixels: u32, count: u32) -> Buffer {
    let format = Format::Simple(INT);
    let attribs = crate::buffer::standard_layout(&format, count);
    let byte_length = (pixels as u64 * 4).max(MIN_BYTES);
    Buffer::from_device(gpu, format, attribs, byte_length, linear)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_sizes() {
        assert_eq!(std::mem::size_of::<TargetParams>(), 32);
        assert_eq!(std::mem::size_of::<ExtentParams>(), 16);
    }

    #[test]
    fn test_stencil_state() {
        let s = stencil(wgpu::CompareFunction::Equal, wgpu::StencilOperation::IncrementClamp);
        assert_eq!(s.front.fail_op, wgpu::StencilOperation::IncrementClamp);
        assert_eq!(s.front.depth_fail_op, wgpu::StencilOperation::Keep);
        assert_eq!(s.front, s.back);
    }

    #[test]
    fn test_shaders_declare_entry_points() {
        for entry in ["fn filtro_vertex", "fn group_vertex", "fn scatter_fragment"] {
            assert!(shaders::SCATTER.contains(entry), "missing {entry}");
        }
        assert!(shaders::RELINEARIZE.contains("fn relinearize"));
    }

    #[test]
    fn test_group_slot_comes_from_uniform() {
        assert!(!shaders::SCATTER.contains("instance_index"));
        assert!(shaders::SCATTER.contains("bucket * 4u + dest.slot"));
    }

    #[tokio::test]
    #[ignore = "requires GPU"]
    async fn test_filtro_scatter_compacts() {
        let gpu = Gpu::new().unwrap();
        // flags 0 1 1 0 1 -> inclusive prefix 0 1 2 2 3
        let prefix = Buffer::from_slice(&gpu, INT, &[0i32, 1, 2, 2, 3]).unwrap();
        prefix.acquire(crate::buffer::Representation::Device).await.unwrap();
        let device = prefix.device_buffer().unwrap();
        let out = gpu.scatter_filtro(&device, 5).unwrap();
        let values: Vec<i32> = out.read_slice().await.unwrap();
        assert_eq!(values, vec![1, 2, 4, -1, -1]);
    }

    #[tokio::test]
    #[ignore = "requires GPU"]
    async fn test_group_scatter_fills_slots_in_order() {
        let gpu = Gpu::new().unwrap();
        let ids = Buffer::from_slice(&gpu, INT, &[3i32, 3, -1, 3, 0]).unwrap();
        ids.acquire(crate::buffer::Representation::Device).await.unwrap();
        let device = ids.device_buffer().unwrap();
        let table = gpu.scatter_group(&device, 5, 2, 0).unwrap();
        let slots: Vec<i32> = table.read_slice().await.unwrap();
        // bucket 1 holds the elements with id 3, bucket 0 the one with id 0
        assert_eq!(slots, vec![4, -1, -1, -1, 0, 1, 3, -1]);
    }
}
