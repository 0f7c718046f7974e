//! Software logical device.
//!
//! Resources live in host memory. Submitted command buffers are executed
//! in order at submit time: barriers update the tracked image layouts,
//! copies move bytes, dispatches run the registered kernel and render
//! passes clear their attachments. Anything that would be invalid usage
//! on a real driver is recorded as a violation in the ledger.

use super::kernel::KernelIo;
use super::ledger::ObjectKind;
use super::Shared;
use crate::api::{
    ClearValue, Command, DescriptorResource, DescriptorWrite, DeviceApi, DeviceDesc,
    FramebufferDesc, GraphicsPipelineDesc, ImageBarrier, ImageDesc, LayoutBinding,
    RenderPassDesc, SamplerDesc,
};
use crate::error::{GpuError, Result};
use crate::memory::format_size;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const ALIGNMENT: u64 = 256;

const fn align(size: u64) -> u64 {
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}

fn image_bytes(desc: &ImageDesc) -> u64 {
    u64::from(desc.extent.width) * u64::from(desc.extent.height) * format_size(desc.format)
}

struct MemoryState {
    bytes: Vec<u8>,
    flags: vk::MemoryPropertyFlags,
    bound: Option<u64>,
}

struct BufferState {
    size: u64,
    memory: Option<u64>,
}

struct ImageState {
    desc: ImageDesc,
    memory: Option<u64>,
    layout: vk::ImageLayout,
}

struct PoolState {
    max_sets: u32,
    sets: Vec<u64>,
}

struct SetState {
    bindings: Vec<LayoutBinding>,
    writes: HashMap<u32, DescriptorResource>,
}

enum PipelineState {
    Compute { code: Vec<u32> },
    Graphics,
}

struct CommandBufferState {
    pool: u64,
    recording: bool,
    commands: Vec<Command>,
}

/// Everything a device owns, behind one lock.
#[derive(Default)]
pub(crate) struct DeviceState {
    memories: HashMap<u64, MemoryState>,
    buffers: HashMap<u64, BufferState>,
    images: HashMap<u64, ImageState>,
    views: HashMap<u64, u64>,
    samplers: Vec<u64>,
    set_layouts: HashMap<u64, Vec<LayoutBinding>>,
    pools: HashMap<u64, PoolState>,
    sets: HashMap<u64, SetState>,
    modules: HashMap<u64, Vec<u32>>,
    pipeline_layouts: Vec<u64>,
    pipelines: HashMap<u64, PipelineState>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, FramebufferDesc>,
    command_pools: HashMap<u64, u32>,
    command_buffers: HashMap<u64, CommandBufferState>,
    fences: HashMap<u64, bool>,
    queues: HashMap<u64, u32>,
}

impl DeviceState {
    pub(super) fn descriptor(&self, set: u64, binding: u32) -> std::result::Result<DescriptorResource, String> {
        let state = self
            .sets
            .get(&set)
            .ok_or_else(|| format!("unknown descriptor set {set:#x}"))?;
        state
            .writes
            .get(&binding)
            .copied()
            .ok_or_else(|| format!("binding {binding} was never written"))
    }

    fn read_memory_range(&self, memory: Option<u64>, offset: u64, len: u64) -> std::result::Result<Vec<u8>, String> {
        let memory = memory.ok_or("resource has no memory bound")?;
        let state = self
            .memories
            .get(&memory)
            .ok_or_else(|| format!("unknown memory {memory:#x}"))?;
        let end = offset + len;
        if end > state.bytes.len() as u64 {
            return Err(format!("range {offset}..{end} exceeds allocation of {}", state.bytes.len()));
        }
        Ok(state.bytes[offset as usize..end as usize].to_vec())
    }

    fn write_memory_range(&mut self, memory: Option<u64>, offset: u64, data: &[u8]) -> std::result::Result<(), String> {
        let memory = memory.ok_or("resource has no memory bound")?;
        let state = self
            .memories
            .get_mut(&memory)
            .ok_or_else(|| format!("unknown memory {memory:#x}"))?;
        let end = offset as usize + data.len();
        if end > state.bytes.len() {
            return Err(format!("range {offset}..{end} exceeds allocation of {}", state.bytes.len()));
        }
        state.bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub(super) fn read_buffer(&self, buffer: u64, offset: u64, range: u64) -> std::result::Result<Vec<u8>, String> {
        let state = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| format!("unknown buffer {buffer:#x}"))?;
        let len = range.min(state.size.saturating_sub(offset));
        self.read_memory_range(state.memory, offset, len)
    }

    pub(super) fn write_buffer(&mut self, buffer: u64, offset: u64, data: &[u8]) -> std::result::Result<(), String> {
        let state = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| format!("unknown buffer {buffer:#x}"))?;
        if offset + data.len() as u64 > state.size {
            return Err(format!("write past the end of buffer {buffer:#x}"));
        }
        let memory = state.memory;
        self.write_memory_range(memory, offset, data)
    }

    pub(super) fn view_image(&self, view: u64) -> std::result::Result<u64, String> {
        self.views
            .get(&view)
            .copied()
            .ok_or_else(|| format!("unknown image view {view:#x}"))
    }

    pub(super) fn image_desc(&self, image: u64) -> std::result::Result<ImageDesc, String> {
        self.images
            .get(&image)
            .map(|state| state.desc)
            .ok_or_else(|| format!("unknown image {image:#x}"))
    }

    fn accessed_image(&self, image: u64, layout: vk::ImageLayout) -> std::result::Result<&ImageState, String> {
        let state = self
            .images
            .get(&image)
            .ok_or_else(|| format!("unknown image {image:#x}"))?;
        if state.layout != layout {
            return Err(format!(
                "image {image:#x} is in {:?}, accessed as {layout:?}",
                state.layout
            ));
        }
        Ok(state)
    }

    pub(super) fn read_image(&self, image: u64, layout: vk::ImageLayout) -> std::result::Result<Vec<u8>, String> {
        let state = self.accessed_image(image, layout)?;
        self.read_memory_range(state.memory, 0, image_bytes(&state.desc))
    }

    pub(super) fn write_image(
        &mut self,
        image: u64,
        layout: vk::ImageLayout,
        data: &[u8],
    ) -> std::result::Result<(), String> {
        let state = self.accessed_image(image, layout)?;
        let expected = image_bytes(&state.desc);
        if data.len() as u64 != expected {
            return Err(format!("image write of {} bytes, expected {expected}", data.len()));
        }
        let memory = state.memory;
        self.write_memory_range(memory, 0, data)
    }
}

/// Bindings that persist between commands of one submission.
#[derive(Default)]
struct Bound {
    compute_pipeline: Option<u64>,
    compute_set: Option<u64>,
    graphics_pipeline: Option<u64>,
    push_constants: Vec<u8>,
    render_pass: Option<(u64, u64, Vec<ClearValue>)>,
    vertex_buffer: Option<u64>,
    index_buffer: Option<(u64, u64, vk::IndexType)>,
}

/// A logical device of the mock instance.
pub(crate) struct MockDevice {
    raw: u64,
    desc: DeviceDesc,
    memory_types: Vec<vk::MemoryPropertyFlags>,
    shared: Arc<Shared>,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub(super) fn new(
        raw: u64,
        desc: DeviceDesc,
        memory_types: Vec<vk::MemoryPropertyFlags>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            raw,
            desc,
            memory_types,
            shared,
            state: Mutex::new(DeviceState::default()),
        }
    }

    pub(super) fn image_layout(&self, image: u64) -> Option<vk::ImageLayout> {
        self.state.lock().images.get(&image).map(|state| state.layout)
    }

    pub(super) fn memory_bytes(&self, memory: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let bytes = &state.memories.get(&memory)?.bytes;
        bytes.get(..len).map(<[u8]>::to_vec)
    }

    fn create(&self, kind: ObjectKind) -> u64 {
        self.shared.create(kind, self.raw)
    }

    fn violate(&self, message: String) {
        self.shared.violate(message);
    }

    fn type_bits(&self) -> u32 {
        (1u32 << self.memory_types.len()) - 1
    }

    fn execute(&self, state: &mut DeviceState, commands: &[Command]) {
        let mut bound = Bound::default();
        for command in commands {
            match command {
                Command::ImageBarrier(barrier) => self.barrier(state, barrier),
                Command::CopyBuffer { src, dst, size } => {
                    let result = state
                        .read_buffer(src.as_raw(), 0, *size)
                        .and_then(|bytes| {
                            if (bytes.len() as u64) < *size {
                                return Err(format!("copy of {size} bytes overruns the source"));
                            }
                            state.write_buffer(dst.as_raw(), 0, &bytes)
                        });
                    if let Err(e) = result {
                        self.violate(format!("vkCmdCopyBuffer: {e}"));
                    }
                }
                Command::CopyBufferToImage {
                    buffer,
                    image,
                    layout,
                    ..
                } => {
                    if !matches!(
                        *layout,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::GENERAL
                    ) {
                        self.violate(format!("vkCmdCopyBufferToImage: invalid layout {layout:?}"));
                        continue;
                    }
                    let result = state.image_desc(image.as_raw()).and_then(|desc| {
                        let bytes = state.read_buffer(buffer.as_raw(), 0, image_bytes(&desc))?;
                        state.write_image(image.as_raw(), *layout, &bytes)
                    });
                    if let Err(e) = result {
                        self.violate(format!("vkCmdCopyBufferToImage: {e}"));
                    }
                }
                Command::CopyImageToBuffer {
                    image,
                    layout,
                    buffer,
                    ..
                } => {
                    if !matches!(
                        *layout,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::GENERAL
                    ) {
                        self.violate(format!("vkCmdCopyImageToBuffer: invalid layout {layout:?}"));
                        continue;
                    }
                    let result = state
                        .read_image(image.as_raw(), *layout)
                        .and_then(|bytes| state.write_buffer(buffer.as_raw(), 0, &bytes));
                    if let Err(e) = result {
                        self.violate(format!("vkCmdCopyImageToBuffer: {e}"));
                    }
                }
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => {
                    let raw = pipeline.as_raw();
                    match (state.pipelines.get(&raw), *bind_point) {
                        (Some(PipelineState::Compute { .. }), vk::PipelineBindPoint::COMPUTE) => {
                            bound.compute_pipeline = Some(raw);
                        }
                        (Some(PipelineState::Graphics), vk::PipelineBindPoint::GRAPHICS) => {
                            bound.graphics_pipeline = Some(raw);
                        }
                        _ => self.violate(format!(
                            "vkCmdBindPipeline: {raw:#x} is not a {bind_point:?} pipeline"
                        )),
                    }
                }
                Command::BindDescriptorSet {
                    bind_point, set, ..
                } => {
                    let raw = set.as_raw();
                    if !state.sets.contains_key(&raw) {
                        self.violate(format!("vkCmdBindDescriptorSets: unknown set {raw:#x}"));
                    } else if *bind_point == vk::PipelineBindPoint::COMPUTE {
                        bound.compute_set = Some(raw);
                    }
                }
                Command::PushConstants { offset, data, .. } => {
                    let end = *offset as usize + data.len();
                    if bound.push_constants.len() < end {
                        bound.push_constants.resize(end, 0);
                    }
                    bound.push_constants[*offset as usize..end].copy_from_slice(data);
                }
                Command::Dispatch { groups } => self.dispatch(state, &bound, *groups),
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    clear_values,
                    ..
                } => {
                    if bound.render_pass.is_some() {
                        self.violate("vkCmdBeginRenderPass: render pass already active".to_string());
                    }
                    bound.render_pass = Some((
                        render_pass.as_raw(),
                        framebuffer.as_raw(),
                        clear_values.clone(),
                    ));
                }
                Command::EndRenderPass => match bound.render_pass.take() {
                    Some((render_pass, framebuffer, clears)) => {
                        self.end_render_pass(state, render_pass, framebuffer, &clears);
                    }
                    None => self.violate("vkCmdEndRenderPass: no active render pass".to_string()),
                },
                Command::BindVertexBuffer { buffer, .. } => {
                    bound.vertex_buffer = Some(buffer.as_raw());
                }
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => bound.index_buffer = Some((buffer.as_raw(), *offset, *index_type)),
                Command::DrawIndexed {
                    index_count,
                    first_index,
                    ..
                } => self.draw(state, &bound, *index_count, *first_index),
            }
        }
        if bound.render_pass.is_some() {
            self.violate("command buffer ended inside a render pass".to_string());
        }
    }

    fn barrier(&self, state: &mut DeviceState, barrier: &ImageBarrier) {
        let raw = barrier.image.as_raw();
        let Some(image) = state.images.get_mut(&raw) else {
            self.violate(format!("vkCmdPipelineBarrier2: unknown image {raw:#x}"));
            return;
        };
        if barrier.new_layout == vk::ImageLayout::UNDEFINED {
            self.violate("vkCmdPipelineBarrier2: transition to UNDEFINED".to_string());
            return;
        }
        if barrier.old_layout != vk::ImageLayout::UNDEFINED && barrier.old_layout != image.layout {
            self.violate(format!(
                "vkCmdPipelineBarrier2: image {raw:#x} is in {:?}, barrier assumes {:?}",
                image.layout, barrier.old_layout
            ));
        }
        image.layout = barrier.new_layout;
    }

    fn dispatch(&self, state: &mut DeviceState, bound: &Bound, groups: [u32; 3]) {
        let Some(pipeline) = bound.compute_pipeline else {
            self.violate("vkCmdDispatch: no compute pipeline bound".to_string());
            return;
        };
        let code = match state.pipelines.get(&pipeline) {
            Some(PipelineState::Compute { code }) => code.clone(),
            _ => {
                self.violate(format!("vkCmdDispatch: {pipeline:#x} is not a compute pipeline"));
                return;
            }
        };
        self.shared.stats.lock().dispatches += 1;
        let Some(kernel) = self.shared.kernel(&code) else {
            self.violate(format!("vkCmdDispatch: no kernel registered for pipeline {pipeline:#x}"));
            return;
        };
        let mut io = KernelIo {
            state,
            set: bound.compute_set,
            groups,
            push_constants: &bound.push_constants,
        };
        if let Err(e) = kernel(&mut io) {
            self.violate(format!("kernel failed: {e}"));
        }
    }

    fn draw(&self, state: &DeviceState, bound: &Bound, index_count: u32, first_index: u32) {
        if bound.render_pass.is_none() {
            self.violate("vkCmdDrawIndexed: outside a render pass".to_string());
            return;
        }
        if bound.graphics_pipeline.is_none() {
            self.violate("vkCmdDrawIndexed: no graphics pipeline bound".to_string());
        }
        if bound.vertex_buffer.is_none() {
            self.violate("vkCmdDrawIndexed: no vertex buffer bound".to_string());
        }
        match bound.index_buffer {
            Some((buffer, offset, index_type)) => {
                let width = if index_type == vk::IndexType::UINT16 { 2 } else { 4 };
                let end = offset + u64::from(first_index + index_count) * width;
                let size = state.buffers.get(&buffer).map_or(0, |b| b.size);
                if end > size {
                    self.violate(format!(
                        "vkCmdDrawIndexed: indices end at {end}, index buffer holds {size}"
                    ));
                }
            }
            None => self.violate("vkCmdDrawIndexed: no index buffer bound".to_string()),
        }
        self.shared.stats.lock().draws += 1;
    }

    fn end_render_pass(&self, state: &mut DeviceState, render_pass: u64, framebuffer: u64, clears: &[ClearValue]) {
        let Some(desc) = state.render_passes.get(&render_pass).cloned() else {
            self.violate(format!("vkCmdBeginRenderPass: unknown render pass {render_pass:#x}"));
            return;
        };
        let Some(fb) = state.framebuffers.get(&framebuffer).cloned() else {
            self.violate(format!("vkCmdBeginRenderPass: unknown framebuffer {framebuffer:#x}"));
            return;
        };
        let attachments = desc.color.iter().chain(desc.depth.iter());
        for (index, (attachment, view)) in attachments.zip(&fb.attachments).enumerate() {
            let Ok(image) = state.view_image(view.as_raw()) else {
                self.violate(format!("framebuffer attachment {index} has no view"));
                continue;
            };
            let Some(image_state) = state.images.get(&image) else {
                continue;
            };
            let texels = u64::from(image_state.desc.extent.width) * u64::from(image_state.desc.extent.height);
            let fill: Option<Vec<u8>> = match clears.get(index) {
                Some(ClearValue::DepthStencil { depth, .. })
                    if image_state.desc.format == vk::Format::D32_SFLOAT =>
                {
                    Some(depth.to_le_bytes().to_vec())
                }
                Some(ClearValue::Color(color)) if format_size(image_state.desc.format) == 4 => {
                    Some(color.iter().map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8).collect())
                }
                _ => None,
            };
            let memory = image_state.memory;
            if let Some(texel) = fill {
                let bytes: Vec<u8> = (0..texels).flat_map(|_| texel.iter().copied()).collect();
                if let Err(e) = state.write_memory_range(memory, 0, &bytes) {
                    self.violate(format!("render pass clear: {e}"));
                }
            }
            if let Some(image_state) = state.images.get_mut(&image) {
                image_state.layout = attachment.final_layout;
            }
        }
    }
}

impl DeviceApi for MockDevice {
    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        let raw = 0x5000_0000 + (self.raw << 8) + u64::from(family) * 16 + u64::from(index);
        self.state.lock().queues.insert(raw, family);
        vk::Queue::from_raw(raw)
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> Result<vk::Buffer> {
        self.shared.check("vkCreateBuffer")?;
        if size == 0 {
            self.violate("vkCreateBuffer: zero size".to_string());
        }
        let raw = self.create(ObjectKind::Buffer);
        self.state
            .lock()
            .buffers
            .insert(raw, BufferState { size, memory: None });
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        if self.shared.destroy(ObjectKind::Buffer, buffer.as_raw()) {
            self.state.lock().buffers.remove(&buffer.as_raw());
        }
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .map_or(0, |state| state.size);
        vk::MemoryRequirements {
            size: align(size),
            alignment: ALIGNMENT,
            memory_type_bits: self.type_bits(),
        }
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> Result<()> {
        self.shared.check("vkBindBufferMemory")?;
        let mut state = self.state.lock();
        let Some(size) = state.buffers.get(&buffer.as_raw()).map(|b| b.size) else {
            self.violate(format!("vkBindBufferMemory: unknown buffer {:#x}", buffer.as_raw()));
            return Ok(());
        };
        match state.memories.get_mut(&memory.as_raw()) {
            Some(mem) if (mem.bytes.len() as u64) >= size && mem.bound.is_none() => {
                mem.bound = Some(buffer.as_raw());
            }
            _ => {
                self.violate(format!("vkBindBufferMemory: memory {:#x} unusable", memory.as_raw()));
                return Ok(());
            }
        }
        if let Some(b) = state.buffers.get_mut(&buffer.as_raw()) {
            b.memory = Some(memory.as_raw());
        }
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        self.shared.check("vkCreateImage")?;
        if desc.extent.width == 0 || desc.extent.height == 0 {
            self.violate("vkCreateImage: zero extent".to_string());
        }
        let raw = self.create(ObjectKind::Image);
        self.state.lock().images.insert(
            raw,
            ImageState {
                desc: *desc,
                memory: None,
                layout: vk::ImageLayout::UNDEFINED,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let raw = image.as_raw();
        let mut state = self.state.lock();
        let views = state.views.values().filter(|&&img| img == raw).count();
        if views > 0 {
            self.violate(format!("vkDestroyImage: image {raw:#x} still has {views} view(s)"));
        }
        if self.shared.destroy(ObjectKind::Image, raw) {
            state.images.remove(&raw);
        }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = self
            .state
            .lock()
            .images
            .get(&image.as_raw())
            .map_or(0, |state| image_bytes(&state.desc));
        vk::MemoryRequirements {
            size: align(size),
            alignment: ALIGNMENT,
            memory_type_bits: self.type_bits(),
        }
    }

    fn bind_image_memory(&self, image: vk::Image, memory: vk::DeviceMemory) -> Result<()> {
        self.shared.check("vkBindImageMemory")?;
        let mut state = self.state.lock();
        let Some(size) = state.images.get(&image.as_raw()).map(|i| image_bytes(&i.desc)) else {
            self.violate(format!("vkBindImageMemory: unknown image {:#x}", image.as_raw()));
            return Ok(());
        };
        match state.memories.get_mut(&memory.as_raw()) {
            Some(mem) if (mem.bytes.len() as u64) >= size && mem.bound.is_none() => {
                mem.bound = Some(image.as_raw());
            }
            _ => {
                self.violate(format!("vkBindImageMemory: memory {:#x} unusable", memory.as_raw()));
                return Ok(());
            }
        }
        if let Some(i) = state.images.get_mut(&image.as_raw()) {
            i.memory = Some(memory.as_raw());
        }
        Ok(())
    }

    fn allocate_memory(&self, size: u64, type_index: u32) -> Result<vk::DeviceMemory> {
        self.shared.check("vkAllocateMemory")?;
        let flags = self
            .memory_types
            .get(type_index as usize)
            .copied()
            .ok_or(GpuError::ApiCall {
                call: "vkAllocateMemory",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            })?;
        let raw = self.create(ObjectKind::Memory);
        self.state.lock().memories.insert(
            raw,
            MemoryState {
                bytes: vec![0; size as usize],
                flags,
                bound: None,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let raw = memory.as_raw();
        let mut state = self.state.lock();
        if let Some(owner) = state.memories.get(&raw).and_then(|m| m.bound) {
            if state.buffers.contains_key(&owner) || state.images.contains_key(&owner) {
                self.violate(format!("vkFreeMemory: memory {raw:#x} still bound to {owner:#x}"));
            }
        }
        if self.shared.destroy(ObjectKind::Memory, raw) {
            state.memories.remove(&raw);
        }
    }

    fn write_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> Result<()> {
        self.shared.check("vkMapMemory")?;
        let mut state = self.state.lock();
        let map_failed = GpuError::ApiCall {
            call: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        };
        let Some(mem) = state.memories.get_mut(&memory.as_raw()) else {
            return Err(map_failed);
        };
        let end = offset as usize + data.len();
        if !mem.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) || end > mem.bytes.len() {
            return Err(map_failed);
        }
        mem.bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn read_memory(&self, memory: vk::DeviceMemory, offset: u64, out: &mut [u8]) -> Result<()> {
        self.shared.check("vkMapMemory")?;
        let state = self.state.lock();
        let map_failed = GpuError::ApiCall {
            call: "vkMapMemory",
            result: vk::Result::ERROR_MEMORY_MAP_FAILED,
        };
        let Some(mem) = state.memories.get(&memory.as_raw()) else {
            return Err(map_failed);
        };
        let end = offset as usize + out.len();
        if !mem.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) || end > mem.bytes.len() {
            return Err(map_failed);
        }
        out.copy_from_slice(&mem.bytes[offset as usize..end]);
        Ok(())
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        self.shared.check("vkCreateImageView")?;
        let mut state = self.state.lock();
        if !state.images.contains_key(&image.as_raw()) {
            self.violate(format!("vkCreateImageView: unknown image {:#x}", image.as_raw()));
        }
        let raw = self.create(ObjectKind::ImageView);
        state.views.insert(raw, image.as_raw());
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        if self.shared.destroy(ObjectKind::ImageView, view.as_raw()) {
            self.state.lock().views.remove(&view.as_raw());
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        self.shared.check("vkCreateSampler")?;
        if desc.max_anisotropy.is_some() && self.desc.features.sampler_anisotropy == vk::FALSE {
            self.violate("vkCreateSampler: anisotropy used without the feature enabled".to_string());
        }
        let raw = self.create(ObjectKind::Sampler);
        self.state.lock().samplers.push(raw);
        Ok(vk::Sampler::from_raw(raw))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        if self.shared.destroy(ObjectKind::Sampler, sampler.as_raw()) {
            self.state.lock().samplers.retain(|&s| s != sampler.as_raw());
        }
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> Result<vk::DescriptorSetLayout> {
        self.shared.check("vkCreateDescriptorSetLayout")?;
        let raw = self.create(ObjectKind::DescriptorSetLayout);
        self.state.lock().set_layouts.insert(raw, bindings.to_vec());
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        if self.shared.destroy(ObjectKind::DescriptorSetLayout, layout.as_raw()) {
            self.state.lock().set_layouts.remove(&layout.as_raw());
        }
    }

    fn create_descriptor_pool(&self, _sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool> {
        self.shared.check("vkCreateDescriptorPool")?;
        let raw = self.create(ObjectKind::DescriptorPool);
        self.state.lock().pools.insert(
            raw,
            PoolState {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if self.shared.destroy(ObjectKind::DescriptorPool, pool.as_raw()) {
            let mut state = self.state.lock();
            if let Some(pool) = state.pools.remove(&pool.as_raw()) {
                for set in pool.sets {
                    state.sets.remove(&set);
                }
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        self.shared.check("vkAllocateDescriptorSets")?;
        let mut state = self.state.lock();
        let bindings = state
            .set_layouts
            .get(&layout.as_raw())
            .cloned()
            .ok_or(GpuError::ApiCall {
                call: "vkAllocateDescriptorSets",
                result: vk::Result::ERROR_UNKNOWN,
            })?;
        let out_of_pool = GpuError::ApiCall {
            call: "vkAllocateDescriptorSets",
            result: vk::Result::ERROR_OUT_OF_POOL_MEMORY,
        };
        let raw = self.shared.next_handle();
        let pool_state = state.pools.get_mut(&pool.as_raw()).ok_or(GpuError::ApiCall {
            call: "vkAllocateDescriptorSets",
            result: vk::Result::ERROR_UNKNOWN,
        })?;
        if pool_state.sets.len() as u32 >= pool_state.max_sets {
            return Err(out_of_pool);
        }
        pool_state.sets.push(raw);
        state.sets.insert(
            raw,
            SetState {
                bindings,
                writes: HashMap::new(),
            },
        );
        Ok(vk::DescriptorSet::from_raw(raw))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        let Some(set_state) = state.sets.get_mut(&set.as_raw()) else {
            self.violate(format!("vkUpdateDescriptorSets: unknown set {:#x}", set.as_raw()));
            return;
        };
        for write in writes {
            let declared = set_state.bindings.iter().find(|b| b.binding == write.binding);
            match declared {
                Some(binding) if binding.kind == write.resource.kind() => {
                    set_state.writes.insert(write.binding, write.resource);
                }
                _ => self.violate(format!(
                    "vkUpdateDescriptorSets: binding {} does not accept {:?}",
                    write.binding,
                    write.resource.kind()
                )),
            }
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        self.shared.check("vkCreateShaderModule")?;
        if code.first() != Some(&super::SPIRV_MAGIC) {
            return Err(GpuError::ApiCall {
                call: "vkCreateShaderModule",
                result: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        let raw = self.create(ObjectKind::ShaderModule);
        self.state.lock().modules.insert(raw, code.to_vec());
        Ok(vk::ShaderModule::from_raw(raw))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        if self.shared.destroy(ObjectKind::ShaderModule, module.as_raw()) {
            self.state.lock().modules.remove(&module.as_raw());
        }
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        self.shared.check("vkCreatePipelineLayout")?;
        let raw = self.create(ObjectKind::PipelineLayout);
        self.state.lock().pipeline_layouts.push(raw);
        Ok(vk::PipelineLayout::from_raw(raw))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        if self.shared.destroy(ObjectKind::PipelineLayout, layout.as_raw()) {
            self.state
                .lock()
                .pipeline_layouts
                .retain(|&l| l != layout.as_raw());
        }
    }

    fn create_compute_pipeline(&self, module: vk::ShaderModule, _layout: vk::PipelineLayout) -> Result<vk::Pipeline> {
        self.shared.check("vkCreateComputePipelines")?;
        let mut state = self.state.lock();
        let code = state
            .modules
            .get(&module.as_raw())
            .cloned()
            .ok_or(GpuError::ApiCall {
                call: "vkCreateComputePipelines",
                result: vk::Result::ERROR_UNKNOWN,
            })?;
        let raw = self.create(ObjectKind::Pipeline);
        state.pipelines.insert(raw, PipelineState::Compute { code });
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<vk::Pipeline> {
        self.shared.check("vkCreateGraphicsPipelines")?;
        let mut state = self.state.lock();
        for (stage, module) in &desc.stages {
            if !state.modules.contains_key(&module.as_raw()) {
                self.violate(format!("vkCreateGraphicsPipelines: {stage:?} module is not live"));
            }
        }
        if desc.patch_control_points.is_some() && self.desc.features.tessellation_shader == vk::FALSE {
            self.violate("vkCreateGraphicsPipelines: tessellation without the feature enabled".to_string());
        }
        *self.shared.last_graphics_pipeline.lock() = Some(desc.clone());
        let raw = self.create(ObjectKind::Pipeline);
        state.pipelines.insert(raw, PipelineState::Graphics);
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if self.shared.destroy(ObjectKind::Pipeline, pipeline.as_raw()) {
            self.state.lock().pipelines.remove(&pipeline.as_raw());
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        self.shared.check("vkCreateRenderPass")?;
        let raw = self.create(ObjectKind::RenderPass);
        self.state.lock().render_passes.insert(raw, desc.clone());
        Ok(vk::RenderPass::from_raw(raw))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        if self.shared.destroy(ObjectKind::RenderPass, render_pass.as_raw()) {
            self.state.lock().render_passes.remove(&render_pass.as_raw());
        }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<vk::Framebuffer> {
        self.shared.check("vkCreateFramebuffer")?;
        let mut state = self.state.lock();
        match state.render_passes.get(&desc.render_pass.as_raw()) {
            Some(pass) => {
                let expected = pass.color.len() + usize::from(pass.depth.is_some());
                if expected != desc.attachments.len() {
                    self.violate(format!(
                        "vkCreateFramebuffer: {} attachments for a pass with {expected}",
                        desc.attachments.len()
                    ));
                }
            }
            None => self.violate("vkCreateFramebuffer: unknown render pass".to_string()),
        }
        let raw = self.create(ObjectKind::Framebuffer);
        state.framebuffers.insert(raw, desc.clone());
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        if self.shared.destroy(ObjectKind::Framebuffer, framebuffer.as_raw()) {
            self.state.lock().framebuffers.remove(&framebuffer.as_raw());
        }
    }

    fn create_command_pool(&self, family: u32, _flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        self.shared.check("vkCreateCommandPool")?;
        if !self.desc.queue_families.contains(&family) {
            self.violate(format!("vkCreateCommandPool: family {family} has no queue"));
        }
        let raw = self.create(ObjectKind::CommandPool);
        self.state.lock().command_pools.insert(raw, family);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if self.shared.destroy(ObjectKind::CommandPool, pool.as_raw()) {
            let mut state = self.state.lock();
            state.command_pools.remove(&pool.as_raw());
            state.command_buffers.retain(|_, cmd| cmd.pool != pool.as_raw());
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        self.shared.check("vkAllocateCommandBuffers")?;
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool.as_raw()) {
            self.violate(format!("vkAllocateCommandBuffers: unknown pool {:#x}", pool.as_raw()));
        }
        let raw = self.create(ObjectKind::CommandBuffer);
        state.command_buffers.insert(
            raw,
            CommandBufferState {
                pool: pool.as_raw(),
                recording: false,
                commands: Vec::new(),
            },
        );
        Ok(vk::CommandBuffer::from_raw(raw))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        let mut state = self.state.lock();
        if let Some(buffer) = state.command_buffers.get(&cmd.as_raw()) {
            if buffer.pool != pool.as_raw() {
                self.violate(format!(
                    "vkFreeCommandBuffers: {:#x} freed to the wrong pool",
                    cmd.as_raw()
                ));
            }
        }
        if self.shared.destroy(ObjectKind::CommandBuffer, cmd.as_raw()) {
            state.command_buffers.remove(&cmd.as_raw());
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time: bool) -> Result<()> {
        self.shared.check("vkBeginCommandBuffer")?;
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd.as_raw()) {
            Some(buffer) => {
                buffer.recording = true;
                buffer.commands.clear();
            }
            None => self.violate(format!("vkBeginCommandBuffer: unknown {:#x}", cmd.as_raw())),
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.shared.check("vkEndCommandBuffer")?;
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd.as_raw()) {
            Some(buffer) if buffer.recording => buffer.recording = false,
            _ => self.violate(format!("vkEndCommandBuffer: {:#x} is not recording", cmd.as_raw())),
        }
        Ok(())
    }

    fn record(&self, cmd: vk::CommandBuffer, command: &Command) {
        let mut state = self.state.lock();
        match state.command_buffers.get_mut(&cmd.as_raw()) {
            Some(buffer) if buffer.recording => buffer.commands.push(command.clone()),
            _ => self.violate(format!("record into {:#x} which is not recording", cmd.as_raw())),
        }
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        self.shared.check("vkCreateFence")?;
        let raw = self.create(ObjectKind::Fence);
        self.state.lock().fences.insert(raw, false);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        if self.shared.destroy(ObjectKind::Fence, fence.as_raw()) {
            self.state.lock().fences.remove(&fence.as_raw());
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        self.shared.check("vkWaitForFences")?;
        let state = self.state.lock();
        match state.fences.get(&fence.as_raw()) {
            Some(&signaled) => Ok(signaled),
            None => {
                self.violate(format!("vkWaitForFences: unknown fence {:#x}", fence.as_raw()));
                Ok(false)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.shared.check("vkResetFences")?;
        if let Some(signaled) = self.state.lock().fences.get_mut(&fence.as_raw()) {
            *signaled = false;
        }
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> Result<()> {
        self.shared.check("vkQueueSubmit")?;
        let mut state = self.state.lock();
        let Some(&queue_family) = state.queues.get(&queue.as_raw()) else {
            self.violate(format!("vkQueueSubmit: unknown queue {:#x}", queue.as_raw()));
            return Ok(());
        };
        for cmd in command_buffers {
            let (commands, pool) = match state.command_buffers.get(&cmd.as_raw()) {
                Some(buffer) if !buffer.recording => (buffer.commands.clone(), buffer.pool),
                _ => {
                    self.violate(format!("vkQueueSubmit: {:#x} is not executable", cmd.as_raw()));
                    continue;
                }
            };
            let pool_family = state.command_pools.get(&pool).copied();
            if pool_family != Some(queue_family) {
                self.violate(format!(
                    "vkQueueSubmit: {:#x} from pool family {:?} submitted to queue family {}",
                    cmd.as_raw(),
                    pool_family,
                    queue_family
                ));
                continue;
            }
            self.execute(&mut state, &commands);
        }
        if fence != vk::Fence::null() {
            let hang = self.shared.hang_fences.load(std::sync::atomic::Ordering::SeqCst);
            match state.fences.get_mut(&fence.as_raw()) {
                Some(signaled) => *signaled = !hang,
                None => self.violate(format!("vkQueueSubmit: unknown fence {:#x}", fence.as_raw())),
            }
        }
        self.shared.stats.lock().submits += 1;
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        self.shared.check("vkQueueWaitIdle")?;
        if !self.state.lock().queues.contains_key(&queue.as_raw()) {
            self.violate(format!("vkQueueWaitIdle: unknown queue {:#x}", queue.as_raw()));
        }
        self.shared.stats.lock().queue_idles += 1;
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.shared.check("vkDeviceWaitIdle")?;
        self.shared.stats.lock().device_idles += 1;
        Ok(())
    }

    fn destroy_device(&self) {
        let children = self.shared.ledger.lock().live_children(self.raw);
        if !children.is_empty() {
            self.violate(format!("vkDestroyDevice: live children {children:?}"));
        }
        self.shared.destroy(ObjectKind::Device, self.raw);
    }
}
