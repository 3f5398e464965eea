//! Shader libraries, entry points and pipeline states.
//!
//! WGSL source is parsed and validated with naga on every backend, so a
//! broken shader fails the same way on the CPU backend as on a GPU. Each
//! entry point is reflected into a [`Function`]: stage, `@workgroup_size`
//! and the bindings it actually uses.
//!
//! Binding convention:
//!
//! | WGSL                      | Slot                                        |
//! |---------------------------|---------------------------------------------|
//! | `@group(0) @binding(i)`   | buffer slot `i` (storage, uniform or bytes) |
//! | `@group(1) @binding(i)`   | texture slot `i` (sampled or storage)       |

use std::sync::Arc;

use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, ImageClass, ImageDimension, ScalarKind, ShaderStage, StorageAccess, StorageFormat, TypeInner};
use pixlane_core::{TextureFormat, ThreadgroupSize};

use crate::backend::HostKernel;
use crate::device::Device;
use crate::encoder::PrimitiveType;
use crate::resource::{DeviceId, ResourceKind, Tracked};
use crate::{ComputeError, ComputeResult};

#[cfg(feature = "wgpu")]
use crate::backend::wgpu_backend::{WgpuComputePipeline, WgpuRenderPipeline};

/// Bind group of buffer slots.
pub const BUFFER_GROUP: u32 = 0;
/// Bind group of texture slots.
pub const TEXTURE_GROUP: u32 = 1;

/// Pipeline stage of an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionStage {
    Compute,
    Vertex,
    Fragment,
}

/// How an entry point uses a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// `var<storage, read>` or `var<storage, read_write>`.
    StorageBuffer { read_only: bool },
    /// `var<uniform>`.
    UniformBuffer,
    /// `texture_2d<f32>`: read usage.
    SampledTexture,
    /// `texture_storage_2d<format, write>`: write usage.
    StorageTexture { format: TextureFormat },
}

impl BindingKind {
    /// Whether the entry point may write the bound resource.
    pub fn is_writable(&self) -> bool {
        matches!(self, Self::StorageBuffer { read_only: false } | Self::StorageTexture { .. })
    }

    pub fn is_texture(&self) -> bool {
        matches!(self, Self::SampledTexture | Self::StorageTexture { .. })
    }
}

/// One reflected resource binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub slot: u32,
    pub kind: BindingKind,
    /// WGSL bind group (0 for buffers, 1 for textures).
    pub group: u32,
    /// Variable name in the source.
    pub name: Option<String>,
}

/// Reflected entry point. Bindings the pipeline model cannot express are
/// kept as problems and reported by pipeline creation.
#[derive(Debug)]
struct EntryInfo {
    name: String,
    stage: FunctionStage,
    threadgroup: ThreadgroupSize,
    bindings: Vec<BindingInfo>,
    problems: Vec<String>,
}

pub(crate) enum RawLibrary {
    Cpu,
    #[cfg(feature = "wgpu")]
    Wgpu(wgpu::ShaderModule),
}

// =============================================================================
// Compilation
// =============================================================================

/// Parses and validates WGSL. Errors carry naga's rendered diagnostic.
pub(crate) fn compile_wgsl(source: &str) -> ComputeResult<(naga::Module, naga::valid::ModuleInfo)> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| ComputeError::LibraryCreation(e.emit_to_string(source)))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| ComputeError::LibraryCreation(e.emit_to_string(source)))?;
    Ok((module, info))
}

fn storage_format(format: StorageFormat) -> Option<TextureFormat> {
    match format {
        StorageFormat::Rgba8Unorm => Some(TextureFormat::Rgba8Unorm),
        StorageFormat::Bgra8Unorm => Some(TextureFormat::Bgra8Unorm),
        StorageFormat::Rgba16Float => Some(TextureFormat::Rgba16Float),
        StorageFormat::Rgba32Float => Some(TextureFormat::Rgba32Float),
        StorageFormat::R32Float => Some(TextureFormat::R32Float),
        _ => None,
    }
}

fn binding_kind(module: &naga::Module, var: &naga::GlobalVariable) -> Result<BindingKind, String> {
    match var.space {
        AddressSpace::Storage { access } => Ok(BindingKind::StorageBuffer { read_only: !access.contains(StorageAccess::STORE) }),
        AddressSpace::Uniform => Ok(BindingKind::UniformBuffer),
        AddressSpace::Handle => match &module.types[var.ty].inner {
            TypeInner::Image { dim: ImageDimension::D2, arrayed: false, class } => match class {
                ImageClass::Sampled { kind: ScalarKind::Float, multi: false } => Ok(BindingKind::SampledTexture),
                ImageClass::Storage { format, access } => {
                    if access.contains(StorageAccess::LOAD) {
                        return Err("read-write storage textures are not supported".into());
                    }
                    storage_format(*format)
                        .map(|format| BindingKind::StorageTexture { format })
                        .ok_or_else(|| format!("storage format {format:?} is not supported"))
                }
                other => Err(format!("texture class {other:?} is not supported")),
            },
            TypeInner::Sampler { .. } => Err("samplers are not supported, use textureLoad".into()),
            _ => Err("only 2-D textures are supported".into()),
        },
        other => Err(format!("address space {other:?} cannot be bound")),
    }
}

fn reflect(module: &naga::Module, info: &naga::valid::ModuleInfo) -> Vec<EntryInfo> {
    module
        .entry_points
        .iter()
        .enumerate()
        .map(|(index, ep)| {
            let usage = info.get_entry_point(index);
            let mut bindings = Vec::new();
            let mut problems = Vec::new();

            for (handle, var) in module.global_variables.iter() {
                if usage[handle].is_empty() {
                    continue;
                }
                let Some(rb) = &var.binding else { continue };
                let label = var.name.as_deref().unwrap_or("<unnamed>");
                match binding_kind(module, var) {
                    Ok(kind) => {
                        let expected = if kind.is_texture() { TEXTURE_GROUP } else { BUFFER_GROUP };
                        if rb.group != expected {
                            problems.push(format!(
                                "`{label}` is in @group({}), expected @group({expected})",
                                rb.group
                            ));
                            continue;
                        }
                        bindings.push(BindingInfo { slot: rb.binding, kind, group: rb.group, name: var.name.clone() });
                    }
                    Err(msg) => problems.push(format!("`{label}`: {msg}")),
                }
            }
            bindings.sort_by_key(|b| (b.group, b.slot));

            let stage = match ep.stage {
                ShaderStage::Compute => FunctionStage::Compute,
                ShaderStage::Vertex => FunctionStage::Vertex,
                ShaderStage::Fragment => FunctionStage::Fragment,
            };
            EntryInfo {
                name: ep.name.clone(),
                stage,
                threadgroup: ThreadgroupSize::from(ep.workgroup_size),
                bindings,
                problems,
            }
        })
        .collect()
}

// =============================================================================
// Library / Function
// =============================================================================

/// Compiled shader source.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

struct LibraryInner {
    device: DeviceId,
    entries: Vec<EntryInfo>,
    raw: RawLibrary,
    _tracked: Tracked,
}

impl Library {
    pub(crate) fn new(device: &Device, module: &naga::Module, info: &naga::valid::ModuleInfo, raw: RawLibrary) -> Self {
        Self {
            inner: Arc::new(LibraryInner {
                device: device.id(),
                entries: reflect(module, info),
                raw,
                _tracked: Tracked::new(device.counters(), ResourceKind::Library),
            }),
        }
    }

    /// Looks up an entry point by name.
    pub fn function(&self, name: &str) -> ComputeResult<Function> {
        self.inner
            .entries
            .iter()
            .position(|e| e.name == name)
            .map(|index| Function { library: self.clone(), index })
            .ok_or_else(|| ComputeError::FunctionNotFound(name.to_string()))
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.inner.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device
    }

    pub(crate) fn raw(&self) -> &RawLibrary {
        &self.inner.raw
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("functions", &self.function_names()).finish()
    }
}

/// A named entry point of a [`Library`]. Keeps its library alive.
#[derive(Clone)]
pub struct Function {
    library: Library,
    index: usize,
}

impl Function {
    fn entry(&self) -> &EntryInfo {
        &self.library.inner.entries[self.index]
    }

    pub fn name(&self) -> &str {
        &self.entry().name
    }

    pub fn stage(&self) -> FunctionStage {
        self.entry().stage
    }

    /// Declared `@workgroup_size`; zero for vertex and fragment stages.
    pub fn threadgroup_size(&self) -> ThreadgroupSize {
        self.entry().threadgroup
    }

    /// Bindings the entry point uses, ordered by group then slot.
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.entry().bindings
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub fn device_id(&self) -> DeviceId {
        self.library.device_id()
    }

    /// Fails if reflection found bindings no pipeline can be built from.
    pub(crate) fn check_bindings(&self) -> ComputeResult<()> {
        let problems = &self.entry().problems;
        if problems.is_empty() {
            return Ok(());
        }
        Err(ComputeError::PipelineCreation(format!("`{}`: {}", self.name(), problems.join("; "))))
    }

    pub(crate) fn expect_stage(&self, stage: FunctionStage) -> ComputeResult<()> {
        if self.stage() != stage {
            return Err(ComputeError::PipelineCreation(format!(
                "`{}` is a {:?} entry point, expected {stage:?}",
                self.name(),
                self.stage()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("stage", &self.stage())
            .field("threadgroup", &self.threadgroup_size())
            .finish()
    }
}

// =============================================================================
// Pipelines
// =============================================================================

pub(crate) enum RawComputePipeline {
    Host(HostKernel),
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuComputePipeline),
}

impl RawComputePipeline {
    pub(crate) fn host_kernel(&self) -> Option<&HostKernel> {
        match self {
            Self::Host(kernel) => Some(kernel),
            #[cfg(feature = "wgpu")]
            _ => None,
        }
    }

    #[cfg(feature = "wgpu")]
    pub(crate) fn as_wgpu(&self) -> Option<&WgpuComputePipeline> {
        match self {
            Self::Wgpu(p) => Some(p),
            _ => None,
        }
    }
}

/// Immutable compute pipeline state. Shareable across encoders and threads.
#[derive(Clone)]
pub struct ComputePipeline {
    inner: Arc<ComputePipelineInner>,
}

struct ComputePipelineInner {
    function: Function,
    raw: RawComputePipeline,
    _tracked: Tracked,
}

impl ComputePipeline {
    pub(crate) fn from_raw(device: &Device, function: Function, raw: RawComputePipeline) -> Self {
        Self {
            inner: Arc::new(ComputePipelineInner {
                function,
                raw,
                _tracked: Tracked::new(device.counters(), ResourceKind::Pipeline),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.function.name()
    }

    pub fn threadgroup_size(&self) -> ThreadgroupSize {
        self.inner.function.threadgroup_size()
    }

    pub fn bindings(&self) -> &[BindingInfo] {
        self.inner.function.bindings()
    }

    pub fn function(&self) -> &Function {
        &self.inner.function
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.function.device_id()
    }

    pub(crate) fn raw(&self) -> &RawComputePipeline {
        &self.inner.raw
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("name", &self.name())
            .field("threadgroup", &self.threadgroup_size())
            .finish()
    }
}

/// Inputs of [`Device::make_render_pipeline`](crate::Device::make_render_pipeline).
///
/// Vertices are pulled by the vertex function from bound buffers; there are
/// no vertex layouts.
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub vertex: Function,
    pub fragment: Function,
    pub color_format: TextureFormat,
    pub primitive: PrimitiveType,
    pub label: Option<String>,
}

impl RenderPipelineDescriptor {
    pub fn new(vertex: Function, fragment: Function, color_format: TextureFormat) -> Self {
        Self { vertex, fragment, color_format, primitive: PrimitiveType::default(), label: None }
    }

    pub fn primitive(mut self, primitive: PrimitiveType) -> Self {
        self.primitive = primitive;
        self
    }

    /// Checks stages and merges both stages' bindings.
    pub(crate) fn merged_bindings(&self) -> ComputeResult<Vec<BindingInfo>> {
        self.vertex.expect_stage(FunctionStage::Vertex)?;
        self.fragment.expect_stage(FunctionStage::Fragment)?;
        self.vertex.check_bindings()?;
        self.fragment.check_bindings()?;

        let mut merged: Vec<BindingInfo> = self.vertex.bindings().to_vec();
        for binding in self.fragment.bindings() {
            match merged.iter().find(|b| b.group == binding.group && b.slot == binding.slot) {
                Some(existing) if existing.kind != binding.kind => {
                    return Err(ComputeError::PipelineCreation(format!(
                        "slot {} is {:?} in `{}` but {:?} in `{}`",
                        binding.slot,
                        existing.kind,
                        self.vertex.name(),
                        binding.kind,
                        self.fragment.name()
                    )));
                }
                Some(_) => {}
                None => merged.push(binding.clone()),
            }
        }
        merged.sort_by_key(|b| (b.group, b.slot));
        Ok(merged)
    }
}

pub(crate) enum RawRenderPipeline {
    #[cfg(feature = "wgpu")]
    Wgpu(WgpuRenderPipeline),
}

/// Immutable render pipeline state.
#[derive(Clone)]
pub struct RenderPipeline {
    inner: Arc<RenderPipelineInner>,
}

struct RenderPipelineInner {
    descriptor: RenderPipelineDescriptor,
    bindings: Vec<BindingInfo>,
    raw: RawRenderPipeline,
    _tracked: Tracked,
}

impl RenderPipeline {
    #[cfg_attr(not(feature = "wgpu"), allow(dead_code))]
    pub(crate) fn from_raw(
        device: &Device,
        descriptor: RenderPipelineDescriptor,
        bindings: Vec<BindingInfo>,
        raw: RawRenderPipeline,
    ) -> Self {
        Self {
            inner: Arc::new(RenderPipelineInner {
                descriptor,
                bindings,
                raw,
                _tracked: Tracked::new(device.counters(), ResourceKind::Pipeline),
            }),
        }
    }

    /// Label, or the vertex function name.
    pub fn name(&self) -> &str {
        self.inner.descriptor.label.as_deref().unwrap_or_else(|| self.inner.descriptor.vertex.name())
    }

    /// Union of vertex and fragment bindings.
    pub fn bindings(&self) -> &[BindingInfo] {
        &self.inner.bindings
    }

    pub fn color_format(&self) -> TextureFormat {
        self.inner.descriptor.color_format
    }

    pub fn primitive(&self) -> PrimitiveType {
        self.inner.descriptor.primitive
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.descriptor.vertex.device_id()
    }

    #[cfg_attr(not(feature = "wgpu"), allow(dead_code))]
    pub(crate) fn raw(&self) -> &RawRenderPipeline {
        &self.inner.raw
    }
}

impl std::fmt::Debug for RenderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("name", &self.name())
            .field("color_format", &self.color_format())
            .field("primitive", &self.primitive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
struct Dims { size: vec4<u32> }

@group(0) @binding(0) var<storage, read> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;
@group(0) @binding(2) var<uniform> dims: Dims;
@group(1) @binding(0) var image: texture_2d<f32>;
@group(1) @binding(1) var out_image: texture_storage_2d<rgba8unorm, write>;

@compute @workgroup_size(8, 8, 1)
fn copy(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < dims.size.x { dst[id.x] = src[id.x]; }
}

@compute @workgroup_size(16, 16)
fn blit(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(out_image, id.xy, textureLoad(image, id.xy, 0));
}
"#;

    fn entries(source: &str) -> Vec<EntryInfo> {
        let (module, info) = compile_wgsl(source).unwrap();
        reflect(&module, &info)
    }

    #[test]
    fn test_reflects_used_bindings_only() {
        let entries = entries(SOURCE);
        let copy = entries.iter().find(|e| e.name == "copy").unwrap();
        assert_eq!(copy.threadgroup, ThreadgroupSize::new(8, 8));
        let kinds: Vec<_> = copy.bindings.iter().map(|b| (b.slot, b.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (0, BindingKind::StorageBuffer { read_only: true }),
                (1, BindingKind::StorageBuffer { read_only: false }),
                (2, BindingKind::UniformBuffer),
            ]
        );

        let blit = entries.iter().find(|e| e.name == "blit").unwrap();
        assert_eq!(blit.bindings.len(), 2);
        assert_eq!(blit.bindings[0].kind, BindingKind::SampledTexture);
        assert_eq!(blit.bindings[1].kind, BindingKind::StorageTexture { format: TextureFormat::Rgba8Unorm });
        assert!(blit.bindings.iter().all(|b| b.group == TEXTURE_GROUP));
    }

    #[test]
    fn test_parse_error_carries_diagnostic() {
        let err = compile_wgsl("@compute @workgroup_size(1) fn main( {").unwrap_err();
        match err {
            ComputeError::LibraryCreation(msg) => assert!(!msg.is_empty()),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_validation_error() {
        let err = compile_wgsl("fn f() -> f32 { return 1u; }").unwrap_err();
        assert!(matches!(err, ComputeError::LibraryCreation(_)));
    }

    #[test]
    fn test_wrong_group_is_a_problem() {
        let entries = entries(
            r#"
@group(2) @binding(0) var<storage, read_write> data: array<u32>;
@compute @workgroup_size(1) fn main() { data[0] = 1u; }
"#,
        );
        assert!(entries[0].bindings.is_empty());
        assert_eq!(entries[0].problems.len(), 1);
    }

    #[test]
    fn test_writable_kinds() {
        assert!(BindingKind::StorageBuffer { read_only: false }.is_writable());
        assert!(!BindingKind::StorageBuffer { read_only: true }.is_writable());
        assert!(!BindingKind::UniformBuffer.is_writable());
        assert!(!BindingKind::SampledTexture.is_writable());
        assert!(BindingKind::StorageTexture { format: TextureFormat::R32Float }.is_writable());
    }
}
