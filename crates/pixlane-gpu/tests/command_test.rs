//! Command path tests on the CPU backend.

use std::sync::{Arc, Mutex};

use pixlane_gpu::{
    Backend, CommandBufferStatus, ComputeError, ComputePipeline, Device, DispatchSize, Drawable, LoadAction,
    IndexType, OutputFormat, PrimitiveType, RenderTarget, StorageMode, Texture, TextureFormat, ThreadgroupSize,
};

const DOUBLE: &str = r#"
@group(0) @binding(0) var<storage, read_write> data: array<f32>;

@compute @workgroup_size(64, 1, 1)
fn double_values(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < arrayLength(&data) { data[id.x] = data[id.x] * 2.0; }
}

@compute @workgroup_size(64, 1, 1)
fn always_fails(@builtin(global_invocation_id) id: vec3<u32>) {
    if id.x < arrayLength(&data) { data[id.x] = 0.0; }
}
"#;

const GROUP: ThreadgroupSize = ThreadgroupSize::new(64, 1);

fn cpu_device() -> Device {
    let device = Device::new(Backend::Cpu).unwrap();
    device.register_host_kernel("double_values", |args| {
        let (threads, _) = args.thread_extent();
        for v in args.buffers.write::<f32>(0)?.iter_mut().take(threads as usize) {
            *v *= 2.0;
        }
        Ok(())
    });
    device.register_host_kernel("always_fails", |_| Err(ComputeError::Execution("kernel refused".into())));
    device
}

fn pipeline(device: &Device, name: &str) -> ComputePipeline {
    let library = device.compile_library(DOUBLE).unwrap();
    device.make_compute_pipeline(&library.function(name).unwrap()).unwrap()
}

type Log = Arc<Mutex<Vec<String>>>;

struct LoggingDrawable {
    texture: Texture,
    log: Log,
}

impl Drawable for LoggingDrawable {
    fn texture(&self) -> &Texture {
        &self.texture
    }

    fn present(self: Box<Self>) {
        self.log.lock().unwrap().push("present".into());
    }
}

#[test]
fn test_double_end_to_end() {
    let device = cpu_device();
    let pipeline = pipeline(&device, "double_values");
    let input: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    let buffer = device.new_buffer_with_data(bytemuck::cast_slice(&input), StorageMode::Shared).unwrap();

    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    assert_eq!(cmd.status(), CommandBufferStatus::Recording);
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &buffer, 0);
    enc.dispatch_threads(1000, 1, GROUP);
    enc.end();
    let committed = cmd.commit();
    committed.wait_until_completed().unwrap();
    assert_eq!(committed.status(), CommandBufferStatus::Completed);
    assert!(committed.error().is_none());

    let out = buffer.download().unwrap().to_vec_of::<f32>();
    for (i, v) in out.iter().enumerate() {
        assert_eq!(*v, i as f32 * 2.0);
    }
}

#[test]
fn test_partial_grid_leaves_tail_untouched() {
    let device = cpu_device();
    let pipeline = pipeline(&device, "double_values");
    let buffer = device
        .new_buffer_with_data(bytemuck::cast_slice(&vec![1.0f32; 128]), StorageMode::Shared)
        .unwrap();

    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &buffer, 0);
    enc.dispatch(DispatchSize::new(1, 1), GROUP);
    enc.end();
    cmd.commit().wait_until_completed().unwrap();

    let out = buffer.download().unwrap().to_vec_of::<f32>();
    assert!(out[..64].iter().all(|v| *v == 2.0));
    assert!(out[64..].iter().all(|v| *v == 1.0));
}

#[test]
fn test_handlers_run_in_order_before_wait_returns() {
    let device = cpu_device();
    let queue = device.new_command_queue().unwrap();
    let log: Log = Arc::default();

    let mut cmd = queue.new_command_buffer().unwrap();
    for i in 0..3 {
        let log = Arc::clone(&log);
        cmd.add_completed_handler(move |status| {
            assert_eq!(status, CommandBufferStatus::Completed);
            log.lock().unwrap().push(format!("handler {i}"));
        });
    }
    cmd.commit().wait_until_completed().unwrap();
    assert_eq!(*log.lock().unwrap(), ["handler 0", "handler 1", "handler 2"]);
}

#[test]
fn test_queue_completes_in_commit_order() {
    let device = cpu_device();
    let pipeline = pipeline(&device, "double_values");
    let buffer = device
        .new_buffer_with_data(bytemuck::cast_slice(&[1.0f32; 64]), StorageMode::Shared)
        .unwrap();
    let queue = device.new_command_queue().unwrap();
    let log: Log = Arc::default();

    let mut committed = Vec::new();
    for i in 0..4 {
        let mut cmd = queue.new_command_buffer().unwrap();
        let mut enc = cmd.compute_encoder();
        enc.set_pipeline(&pipeline);
        enc.set_buffer(0, &buffer, 0);
        enc.dispatch_threads(64, 1, GROUP);
        enc.end();
        let log = Arc::clone(&log);
        cmd.add_completed_handler(move |_| log.lock().unwrap().push(format!("{i}")));
        committed.push(cmd.commit());
    }
    for c in &committed {
        c.wait_until_completed().unwrap();
    }
    assert_eq!(*log.lock().unwrap(), ["0", "1", "2", "3"]);
    assert!(buffer.download().unwrap().to_vec_of::<f32>().iter().all(|v| *v == 16.0));
}

#[test]
fn test_present_happens_after_completion() {
    let device = cpu_device();
    let queue = device.new_command_queue().unwrap();
    let texture = device.new_texture(4, 4, TextureFormat::Rgba8Unorm, false).unwrap();
    let log: Log = Arc::default();

    let mut cmd = queue.new_command_buffer().unwrap();
    let enc = cmd
        .render_encoder(RenderTarget::new(&texture, LoadAction::Clear([1.0, 0.0, 0.0, 1.0])))
        .unwrap();
    enc.end();
    cmd.present(LoggingDrawable { texture: texture.clone(), log: Arc::clone(&log) });
    let handler_log = Arc::clone(&log);
    cmd.add_completed_handler(move |_| handler_log.lock().unwrap().push("handler".into()));
    cmd.commit().wait_until_completed().unwrap();

    assert_eq!(*log.lock().unwrap(), ["present", "handler"]);
    let texels = texture.download(texture.row_bytes()).unwrap();
    assert!(texels.chunks_exact(4).all(|px| px == [255, 0, 0, 255]));
}

#[test]
fn test_failed_kernel_reports_error_and_skips_present() {
    let device = cpu_device();
    let pipeline = pipeline(&device, "always_fails");
    let buffer = device.new_buffer(256, StorageMode::Shared).unwrap();
    let texture = device.new_texture(2, 2, TextureFormat::Bgra8Unorm, false).unwrap();
    let queue = device.new_command_queue().unwrap();
    let log: Log = Arc::default();

    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &buffer, 0);
    enc.dispatch_threads(64, 1, GROUP);
    enc.end();
    cmd.present(LoggingDrawable { texture, log: Arc::clone(&log) });
    let handler_log = Arc::clone(&log);
    cmd.add_completed_handler(move |status| handler_log.lock().unwrap().push(format!("{status:?}")));
    let committed = cmd.commit();

    let err = committed.wait_until_completed().unwrap_err();
    assert!(matches!(err, ComputeError::Execution(_)), "{err}");
    assert_eq!(committed.status(), CommandBufferStatus::Error);
    assert!(committed.error().unwrap().contains("kernel refused"));
    assert_eq!(*log.lock().unwrap(), ["Error"]);
}

#[test]
fn test_panicking_kernel_is_an_execution_error() {
    let device = cpu_device();
    device.register_host_kernel("double_values", |_| panic!("boom"));
    let pipeline = pipeline(&device, "double_values");
    let buffer = device.new_buffer(256, StorageMode::Shared).unwrap();
    let queue = device.new_command_queue().unwrap();

    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &buffer, 0);
    enc.dispatch_threads(64, 1, GROUP);
    enc.end();
    let committed = cmd.commit();
    assert!(committed.wait_until_completed().is_err());
    assert!(committed.error().unwrap().contains("boom"));

    // The queue keeps working afterwards.
    let cmd = queue.new_command_buffer().unwrap();
    cmd.commit().wait_until_completed().unwrap();
}

#[test]
fn test_blit_copy() {
    let device = cpu_device();
    let queue = device.new_command_queue().unwrap();
    let src = device
        .new_buffer_with_data(bytemuck::cast_slice(&[1u32, 2, 3, 4]), StorageMode::Shared)
        .unwrap();
    let dst = device.new_buffer(16, StorageMode::Private).unwrap();

    let mut cmd = queue.new_command_buffer().unwrap();
    let mut blit = cmd.blit_encoder();
    blit.copy_buffer(&src, 4, &dst, 0, 8);
    blit.synchronize(&dst);
    blit.end();
    cmd.commit().wait_until_completed().unwrap();

    assert_eq!(dst.download().unwrap().to_vec_of::<u32>(), vec![2, 3, 0, 0]);
    assert!(matches!(dst.contents(), Err(ComputeError::HostAccess { .. })));
}

#[test]
fn test_live_resources_return_to_zero() {
    let device = cpu_device();
    let baseline = device.live_resources();
    {
        let pipeline = pipeline(&device, "double_values");
        let buffer = device.new_buffer(256, StorageMode::Managed).unwrap();
        let queue = device.new_command_queue().unwrap();
        let mut cmd = queue.new_command_buffer().unwrap();
        let mut enc = cmd.compute_encoder();
        enc.set_pipeline(&pipeline);
        enc.set_buffer(0, &buffer, 0);
        enc.dispatch_threads(64, 1, GROUP);
        enc.end();

        let live = device.live_resources();
        assert_eq!(live.buffers, baseline.buffers + 1);
        assert_eq!(live.queues, baseline.queues + 1);
        assert_eq!(live.command_buffers, baseline.command_buffers + 1);
        cmd.commit().wait_until_completed().unwrap();
    }
    assert_eq!(device.live_resources(), baseline);
}

#[test]
fn test_cpu_render_pipelines_not_implemented() {
    let device = cpu_device();
    let library = device
        .compile_library(
            r#"
@vertex
fn vs(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(i), 0.0, 0.0, 1.0);
}

@fragment
fn fs() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#,
        )
        .unwrap();
    let descriptor = pixlane_gpu::RenderPipelineDescriptor::new(
        library.function("vs").unwrap(),
        library.function("fs").unwrap(),
        TextureFormat::Rgba8Unorm,
    );
    assert!(matches!(
        device.make_render_pipeline(&descriptor),
        Err(ComputeError::NotImplemented { backend: "cpu", .. })
    ));
}

#[test]
#[should_panic(expected = "compute encoder dropped without end()")]
fn test_unended_encoder_panics() {
    let device = cpu_device();
    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let enc = cmd.compute_encoder();
    drop(enc);
}

#[test]
#[should_panic(expected = "dispatch without a compute pipeline")]
fn test_dispatch_without_pipeline_panics() {
    let device = cpu_device();
    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.dispatch(DispatchSize::new(1, 1), GROUP);
    enc.end();
}

#[test]
#[should_panic(expected = "which is not bound")]
fn test_missing_binding_panics() {
    let device = cpu_device();
    let pipeline = pipeline(&device, "double_values");
    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.dispatch(DispatchSize::new(1, 1), GROUP);
    enc.end();
}

#[test]
#[should_panic(expected = "threadgroup size does not match")]
fn test_wrong_threadgroup_panics() {
    let device = cpu_device();
    let pipeline = pipeline(&device, "double_values");
    let buffer = device.new_buffer(256, StorageMode::Shared).unwrap();
    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &buffer, 0);
    enc.dispatch(DispatchSize::new(1, 1), ThreadgroupSize::new(32, 1));
    enc.end();
}

#[test]
#[should_panic(expected = "belongs to another device")]
fn test_cross_device_buffer_panics() {
    let a = cpu_device();
    let b = cpu_device();
    let pipeline = pipeline(&a, "double_values");
    let foreign = b.new_buffer(256, StorageMode::Shared).unwrap();
    let queue = a.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &foreign, 0);
    enc.end();
}

#[test]
fn test_builtin_p216_kernel_rejects_short_destination() {
    let device = Device::new(Backend::Cpu).unwrap();
    let library = device.compile_library(pixlane_gpu::shaders::CONVERT_KERNELS).unwrap();
    let pipeline = device.make_compute_pipeline(&library.function("rgba_to_p216").unwrap()).unwrap();

    let (w, h) = (4u32, 2u32);
    let src = device.new_buffer_with_data(bytemuck::cast_slice(&vec![1.0f32; 4 * 2 * 4]), StorageMode::Shared).unwrap();
    // Luma plane only: the chroma plane does not fit.
    let dst = device.new_buffer(4 * 2 * 2, StorageMode::Shared).unwrap();

    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.compute_encoder();
    enc.set_pipeline(&pipeline);
    enc.set_buffer(0, &src, 0);
    enc.set_buffer(1, &dst, 0);
    enc.set_bytes(2, bytemuck::cast_slice(&[w, h, 0, 0]));
    enc.dispatch(OutputFormat::P216.dispatch_grid(w, h), OutputFormat::THREADGROUP);
    enc.end();
    let committed = cmd.commit();

    assert!(committed.wait_until_completed().is_err());
    assert_eq!(committed.status(), CommandBufferStatus::Error);
    assert!(dst.download().unwrap().iter().all(|b| *b == 0));
}

#[test]
#[should_panic(expected = "index range exceeds index buffer")]
fn test_index_range_overflow_panics() {
    let device = cpu_device();
    let texture = device.new_texture(4, 4, TextureFormat::Rgba8Unorm, false).unwrap();
    let indices = device.new_buffer(64, StorageMode::Shared).unwrap();
    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut enc = cmd.render_encoder(RenderTarget::new(&texture, LoadAction::Load)).unwrap();
    enc.draw_indexed(PrimitiveType::Triangle, 3, IndexType::U32, &indices, usize::MAX - 3);
    enc.end();
}

#[test]
#[should_panic(expected = "copy source range exceeds buffer")]
fn test_copy_range_overflow_panics() {
    let device = cpu_device();
    let src = device.new_buffer(64, StorageMode::Shared).unwrap();
    let dst = device.new_buffer(64, StorageMode::Shared).unwrap();
    let queue = device.new_command_queue().unwrap();
    let mut cmd = queue.new_command_buffer().unwrap();
    let mut blit = cmd.blit_encoder();
    blit.copy_buffer(&src, usize::MAX - 3, &dst, 0, 4);
    blit.end();
}
