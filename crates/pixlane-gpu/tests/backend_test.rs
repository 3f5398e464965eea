//! Backend selection, devices and resources.

use pixlane_gpu::{
    Backend, ComputeContext, ComputeError, ContextConfig, Device, DeviceType, StorageMode, TextureFormat,
    describe_backends, detect_backends, select_best_backend,
};

#[test]
fn test_cpu_backend_available() {
    assert!(Backend::Cpu.is_available());
    assert!(Device::is_available(Backend::Cpu));
}

#[test]
fn test_auto_backend() {
    let ctx = ComputeContext::with_backend(Backend::Auto).unwrap();
    println!("Auto-selected backend: {} ({})", ctx.backend(), ctx.device().name());
    assert_ne!(ctx.backend(), Backend::Auto);
    assert!(ctx.backend().is_available());
    assert!(select_best_backend().is_available());
}

#[test]
fn test_describe_backends() {
    let desc = describe_backends();
    println!("{desc}");
    assert!(desc.contains("CPU"));
    let cpu = detect_backends().into_iter().find(|b| b.backend == Backend::Cpu).unwrap();
    assert!(cpu.available);
}

#[test]
fn test_cpu_enumeration() {
    let devices = Device::enumerate(Backend::Cpu);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_type, DeviceType::Cpu);
    assert!(devices[0].unified_memory);
    assert!(devices[0].memory_bytes > 0);
    assert!(matches!(Device::with_index(Backend::Cpu, 1), Err(ComputeError::DeviceNotFound)));
}

#[test]
fn test_backend_names_parse() {
    for backend in [Backend::Auto, Backend::NativeGpu, Backend::AlternateGpu, Backend::Cpu] {
        assert_eq!(backend.name().parse::<Backend>().unwrap(), backend);
    }
    assert!("quantum".parse::<Backend>().is_err());
}

#[test]
fn test_config_thread_count() {
    let config = ContextConfig::default().backend(Backend::Cpu).cpu_threads(2).label("render-node");
    let device = Device::with_config(Backend::Cpu, &config).unwrap();
    assert_eq!(device.label(), "render-node");
    let queue = device.new_command_queue().unwrap();
    assert!(queue.label().starts_with("render-node"));
}

#[test]
fn test_storage_modes() {
    let device = Device::new(Backend::Cpu).unwrap();
    let data: Vec<u32> = (0..8).collect();

    let shared = device.new_buffer_with_data(bytemuck::cast_slice(&data), StorageMode::Shared).unwrap();
    assert!(shared.contents().unwrap().is_zero_copy());
    assert_eq!(shared.contents().unwrap().to_vec_of::<u32>(), data);

    let managed = device.new_buffer_with_data(bytemuck::cast_slice(&data), StorageMode::Managed).unwrap();
    managed.write_contents(4, &7u32.to_le_bytes()).unwrap();
    managed.did_modify_range(4..8).unwrap();
    assert_eq!(managed.download().unwrap().to_vec_of::<u32>()[1], 7);

    let private = device.new_buffer_with_data(bytemuck::cast_slice(&data), StorageMode::Private).unwrap();
    assert!(matches!(private.contents(), Err(ComputeError::HostAccess { mode: StorageMode::Private })));
    assert!(matches!(private.write_contents(0, &[0; 4]), Err(ComputeError::HostAccess { .. })));
    let copy = private.download().unwrap();
    assert!(!copy.is_zero_copy());
    assert_eq!(copy.to_vec_of::<u32>(), data);
}

#[test]
fn test_upload_alignment() {
    let device = Device::new(Backend::Cpu).unwrap();
    let buffer = device.new_buffer(10, StorageMode::Shared).unwrap();
    // Unaligned offset.
    assert!(matches!(buffer.upload(2, &[1, 2]), Err(ComputeError::InvalidRange { .. })));
    // Short tail is fine when it reaches the end.
    buffer.upload(8, &[9, 9]).unwrap();
    // Past the end.
    assert!(matches!(buffer.upload(8, &[0; 4]), Err(ComputeError::InvalidRange { .. })));
    assert_eq!(&buffer.download().unwrap()[8..], &[9, 9]);
}

#[test]
fn test_texture_round_trip_with_padded_rows() {
    let device = Device::new(Backend::Cpu).unwrap();
    let texture = device.new_texture(3, 2, TextureFormat::Rgba8Unorm, false).unwrap();
    assert_eq!(texture.row_bytes(), 12);

    let pitch = 16;
    let mut bytes = vec![0u8; pitch * 2];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = if i % pitch < 12 { i as u8 } else { 0xee };
    }
    texture.upload(&bytes, pitch).unwrap();
    let out = texture.download(12).unwrap();
    assert_eq!(&out[..12], &bytes[..12]);
    assert_eq!(&out[12..], &bytes[16..28]);

    assert!(matches!(texture.upload(&bytes, 8), Err(ComputeError::BufferSizeMismatch { .. })));
}

#[test]
fn test_zero_sized_resources_rejected() {
    let device = Device::new(Backend::Cpu).unwrap();
    assert!(matches!(device.new_buffer(0, StorageMode::Shared), Err(ComputeError::BufferCreation(_))));
    assert!(matches!(
        device.new_texture(0, 4, TextureFormat::Rgba8Unorm, false),
        Err(ComputeError::TextureCreation(_))
    ));
}

#[test]
fn test_library_errors() {
    let device = Device::new(Backend::Cpu).unwrap();
    let err = device.compile_library("fn broken( {").unwrap_err();
    assert!(matches!(err, ComputeError::LibraryCreation(_)));

    let library = device
        .compile_library("@compute @workgroup_size(1) fn unknown_kernel() {}")
        .unwrap();
    assert!(matches!(library.function("missing"), Err(ComputeError::FunctionNotFound(_))));
    // No host kernel registered under that name.
    let function = library.function("unknown_kernel").unwrap();
    assert!(matches!(device.make_compute_pipeline(&function), Err(ComputeError::PipelineCreation(_))));
}
