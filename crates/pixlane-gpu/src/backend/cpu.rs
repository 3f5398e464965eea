//! CPU backend: host memory resources and a worker thread per queue.
//!
//! Committed command buffers are executed in FIFO order by the queue's
//! worker thread. Kernels run inside the device's rayon pool, so a kernel
//! is free to use `par_*` iterators.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use pixlane_core::TextureFormat;
use pixlane_core::pixel::encode_texel;
use rayon::prelude::*;
use tracing::{debug, trace};

use super::kernel::lock_bindings;
use super::{Backend, KernelArgs};
use crate::buffer::{BufferView, ViewRepr};
use crate::command::Submission;
use crate::device::{DeviceInfo, DeviceType};
use crate::encoder::{BlitCommand, Dispatch, LoadAction, Pass, RenderPass};
use crate::{ComputeError, ComputeResult};

/// Detect total system RAM in bytes.
fn system_memory() -> u64 {
    static SYSTEM_MEMORY: OnceLock<u64> = OnceLock::new();
    *SYSTEM_MEMORY.get_or_init(|| {
        sys_info::mem_info()
            .map(|m| m.total * 1024) // KB to bytes
            .unwrap_or(8 * 1024 * 1024 * 1024)
    })
}

fn default_threads() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn info_for(threads: usize) -> DeviceInfo {
    DeviceInfo {
        name: format!("Host CPU ({threads} threads)"),
        backend: Backend::Cpu,
        device_type: DeviceType::Cpu,
        unified_memory: true,
        max_buffer_size: isize::MAX as u64,
        max_texture_dimension: u32::MAX,
        memory_bytes: system_memory(),
    }
}

/// The single host device.
pub(crate) fn enumerate() -> Vec<DeviceInfo> {
    vec![info_for(default_threads())]
}

// =============================================================================
// Device
// =============================================================================

pub(crate) struct CpuDevice {
    pool: Arc<rayon::ThreadPool>,
    info: DeviceInfo,
}

impl CpuDevice {
    pub(crate) fn open(threads: Option<usize>, label: &str) -> ComputeResult<Self> {
        let threads = threads.unwrap_or_else(default_threads).max(1);
        let prefix = label.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| format!("{prefix}-cpu-{index}"))
            .build()
            .map_err(|e| ComputeError::BackendNotAvailable(format!("cpu thread pool: {e}")))?;
        debug!(threads, "opened CPU device");
        Ok(Self { pool: Arc::new(pool), info: info_for(threads) })
    }

    pub(crate) fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn new_queue(&self, label: &str) -> ComputeResult<CpuQueue> {
        CpuQueue::spawn(Arc::clone(&self.pool), label)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Host buffer. Stored as words so typed views of `f32`/`u32` are aligned.
pub(crate) struct CpuBuffer {
    pub(crate) words: RwLock<Vec<u32>>,
}

impl CpuBuffer {
    pub(crate) fn new(len: usize) -> ComputeResult<Self> {
        let count = len.div_ceil(4);
        let mut words = Vec::new();
        words
            .try_reserve_exact(count)
            .map_err(|e| ComputeError::BufferCreation(format!("{len} bytes: {e}")))?;
        words.resize(count, 0);
        Ok(Self { words: RwLock::new(words) })
    }

    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) {
        let mut words = self.words.write().unwrap_or_else(PoisonError::into_inner);
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn view(&self, len: usize) -> BufferView<'_> {
        let guard = self.words.read().unwrap_or_else(PoisonError::into_inner);
        BufferView::new(ViewRepr::Host { guard, len })
    }

    pub(crate) fn copy(&self, len: usize) -> Vec<u8> {
        let words = self.words.read().unwrap_or_else(PoisonError::into_inner);
        bytemuck::cast_slice::<u32, u8>(&words)[..len].to_vec()
    }
}

/// Host texture, tightly packed rows.
pub(crate) struct CpuTexture {
    pub(crate) texels: RwLock<Vec<u8>>,
}

impl CpuTexture {
    pub(crate) fn new(width: u32, height: u32, format: TextureFormat) -> ComputeResult<Self> {
        let len = format
            .row_bytes(width)
            .checked_mul(height as usize)
            .ok_or(ComputeError::InvalidDimensions(width, height))?;
        let mut texels = Vec::new();
        texels
            .try_reserve_exact(len)
            .map_err(|e| ComputeError::TextureCreation(format!("{width}x{height} {format}: {e}")))?;
        texels.resize(len, 0);
        Ok(Self { texels: RwLock::new(texels) })
    }

    pub(crate) fn upload(&self, row_bytes: usize, bytes: &[u8], bytes_per_row: usize) {
        let mut texels = self.texels.write().unwrap_or_else(PoisonError::into_inner);
        for (dst, src) in texels.chunks_exact_mut(row_bytes).zip(bytes.chunks(bytes_per_row)) {
            dst.copy_from_slice(&src[..row_bytes]);
        }
    }

    pub(crate) fn download(&self, row_bytes: usize, height: u32, bytes_per_row: usize) -> Vec<u8> {
        let texels = self.texels.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = vec![0u8; bytes_per_row * height as usize];
        for (dst, src) in out.chunks_exact_mut(bytes_per_row).zip(texels.chunks_exact(row_bytes)) {
            dst[..row_bytes].copy_from_slice(src);
        }
        out
    }
}

// =============================================================================
// Queue
// =============================================================================

pub(crate) struct CpuQueue {
    sender: Mutex<Option<Sender<Submission>>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl CpuQueue {
    fn spawn(pool: Arc<rayon::ThreadPool>, label: &str) -> ComputeResult<Self> {
        let (sender, receiver) = mpsc::channel::<Submission>();
        let worker = thread::Builder::new()
            .name(format!("{label}-queue"))
            .spawn(move || {
                for submission in receiver {
                    run_submission(&pool, submission);
                }
            })
            .map_err(|e| ComputeError::CommandQueueCreation(e.to_string()))?;
        let worker_id = worker.thread().id();
        Ok(Self { sender: Mutex::new(Some(sender)), worker: Some(worker), worker_id })
    }

    pub(crate) fn is_alive(&self) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        sender.is_some() && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Queues work behind everything committed before it. If the worker is
    /// gone the submission is dropped, which completes it with an error.
    pub(crate) fn submit(&self, submission: Submission) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            // A send error hands the submission back; dropping it fails it.
            let _ = sender.send(submission);
        }
    }
}

impl Drop for CpuQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is already queued.
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = self.worker.take() {
            // The last handle can be released by a completed handler running on the worker.
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("kernel panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("kernel panicked: {s}")
    } else {
        "kernel panicked".to_string()
    }
}

fn run_submission(pool: &rayon::ThreadPool, submission: Submission) {
    let Submission { passes, finisher } = submission;
    let result = panic::catch_unwind(AssertUnwindSafe(|| pool.install(|| execute(&passes))))
        .unwrap_or_else(|payload| Err(ComputeError::Execution(panic_message(payload))));
    drop(passes);
    finisher.finish(result.map_err(|e| e.to_string()));
}

fn execute(passes: &[Pass]) -> ComputeResult<()> {
    for pass in passes {
        match pass {
            Pass::Compute(dispatches) => {
                for dispatch in dispatches {
                    run_dispatch(dispatch)?;
                }
            }
            Pass::Render(pass) => run_render(pass)?,
            Pass::Blit(commands) => {
                for command in commands {
                    run_blit(command)?;
                }
            }
        }
    }
    Ok(())
}

fn run_dispatch(dispatch: &Dispatch) -> ComputeResult<()> {
    let Some(kernel) = dispatch.pipeline.raw().host_kernel() else {
        return Err(ComputeError::Execution(format!("`{}` has no host kernel", dispatch.pipeline.name())));
    };
    if dispatch.grid.is_empty() {
        return Ok(());
    }
    trace!(kernel = dispatch.pipeline.name(), grid = ?dispatch.grid, "cpu dispatch");

    let (buffers, textures) = lock_bindings(&dispatch.bindings, dispatch.pipeline.bindings())?;
    let mut args = KernelArgs { grid: dispatch.grid, threadgroup: dispatch.group, buffers, textures };
    kernel(&mut args).map_err(|e| match e {
        ComputeError::Execution(msg) => ComputeError::Execution(format!("`{}`: {msg}", dispatch.pipeline.name())),
        other => other,
    })
}

fn run_render(pass: &RenderPass) -> ComputeResult<()> {
    if !pass.draws.is_empty() {
        return Err(ComputeError::NotImplemented { backend: "cpu", operation: "draw" });
    }
    let LoadAction::Clear(color) = pass.target.load else {
        return Ok(());
    };
    let texture = &pass.target.texture;
    let Some(raw) = texture.raw().as_cpu() else {
        return Err(ComputeError::Execution("render target is not host-backed".into()));
    };
    let format = texture.format();
    let rgba = color.map(|c| c as f32);
    let mut texel = vec![0u8; format.bytes_per_pixel()];
    encode_texel(format, rgba, &mut texel);

    let mut texels = raw
        .texels
        .try_write()
        .map_err(|_| ComputeError::Execution("render target is in use".into()))?;
    texels.par_chunks_exact_mut(texel.len()).for_each(|px| px.copy_from_slice(&texel));
    Ok(())
}

fn busy<T>(_: T) -> ComputeError {
    ComputeError::Execution("copy buffer is in use".into())
}

fn run_blit(command: &BlitCommand) -> ComputeResult<()> {
    match command {
        BlitCommand::CopyBuffer { src, src_offset, dst, dst_offset, size } => {
            let (Some(s), Some(d)) = (src.raw().as_cpu(), dst.raw().as_cpu()) else {
                return Err(ComputeError::Execution("copy between buffers that are not host-backed".into()));
            };
            let src_words = s.words.try_read().map_err(busy)?;
            let mut dst_words = d.words.try_write().map_err(busy)?;
            let from = &bytemuck::cast_slice::<u32, u8>(&src_words)[*src_offset..src_offset + size];
            bytemuck::cast_slice_mut::<u32, u8>(&mut dst_words)[*dst_offset..dst_offset + size].copy_from_slice(from);
            Ok(())
        }
        // Host and device share memory.
        BlitCommand::Synchronize(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_rounds_up_to_words() {
        let buffer = CpuBuffer::new(6).unwrap();
        assert_eq!(buffer.words.read().unwrap().len(), 2);
        buffer.write(4, &[1, 2]);
        assert_eq!(buffer.copy(6), vec![0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_texture_pitch() {
        let texture = CpuTexture::new(2, 2, TextureFormat::Rgba8Unorm).unwrap();
        let mut src = vec![0u8; 12 * 2];
        src[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        src[12..20].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        texture.upload(8, &src, 12);

        assert_eq!(*texture.texels.read().unwrap(), (1..=16).collect::<Vec<u8>>());
        assert_eq!(texture.download(8, 2, 12), src);
    }

    #[test]
    fn test_enumerate_reports_host() {
        let devices = enumerate();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_type, DeviceType::Cpu);
        assert!(devices[0].unified_memory);
    }
}
