//! Command queues and command buffers.
//!
//! ```text
//! CommandQueue::new_command_buffer()
//!     -> CommandBuffer           (Recording: encoders, present, completed handlers)
//!     -> commit()
//!     -> CommittedCommandBuffer  (Committed -> Completed | Error)
//! ```
//!
//! Each state is its own type: a committed buffer has no encoder methods,
//! and a recording buffer has no wait:
//!
//! ```compile_fail
//! # use pixlane_gpu::{Backend, Device};
//! let device = Device::new(Backend::Cpu).unwrap();
//! let queue = device.new_command_queue().unwrap();
//! let cmd = queue.new_command_buffer().unwrap();
//! cmd.wait_until_completed(); // not committed
//! ```
//!
//! ```compile_fail
//! # use pixlane_gpu::{Backend, Device};
//! let device = Device::new(Backend::Cpu).unwrap();
//! let queue = device.new_command_queue().unwrap();
//! let mut cmd = queue.new_command_buffer().unwrap();
//! let committed = cmd.commit();
//! cmd.compute_encoder().end(); // buffer moved into commit()
//! ```
//!
//! Command buffers committed to the same queue execute in commit order.
//! Completion is observed through [`CommittedCommandBuffer::wait_until_completed`]
//! or completed handlers; there is no cancellation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::backend::RawQueue;
use crate::device::Device;
use crate::encoder::{BlitEncoder, ComputeEncoder, Pass, RenderEncoder, RenderTarget};
use crate::resource::{ResourceKind, Tracked};
use crate::{ComputeError, ComputeResult, Texture};

/// Lifecycle state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferStatus {
    /// Accepting encoders.
    Recording,
    /// Submitted, not yet finished.
    Committed,
    /// Finished successfully.
    Completed,
    /// Finished with an execution error.
    Error,
}

impl CommandBufferStatus {
    /// Whether execution has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// A presentable surface image.
///
/// Presentation is requested with [`CommandBuffer::present`] before commit
/// and happens only after the buffer's work has completed.
pub trait Drawable: Send + 'static {
    /// Texture to render into this frame.
    fn texture(&self) -> &Texture;

    /// Shows the frame.
    fn present(self: Box<Self>);
}

type CompletedHandler = Box<dyn FnOnce(CommandBufferStatus) + Send>;

// =============================================================================
// CommandQueue
// =============================================================================

/// Ordered submission channel for one device.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    device: Device,
    label: String,
    raw: RawQueue,
    _tracked: Tracked,
}

impl CommandQueue {
    pub(crate) fn from_raw(device: &Device, label: String, raw: RawQueue) -> Self {
        let tracked = Tracked::new(device.counters(), ResourceKind::Queue);
        Self {
            inner: Arc::new(QueueInner { device: device.clone(), label, raw, _tracked: tracked }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Starts a new recording.
    ///
    /// Fails with [`ComputeError::CommandBufferCreation`] if the queue can
    /// no longer execute work.
    pub fn new_command_buffer(&self) -> ComputeResult<CommandBuffer> {
        if !self.inner.raw.is_alive() {
            return Err(ComputeError::CommandBufferCreation(format!(
                "queue `{}` is no longer executing work",
                self.inner.label
            )));
        }
        Ok(CommandBuffer {
            queue: self.clone(),
            passes: Vec::new(),
            drawables: Vec::new(),
            handlers: Vec::new(),
            tracked: Tracked::new(self.inner.device.counters(), ResourceKind::CommandBuffer),
        })
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("label", &self.inner.label)
            .field("device", &self.inner.device.name())
            .finish()
    }
}

// =============================================================================
// CommandBuffer
// =============================================================================

/// A command buffer in the recording state.
#[must_use = "command buffers do nothing until committed"]
pub struct CommandBuffer {
    queue: CommandQueue,
    passes: Vec<Pass>,
    drawables: Vec<Box<dyn Drawable>>,
    handlers: Vec<CompletedHandler>,
    tracked: Tracked,
}

impl CommandBuffer {
    pub fn status(&self) -> CommandBufferStatus {
        CommandBufferStatus::Recording
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Opens a compute encoder. The buffer stays borrowed until it ends.
    pub fn compute_encoder(&mut self) -> ComputeEncoder<'_> {
        let device = self.queue.device().id();
        ComputeEncoder::new(self, device)
    }

    /// Opens a render encoder drawing into `target`.
    ///
    /// Fails with [`ComputeError::CommandBufferCreation`] if the target
    /// texture cannot be rendered to on this device.
    pub fn render_encoder(&mut self, target: RenderTarget) -> ComputeResult<RenderEncoder<'_>> {
        let device = self.queue.device().id();
        assert_eq!(target.texture.device_id(), device, "render target belongs to another device");
        if !target.texture.is_renderable() {
            return Err(ComputeError::CommandBufferCreation(format!(
                "{} textures are not renderable on {}",
                target.texture.format(),
                self.queue.device().name()
            )));
        }
        Ok(RenderEncoder::new(self, device, target))
    }

    /// Opens a blit encoder.
    pub fn blit_encoder(&mut self) -> BlitEncoder<'_> {
        let device = self.queue.device().id();
        BlitEncoder::new(self, device)
    }

    /// Presents `drawable` after this buffer's work completes.
    pub fn present(&mut self, drawable: impl Drawable) {
        assert_eq!(
            drawable.texture().device_id(),
            self.queue.device().id(),
            "drawable belongs to another device"
        );
        self.drawables.push(Box::new(drawable));
    }

    /// Registers a callback run after execution finishes, before waiters
    /// are released. Handlers run in registration order on a backend thread.
    pub fn add_completed_handler(&mut self, handler: impl FnOnce(CommandBufferStatus) + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    pub(crate) fn push_pass(&mut self, pass: Pass) {
        self.passes.push(pass);
    }

    /// Submits the recorded work. Returns immediately.
    pub fn commit(self) -> CommittedCommandBuffer {
        let completion = Arc::new(Completion::new());
        let CommandBuffer { queue, passes, drawables, handlers, tracked } = self;
        debug!(queue = queue.label(), passes = passes.len(), "commit");

        let finisher = Finisher {
            completion: Arc::clone(&completion),
            drawables,
            handlers,
            tracked: Some(tracked),
            done: false,
        };
        queue.inner.raw.submit(Submission { passes, finisher });

        CommittedCommandBuffer { completion }
    }
}

// =============================================================================
// Completion
// =============================================================================

#[derive(Debug)]
struct CompletionState {
    status: CommandBufferStatus,
    error: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
    done: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            state: Mutex::new(CompletionState { status: CommandBufferStatus::Committed, error: None }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Work handed to a backend queue at commit.
pub(crate) struct Submission {
    pub passes: Vec<Pass>,
    pub finisher: Finisher,
}

/// Runs the completion protocol exactly once: presents, completed
/// handlers, release of the command buffer, then waiters.
///
/// Dropping an unfinished `Finisher` (worker panic, queue torn down)
/// completes the buffer with an error so waiters never hang.
pub(crate) struct Finisher {
    completion: Arc<Completion>,
    drawables: Vec<Box<dyn Drawable>>,
    handlers: Vec<CompletedHandler>,
    tracked: Option<Tracked>,
    done: bool,
}

impl Finisher {
    /// Completes the buffer. Backends drop their recorded passes first so
    /// resources are released before waiters wake.
    pub fn finish(mut self, result: Result<(), String>) {
        self.complete(result);
    }

    fn complete(&mut self, result: Result<(), String>) {
        if self.done {
            return;
        }
        self.done = true;

        let status = match &result {
            Ok(()) => CommandBufferStatus::Completed,
            Err(msg) => {
                warn!(error = %msg, "command buffer failed");
                CommandBufferStatus::Error
            }
        };

        // Callbacks are caller code; a panic in one must not strand waiters.
        let drawables = std::mem::take(&mut self.drawables);
        if status == CommandBufferStatus::Completed {
            for drawable in drawables {
                if panic::catch_unwind(AssertUnwindSafe(|| drawable.present())).is_err() {
                    warn!("drawable present panicked");
                }
            }
        } else if !drawables.is_empty() {
            warn!(count = drawables.len(), "skipping present of failed command buffer");
        }

        for handler in std::mem::take(&mut self.handlers) {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(status))).is_err() {
                warn!("completed handler panicked");
            }
        }
        self.tracked = None;

        let mut state = self.completion.lock();
        state.status = status;
        state.error = result.err();
        drop(state);
        self.completion.done.notify_all();
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        if !self.done {
            self.complete(Err("command buffer was dropped before it executed".into()));
        }
    }
}

// =============================================================================
// CommittedCommandBuffer
// =============================================================================

/// A submitted command buffer.
#[derive(Clone)]
pub struct CommittedCommandBuffer {
    completion: Arc<Completion>,
}

impl CommittedCommandBuffer {
    pub fn status(&self) -> CommandBufferStatus {
        self.completion.lock().status
    }

    /// Execution error message, once finished with [`CommandBufferStatus::Error`].
    pub fn error(&self) -> Option<String> {
        self.completion.lock().error.clone()
    }

    /// Blocks the calling thread until execution finishes.
    pub fn wait_until_completed(&self) -> ComputeResult<()> {
        let mut state = self.completion.lock();
        while !state.status.is_finished() {
            state = self.completion.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        match state.status {
            CommandBufferStatus::Error => Err(ComputeError::Execution(
                state.error.clone().unwrap_or_else(|| "unknown error".into()),
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for CommittedCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommittedCommandBuffer").field("status", &self.status()).finish()
    }
}
