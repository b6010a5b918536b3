//! Context lifecycle: acquisition, dispatch and ordered teardown.
//!
//! Acquisition is a typestate chain:
//!
//! ```text
//! Bootstrap -> PlatformStage -> DeviceStage -> ContextStage -> QueueStage -> Session
//! ```
//!
//! Every transition consumes the previous stage, so resources can only be
//! acquired in order. Each stage owns everything acquired so far; dropping a
//! stage (including on an early `?` return) releases it in reverse order of
//! acquisition. [`Session::release`] does the same explicitly.
//!
//! Kernels and buffers created from a [`Session`] borrow it, so they must be
//! released or dropped before the session can be released.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compiler::{ModuleLinker, include_directive, release_quietly};
use crate::device::{
    ContextHandle, DeviceApi, DeviceId, DeviceType, KernelHandle, MemAccess, MemHandle, Operation, PlatformId,
    ProgramHandle, QueueHandle, QueueProperties, Resource,
};
use crate::diagnostics::{LOG_CAPACITY, report_build_log};
use crate::error::{BootError, Result};
use crate::status::StatusCode;

/// Where a session's lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing acquired.
    Uninitialized,
    /// A platform has been chosen.
    PlatformSelected,
    /// A device has been chosen.
    DeviceSelected,
    /// An execution context exists.
    ContextCreated,
    /// A command queue exists.
    QueueCreated,
    /// An executable program exists; kernels may be dispatched.
    ProgramBuilt,
    /// Everything has been released.
    Released,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::PlatformSelected => "platform selected",
            Self::DeviceSelected => "device selected",
            Self::ContextCreated => "context created",
            Self::QueueCreated => "queue created",
            Self::ProgramBuilt => "program built",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// How the session's program was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramOrigin {
    /// Built in one step from a single module.
    Built {
        /// The module the program was built from.
        source_ref: String,
    },
    /// Compiled per module and linked.
    Linked {
        /// Modules in link order.
        modules: Vec<String>,
    },
}

impl fmt::Display for ProgramOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Built { source_ref } => write!(f, "built from {source_ref}"),
            Self::Linked { modules } => write!(f, "linked from {}", modules.join(", ")),
        }
    }
}

/// Resources acquired so far, released in reverse on drop.
struct Core<'a, B: DeviceApi + ?Sized> {
    api: &'a B,
    acquired: Vec<Resource>,
    state: LifecycleState,
    log_capacity: usize,
}

impl<'a, B: DeviceApi + ?Sized> Core<'a, B> {
    fn acquire(&mut self, resource: Resource, state: LifecycleState) {
        debug!(%resource, "acquired");
        self.acquired.push(resource);
        self.state = state;
    }

    fn teardown(&mut self) {
        if self.acquired.is_empty() {
            return;
        }
        while let Some(resource) = self.acquired.pop() {
            release_quietly(self.api, resource);
        }
        self.state = LifecycleState::Released;
        info!("device resources released");
    }
}

impl<B: DeviceApi + ?Sized> Drop for Core<'_, B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn api_error(operation: Operation) -> impl FnOnce(StatusCode) -> BootError {
    move |status| BootError::device(operation, status)
}

/// Start of the acquisition chain.
pub struct Bootstrap<'a, B: DeviceApi + ?Sized> {
    core: Core<'a, B>,
    device_type: DeviceType,
}

impl<'a, B: DeviceApi + ?Sized> Bootstrap<'a, B> {
    /// Begin a lifecycle on `api`. Nothing is acquired yet.
    pub fn new(api: &'a B) -> Self {
        Self {
            core: Core {
                api,
                acquired: Vec::new(),
                state: LifecycleState::Uninitialized,
                log_capacity: LOG_CAPACITY,
            },
            device_type: DeviceType::All,
        }
    }

    /// Restrict device selection to `device_type`.
    #[must_use]
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Bound reported build logs to `capacity` bytes.
    #[must_use]
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.core.log_capacity = capacity;
        self
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    /// Select the first enumerated platform.
    pub fn select_platform(self) -> Result<PlatformStage<'a, B>> {
        let Self { mut core, device_type } = self;
        let platform = core
            .api
            .platform_ids()
            .map_err(api_error(Operation::PlatformIds))?
            .first()
            .copied()
            .ok_or_else(|| BootError::device(Operation::PlatformIds, StatusCode::PLATFORM_NOT_FOUND))?;
        let platform_name = core.api.platform_name(platform).map_err(api_error(Operation::PlatformName))?;

        info!(%platform, name = %platform_name, "platform selected");
        core.state = LifecycleState::PlatformSelected;
        Ok(PlatformStage {
            core,
            device_type,
            platform,
            platform_name,
        })
    }
}

/// A platform has been chosen.
pub struct PlatformStage<'a, B: DeviceApi + ?Sized> {
    core: Core<'a, B>,
    device_type: DeviceType,
    platform: PlatformId,
    platform_name: String,
}

impl<'a, B: DeviceApi + ?Sized> PlatformStage<'a, B> {
    /// The selected platform.
    #[must_use]
    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    /// Select the first device of the configured type on the platform.
    pub fn select_device(self) -> Result<DeviceStage<'a, B>> {
        let Self {
            mut core,
            device_type,
            platform,
            platform_name,
        } = self;
        let device = core
            .api
            .device_ids(platform, device_type)
            .map_err(api_error(Operation::DeviceIds))?
            .first()
            .copied()
            .ok_or_else(|| BootError::device(Operation::DeviceIds, StatusCode::DEVICE_NOT_FOUND))?;
        core.acquire(Resource::Device(device), LifecycleState::DeviceSelected);
        let device_name = core.api.device_name(device).map_err(api_error(Operation::DeviceName))?;

        info!(%device, name = %device_name, %device_type, "device selected");
        Ok(DeviceStage {
            core,
            platform,
            platform_name,
            device,
            device_name,
        })
    }
}

/// A device has been chosen.
pub struct DeviceStage<'a, B: DeviceApi + ?Sized> {
    core: Core<'a, B>,
    platform: PlatformId,
    platform_name: String,
    device: DeviceId,
    device_name: String,
}

impl<'a, B: DeviceApi + ?Sized> DeviceStage<'a, B> {
    /// The selected device.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    /// Create a context bound to the selected device.
    pub fn create_context(self) -> Result<ContextStage<'a, B>> {
        let Self {
            mut core,
            platform,
            platform_name,
            device,
            device_name,
        } = self;
        let context = core.api.create_context(&[device]).map_err(api_error(Operation::CreateContext))?;
        core.acquire(Resource::Context(context), LifecycleState::ContextCreated);

        info!(%context, "context created");
        Ok(ContextStage {
            core,
            platform,
            platform_name,
            device,
            device_name,
            context,
        })
    }
}

/// An execution context exists.
pub struct ContextStage<'a, B: DeviceApi + ?Sized> {
    core: Core<'a, B>,
    platform: PlatformId,
    platform_name: String,
    device: DeviceId,
    device_name: String,
    context: ContextHandle,
}

impl<'a, B: DeviceApi + ?Sized> ContextStage<'a, B> {
    /// The context.
    #[must_use]
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    /// Create the in-order command queue.
    pub fn create_queue(self) -> Result<QueueStage<'a, B>> {
        let Self {
            mut core,
            platform,
            platform_name,
            device,
            device_name,
            context,
        } = self;
        let queue = core
            .api
            .create_command_queue(context, device, QueueProperties::default())
            .map_err(api_error(Operation::CreateCommandQueue))?;
        core.acquire(Resource::Queue(queue), LifecycleState::QueueCreated);

        info!(%queue, "command queue created");
        Ok(QueueStage {
            core,
            platform,
            platform_name,
            device,
            device_name,
            context,
            queue,
        })
    }
}

/// A command queue exists; a program can be produced.
pub struct QueueStage<'a, B: DeviceApi + ?Sized> {
    core: Core<'a, B>,
    platform: PlatformId,
    platform_name: String,
    device: DeviceId,
    device_name: String,
    context: ContextHandle,
    queue: QueueHandle,
}

impl<'a, B: DeviceApi + ?Sized> QueueStage<'a, B> {
    /// The queue.
    #[must_use]
    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    /// Build a program in one step from the single module `source_ref`.
    ///
    /// On failure the build log is reported, the failed program released,
    /// and [`BootError::Build`] returned.
    pub fn build_program(self, source_ref: &str, build_options: &str) -> Result<Session<'a, B>> {
        let source = include_directive(source_ref)?;
        let api = self.core.api;
        let program = api
            .create_program_with_source(self.context, &[source.as_str()])
            .map_err(api_error(Operation::CreateProgramWithSource))?;

        debug!(%program, source_ref, build_options, "building program");
        if let Err(status) = api.build_program(program, &[self.device], build_options) {
            let log = report_build_log(api, program, self.device, self.core.log_capacity);
            release_quietly(api, Resource::Program(program));
            return Err(BootError::Build {
                source_ref: source_ref.to_string(),
                status,
                log,
            });
        }

        info!(%program, source_ref, "program built");
        Ok(self.into_session(program, ProgramOrigin::Built {
            source_ref: source_ref.to_string(),
        }))
    }

    /// Compile each module separately and link them into one program.
    pub fn link_program<S: AsRef<str>>(
        self,
        modules: &[S],
        compile_options: &str,
        link_options: &str,
    ) -> Result<Session<'a, B>> {
        let program = ModuleLinker::new(self.core.api, self.context, self.device)
            .with_log_capacity(self.core.log_capacity)
            .compile_and_link(compile_options, link_options, modules)?;
        let modules = modules.iter().map(|m| m.as_ref().to_string()).collect();
        Ok(self.into_session(program, ProgramOrigin::Linked { modules }))
    }

    fn into_session(self, program: ProgramHandle, origin: ProgramOrigin) -> Session<'a, B> {
        let Self {
            mut core,
            platform,
            platform_name,
            device,
            device_name,
            context,
            queue,
        } = self;
        core.acquire(Resource::Program(program), LifecycleState::ProgramBuilt);
        Session {
            core,
            platform,
            platform_name,
            device,
            device_name,
            context,
            queue,
            program,
            origin,
        }
    }
}

/// A fully acquired device with an executable program.
pub struct Session<'a, B: DeviceApi + ?Sized> {
    core: Core<'a, B>,
    platform: PlatformId,
    platform_name: String,
    device: DeviceId,
    device_name: String,
    context: ContextHandle,
    queue: QueueHandle,
    program: ProgramHandle,
    origin: ProgramOrigin,
}

impl<'a, B: DeviceApi + ?Sized> Session<'a, B> {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    /// The selected platform.
    #[must_use]
    pub fn platform(&self) -> PlatformId {
        self.platform
    }

    /// Name reported by the platform.
    #[must_use]
    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    /// The selected device.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Name reported by the device.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// The context.
    #[must_use]
    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// The queue.
    #[must_use]
    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    /// The executable program.
    #[must_use]
    pub fn program(&self) -> ProgramHandle {
        self.program
    }

    /// How the program was produced.
    #[must_use]
    pub fn origin(&self) -> &ProgramOrigin {
        &self.origin
    }

    /// Extract the entry point `name` from the program.
    pub fn create_kernel(&self, name: &str) -> Result<Kernel<'_, B>> {
        let handle = self
            .core
            .api
            .create_kernel(self.program, name)
            .map_err(api_error(Operation::CreateKernel))?;
        debug!(kernel = %handle, name, "kernel created");
        Ok(Kernel {
            api: self.core.api,
            handle,
            name: name.to_string(),
            live: true,
        })
    }

    /// Allocate a read-write buffer of `size` bytes.
    pub fn create_buffer(&self, size: usize) -> Result<DeviceBuffer<'_, B>> {
        self.create_buffer_with(MemAccess::ReadWrite, size)
    }

    /// Allocate a buffer of `size` bytes with the given access mode.
    pub fn create_buffer_with(&self, access: MemAccess, size: usize) -> Result<DeviceBuffer<'_, B>> {
        let handle = self
            .core
            .api
            .create_buffer(self.context, access, size)
            .map_err(api_error(Operation::CreateBuffer))?;
        debug!(buffer = %handle, size, "buffer created");
        Ok(DeviceBuffer {
            api: self.core.api,
            handle,
            size,
            live: true,
        })
    }

    /// Bind `buffer` to parameter `index` of `kernel`.
    pub fn bind_argument(&self, kernel: &Kernel<'_, B>, index: u32, buffer: &DeviceBuffer<'_, B>) -> Result<()> {
        self.core
            .api
            .set_kernel_arg_buffer(kernel.handle, index, buffer.handle)
            .map_err(api_error(Operation::SetKernelArg))
    }

    /// Enqueue a one-dimensional launch of `kernel`. Returns before the
    /// device finishes; see [`Session::drain`].
    pub fn dispatch(&self, kernel: &Kernel<'_, B>, global_work_size: usize) -> Result<()> {
        self.dispatch_nd(kernel, &[global_work_size], None)
    }

    /// Enqueue a launch over up to three dimensions.
    pub fn dispatch_nd(
        &self,
        kernel: &Kernel<'_, B>,
        global_work_size: &[usize],
        local_work_size: Option<&[usize]>,
    ) -> Result<()> {
        self.core
            .api
            .enqueue_nd_range_kernel(self.queue, kernel.handle, global_work_size, local_work_size)
            .map_err(api_error(Operation::EnqueueNdRangeKernel))?;
        info!(kernel = %kernel.name, ?global_work_size, "kernel dispatched");
        Ok(())
    }

    /// Block until every enqueued command has completed.
    pub fn drain(&self) -> Result<()> {
        self.core.api.finish(self.queue).map_err(api_error(Operation::Finish))?;
        debug!(queue = %self.queue, "queue drained");
        Ok(())
    }

    /// Release program, queue, context and device, in that order.
    ///
    /// Release failures are logged and otherwise ignored.
    pub fn release(mut self) {
        self.core.teardown();
    }
}

/// A kernel entry point. Released on drop.
pub struct Kernel<'s, B: DeviceApi + ?Sized> {
    api: &'s B,
    handle: KernelHandle,
    name: String,
    live: bool,
}

impl<B: DeviceApi + ?Sized> Kernel<'_, B> {
    /// The underlying handle.
    #[must_use]
    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    /// Entry point name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release now, reporting failure.
    pub fn release(mut self) -> Result<()> {
        self.live = false;
        self.api
            .release_kernel(self.handle)
            .map_err(api_error(Operation::ReleaseKernel))
    }
}

impl<B: DeviceApi + ?Sized> Drop for Kernel<'_, B> {
    fn drop(&mut self) {
        if self.live {
            if let Err(status) = self.api.release_kernel(self.handle) {
                warn!(kernel = %self.handle, %status, "kernel release failed");
            }
        }
    }
}

/// A device buffer. Released on drop.
pub struct DeviceBuffer<'s, B: DeviceApi + ?Sized> {
    api: &'s B,
    handle: MemHandle,
    size: usize,
    live: bool,
}

impl<B: DeviceApi + ?Sized> DeviceBuffer<'_, B> {
    /// The underlying handle.
    #[must_use]
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Release now, reporting failure.
    pub fn release(mut self) -> Result<()> {
        self.live = false;
        self.api
            .release_mem_object(self.handle)
            .map_err(api_error(Operation::ReleaseMemObject))
    }
}

impl<B: DeviceApi + ?Sized> Drop for DeviceBuffer<'_, B> {
    fn drop(&mut self) {
        if self.live {
            if let Err(status) = self.api.release_mem_object(self.handle) {
                warn!(buffer = %self.handle, %status, "buffer release failed");
            }
        }
    }
}
