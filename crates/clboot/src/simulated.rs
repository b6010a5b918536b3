//! In-process simulated device API.
//!
//! [`SimulatedDevice`] implements [`DeviceApi`] without accelerator hardware.
//! It behaves like a strict runtime: handles are validated on every call,
//! double releases are rejected, includes are resolved against a
//! [`SourceModules`] set, and kernel signatures are read from the source so
//! that kernel names and argument slots are checked.
//!
//! Every call is appended to a journal, which tests use to assert call order,
//! and any operation can be made to fail with a chosen status.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::device::{
    ApiResult, ContextHandle, DeviceApi, DeviceId, DeviceType, KernelHandle, LinkFailure, MemAccess,
    MemHandle, Operation, PlatformId, ProgramHandle, QueueHandle, QueueProperties, Resource,
};
use crate::sources::SourceModules;
use crate::status::StatusCode;

/// Name of the platform created by [`SimulatedDevice::new`].
pub const DEFAULT_PLATFORM_NAME: &str = "clboot Simulated Platform";

/// Name of the device created by [`SimulatedDevice::new`].
pub const DEFAULT_DEVICE_NAME: &str = "Simulated Accelerator";

/// Global memory of a simulated device unless configured otherwise.
pub const DEFAULT_MEMORY_BYTES: u64 = 1 << 30;

/// File name reported for the synthesized top-level source unit.
const TOP_LEVEL_ORIGIN: &str = "<source>";

const MAX_INCLUDE_DEPTH: usize = 16;

const SUPPORTED_STANDARDS: &[&str] = &["CL1.0", "CL1.1", "CL1.2", "CL2.0", "CL3.0"];

/// A call made against the simulated device, with its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `platform_ids`.
    PlatformIds,
    /// `platform_name`.
    PlatformName(PlatformId),
    /// `device_ids`.
    DeviceIds {
        /// Platform queried.
        platform: PlatformId,
        /// Type filter.
        device_type: DeviceType,
    },
    /// `device_name`.
    DeviceName(DeviceId),
    /// `create_context`.
    CreateContext {
        /// Devices requested.
        devices: Vec<DeviceId>,
    },
    /// `create_command_queue`.
    CreateCommandQueue {
        /// Owning context.
        context: ContextHandle,
        /// Target device.
        device: DeviceId,
        /// Flags requested.
        properties: QueueProperties,
    },
    /// `create_program_with_source`.
    CreateProgramWithSource {
        /// Owning context.
        context: ContextHandle,
        /// Concatenated source text.
        source: String,
    },
    /// `build_program`.
    BuildProgram {
        /// Program built.
        program: ProgramHandle,
        /// Options passed.
        options: String,
    },
    /// `compile_program`.
    CompileProgram {
        /// Program compiled.
        program: ProgramHandle,
        /// Options passed.
        options: String,
    },
    /// `link_program`.
    LinkProgram {
        /// Owning context.
        context: ContextHandle,
        /// Options passed.
        options: String,
        /// Compiled units, in the order given.
        inputs: Vec<ProgramHandle>,
    },
    /// `program_build_log`.
    ProgramBuildLog {
        /// Program queried.
        program: ProgramHandle,
        /// Device queried.
        device: DeviceId,
    },
    /// `create_kernel`.
    CreateKernel {
        /// Source program.
        program: ProgramHandle,
        /// Entry point requested.
        name: String,
    },
    /// `create_buffer`.
    CreateBuffer {
        /// Owning context.
        context: ContextHandle,
        /// Access mode.
        access: MemAccess,
        /// Size in bytes.
        size: usize,
    },
    /// `set_kernel_arg_buffer`.
    SetKernelArg {
        /// Kernel.
        kernel: KernelHandle,
        /// Parameter slot.
        index: u32,
        /// Buffer bound.
        buffer: MemHandle,
    },
    /// `enqueue_nd_range_kernel`.
    EnqueueNdRangeKernel {
        /// Queue.
        queue: QueueHandle,
        /// Kernel launched.
        kernel: KernelHandle,
        /// Global work size per dimension.
        global_work_size: Vec<usize>,
        /// Local work size, if given.
        local_work_size: Option<Vec<usize>>,
    },
    /// `finish`.
    Finish(QueueHandle),
    /// Any `release_*` call.
    Release(Resource),
}

impl Call {
    /// The device API entry point this call went through.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        match self {
            Self::PlatformIds => Operation::PlatformIds,
            Self::PlatformName(_) => Operation::PlatformName,
            Self::DeviceIds { .. } => Operation::DeviceIds,
            Self::DeviceName(_) => Operation::DeviceName,
            Self::CreateContext { .. } => Operation::CreateContext,
            Self::CreateCommandQueue { .. } => Operation::CreateCommandQueue,
            Self::CreateProgramWithSource { .. } => Operation::CreateProgramWithSource,
            Self::BuildProgram { .. } => Operation::BuildProgram,
            Self::CompileProgram { .. } => Operation::CompileProgram,
            Self::LinkProgram { .. } => Operation::LinkProgram,
            Self::ProgramBuildLog { .. } => Operation::ProgramBuildLog,
            Self::CreateKernel { .. } => Operation::CreateKernel,
            Self::CreateBuffer { .. } => Operation::CreateBuffer,
            Self::SetKernelArg { .. } => Operation::SetKernelArg,
            Self::EnqueueNdRangeKernel { .. } => Operation::EnqueueNdRangeKernel,
            Self::Finish(_) => Operation::Finish,
            Self::Release(resource) => resource.release_operation(),
        }
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// The call and its inputs.
    pub call: Call,
    /// Status it returned.
    pub status: StatusCode,
    /// Object created by the call, if any.
    pub created: Option<Resource>,
}

/// A kernel launch observed by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    /// Entry point name.
    pub kernel: String,
    /// Global work size per dimension.
    pub global_work_size: Vec<usize>,
}

/// Description of one simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDeviceSpec {
    /// Device name.
    pub name: String,
    /// Device type reported during enumeration.
    pub device_type: DeviceType,
    /// Global memory in bytes.
    pub memory_bytes: u64,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    nth: Option<usize>,
    status: StatusCode,
}

/// Builder for [`SimulatedDevice`].
#[derive(Debug, Clone, Default)]
pub struct SimulatedDeviceBuilder {
    platforms: Vec<(String, Vec<SimulatedDeviceSpec>)>,
    sources: SourceModules,
    faults: Vec<Fault>,
    compile_delays: HashMap<String, Duration>,
}

impl SimulatedDeviceBuilder {
    /// Add a platform; subsequent devices attach to it.
    #[must_use]
    pub fn platform(mut self, name: impl Into<String>) -> Self {
        self.platforms.push((name.into(), Vec::new()));
        self
    }

    /// Add a device with the default memory size to the last platform.
    #[must_use]
    pub fn device(self, name: impl Into<String>, device_type: DeviceType) -> Self {
        self.device_with_memory(name, device_type, DEFAULT_MEMORY_BYTES)
    }

    /// Add a device with `memory_bytes` of global memory to the last platform.
    ///
    /// Creates the default platform first if none was added.
    #[must_use]
    pub fn device_with_memory(mut self, name: impl Into<String>, device_type: DeviceType, memory_bytes: u64) -> Self {
        if self.platforms.is_empty() {
            self.platforms.push((DEFAULT_PLATFORM_NAME.to_string(), Vec::new()));
        }
        if let Some((_, devices)) = self.platforms.last_mut() {
            devices.push(SimulatedDeviceSpec {
                name: name.into(),
                device_type,
                memory_bytes,
            });
        }
        self
    }

    /// Source modules visible to `#include`.
    #[must_use]
    pub fn sources(mut self, sources: SourceModules) -> Self {
        self.sources = sources;
        self
    }

    /// Make every call of `operation` fail with `status`.
    #[must_use]
    pub fn fail(mut self, operation: Operation, status: StatusCode) -> Self {
        self.faults.push(Fault {
            operation,
            nth: None,
            status,
        });
        self
    }

    /// Make only the `nth` (1-based) call of `operation` fail with `status`.
    #[must_use]
    pub fn fail_nth(mut self, operation: Operation, nth: usize, status: StatusCode) -> Self {
        self.faults.push(Fault {
            operation,
            nth: Some(nth),
            status,
        });
        self
    }

    /// Stall every compile or build that includes `module` by `delay`.
    #[must_use]
    pub fn compile_delay(mut self, module: impl Into<String>, delay: Duration) -> Self {
        self.compile_delays.insert(module.into(), delay);
        self
    }

    /// Finish the device.
    #[must_use]
    pub fn build(self) -> SimulatedDevice {
        let mut state = State {
            next_id: 1,
            faults: self.faults,
            ..State::default()
        };
        for (name, specs) in self.platforms {
            let platform = PlatformId::from_raw(state.allocate_id());
            let mut devices = Vec::with_capacity(specs.len());
            for spec in specs {
                let device = DeviceId::from_raw(state.allocate_id());
                state.devices.insert(
                    device,
                    DeviceEntry {
                        spec,
                        allocated: 0,
                        released: false,
                    },
                );
                devices.push(device);
            }
            state.platforms.push(PlatformEntry {
                id: platform,
                name,
                devices,
            });
        }
        SimulatedDevice {
            state: Mutex::new(state),
            sources: self.sources,
            compile_delays: self.compile_delays,
        }
    }
}

#[derive(Debug)]
struct PlatformEntry {
    id: PlatformId,
    name: String,
    devices: Vec<DeviceId>,
}

#[derive(Debug)]
struct DeviceEntry {
    spec: SimulatedDeviceSpec,
    allocated: u64,
    released: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelSignature {
    name: String,
    params: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Source,
    Compiled,
    Executable,
    Failed,
}

#[derive(Debug)]
struct ProgramObject {
    source: Option<String>,
    stage: Stage,
    log: String,
    kernels: Vec<KernelSignature>,
}

#[derive(Debug)]
enum Object {
    Context {
        devices: Vec<DeviceId>,
    },
    Queue {
        pending: Vec<Launch>,
    },
    Program(ProgramObject),
    Kernel {
        name: String,
        args: Vec<Option<MemHandle>>,
    },
    Mem {
        device: DeviceId,
        size: u64,
    },
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    platforms: Vec<PlatformEntry>,
    devices: HashMap<DeviceId, DeviceEntry>,
    objects: HashMap<u64, Object>,
    journal: Vec<JournalEntry>,
    call_counts: HashMap<Operation, usize>,
    faults: Vec<Fault>,
    completed: Vec<Launch>,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn injected_fault(&mut self, operation: Operation) -> Option<StatusCode> {
        let count = self.call_counts.entry(operation).or_insert(0);
        *count += 1;
        let count = *count;
        self.faults
            .iter()
            .find(|f| f.operation == operation && f.nth.is_none_or(|n| n == count))
            .map(|f| f.status)
    }

    fn live_device(&self, device: DeviceId) -> ApiResult<&DeviceEntry> {
        match self.devices.get(&device) {
            Some(entry) if !entry.released => Ok(entry),
            _ => Err(StatusCode::INVALID_DEVICE),
        }
    }

    fn context_devices(&self, context: ContextHandle) -> ApiResult<&[DeviceId]> {
        match self.objects.get(&context.raw()) {
            Some(Object::Context { devices }) => Ok(devices),
            _ => Err(StatusCode::INVALID_CONTEXT),
        }
    }

    fn program(&self, program: ProgramHandle) -> ApiResult<&ProgramObject> {
        match self.objects.get(&program.raw()) {
            Some(Object::Program(p)) => Ok(p),
            _ => Err(StatusCode::INVALID_PROGRAM),
        }
    }

    fn program_mut(&mut self, program: ProgramHandle) -> ApiResult<&mut ProgramObject> {
        match self.objects.get_mut(&program.raw()) {
            Some(Object::Program(p)) => Ok(p),
            _ => Err(StatusCode::INVALID_PROGRAM),
        }
    }

    fn insert(&mut self, object: Object) -> u64 {
        let id = self.allocate_id();
        self.objects.insert(id, object);
        id
    }
}

/// A simulated accelerator runtime.
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<State>,
    sources: SourceModules,
    compile_delays: HashMap<String, Duration>,
}

impl SimulatedDevice {
    /// One platform with one GPU, resolving includes against `sources`.
    #[must_use]
    pub fn new(sources: SourceModules) -> Self {
        Self::builder()
            .platform(DEFAULT_PLATFORM_NAME)
            .device(DEFAULT_DEVICE_NAME, DeviceType::Gpu)
            .sources(sources)
            .build()
    }

    /// An empty builder: no platforms, no sources, no faults.
    #[must_use]
    pub fn builder() -> SimulatedDeviceBuilder {
        SimulatedDeviceBuilder::default()
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state.lock().journal.clone()
    }

    /// The operation of every call made so far, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().journal.iter().map(|e| e.call.operation()).collect()
    }

    /// Contexts, queues, programs, kernels and buffers not yet released.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Devices released so far.
    #[must_use]
    pub fn released_devices(&self) -> usize {
        self.state.lock().devices.values().filter(|d| d.released).count()
    }

    /// Launches that have completed (drained).
    #[must_use]
    pub fn completed_launches(&self) -> Vec<Launch> {
        self.state.lock().completed.clone()
    }

    /// Launches enqueued but not yet drained, across all queues.
    #[must_use]
    pub fn pending_launches(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .map(|o| match o {
                Object::Queue { pending } => pending.len(),
                _ => 0,
            })
            .sum()
    }

    /// Bytes currently allocated on `device`.
    #[must_use]
    pub fn allocated_bytes(&self, device: DeviceId) -> u64 {
        self.state.lock().devices.get(&device).map_or(0, |d| d.allocated)
    }

    fn invoke<T>(
        &self,
        call: Call,
        created: fn(&T) -> Option<Resource>,
        body: impl FnOnce(&mut State) -> ApiResult<T>,
    ) -> ApiResult<T> {
        let mut state = self.state.lock();
        let operation = call.operation();
        let result = match state.injected_fault(operation) {
            Some(status) => Err(status),
            None => body(&mut state),
        };
        let status = result.as_ref().err().copied().unwrap_or(StatusCode::SUCCESS);
        trace!(%operation, %status, "simulated call");
        state.journal.push(JournalEntry {
            call,
            status,
            created: result.as_ref().ok().and_then(created),
        });
        result
    }

    fn release_object(&self, resource: Resource, invalid: StatusCode) -> ApiResult<()> {
        self.invoke(Call::Release(resource), |_| None, |state| {
            let raw = match resource {
                Resource::Context(h) => h.raw(),
                Resource::Queue(h) => h.raw(),
                Resource::Program(h) => h.raw(),
                Resource::Kernel(h) => h.raw(),
                Resource::Mem(h) => h.raw(),
                Resource::Device(_) => return Err(StatusCode::INVALID_VALUE),
            };
            let matches = matches!(
                (resource, state.objects.get(&raw)),
                (Resource::Context(_), Some(Object::Context { .. }))
                    | (Resource::Queue(_), Some(Object::Queue { .. }))
                    | (Resource::Program(_), Some(Object::Program(_)))
                    | (Resource::Kernel(_), Some(Object::Kernel { .. }))
                    | (Resource::Mem(_), Some(Object::Mem { .. }))
            );
            if !matches {
                return Err(invalid);
            }
            match state.objects.remove(&raw) {
                Some(Object::Mem { device, size }) => {
                    if let Some(entry) = state.devices.get_mut(&device) {
                        entry.allocated = entry.allocated.saturating_sub(size);
                    }
                }
                Some(Object::Queue { pending }) => state.completed.extend(pending),
                _ => {}
            }
            debug!(%resource, "released");
            Ok(())
        })
    }

    /// Expand includes in `text`, appending to `out`.
    ///
    /// Returns the compiler log line on failure.
    fn preprocess(&self, text: &str, origin: &str, depth: usize, out: &mut String, included: &mut Vec<String>) -> Result<(), String> {
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("#include") {
                let Some(name) = quoted(rest) else {
                    return Err(format!("{origin}:{line_no}:10: error: expected \"FILENAME\""));
                };
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(format!("{origin}:{line_no}:10: fatal error: #include nested too deeply"));
                }
                let Some(source) = self.sources.get(name) else {
                    return Err(format!("{origin}:{line_no}:10: fatal error: '{name}' file not found"));
                };
                included.push(name.to_string());
                self.preprocess(source, name, depth + 1, out, included)?;
            } else if let Some(message) = trimmed.strip_prefix("#error") {
                return Err(format!("{origin}:{line_no}:2: error: {}", message.trim()));
            } else {
                out.push_str(line);
                out.push('\n');
            }
        }
        Ok(())
    }

    /// Preprocess and scan a source program, honouring compile delays.
    fn compile_source(&self, source: &str) -> Result<Vec<KernelSignature>, String> {
        let mut expanded = String::new();
        let mut included = Vec::new();
        let result = self.preprocess(source, TOP_LEVEL_ORIGIN, 0, &mut expanded, &mut included);
        for module in &included {
            if let Some(delay) = self.compile_delays.get(module) {
                std::thread::sleep(*delay);
            }
        }
        result?;
        Ok(scan_kernels(&expanded))
    }
}

impl DeviceApi for SimulatedDevice {
    fn platform_ids(&self) -> ApiResult<Vec<PlatformId>> {
        self.invoke(Call::PlatformIds, |_| None, |state| {
            if state.platforms.is_empty() {
                return Err(StatusCode::PLATFORM_NOT_FOUND);
            }
            Ok(state.platforms.iter().map(|p| p.id).collect())
        })
    }

    fn platform_name(&self, platform: PlatformId) -> ApiResult<String> {
        self.invoke(Call::PlatformName(platform), |_| None, |state| {
            state
                .platforms
                .iter()
                .find(|p| p.id == platform)
                .map(|p| p.name.clone())
                .ok_or(StatusCode::INVALID_PLATFORM)
        })
    }

    fn device_ids(&self, platform: PlatformId, device_type: DeviceType) -> ApiResult<Vec<DeviceId>> {
        let call = Call::DeviceIds { platform, device_type };
        self.invoke(call, |_| None, |state| {
            let entry = state
                .platforms
                .iter()
                .find(|p| p.id == platform)
                .ok_or(StatusCode::INVALID_PLATFORM)?;
            let mut devices: Vec<DeviceId> = entry
                .devices
                .iter()
                .copied()
                .filter(|d| state.devices.get(d).is_some_and(|e| device_type.admits(e.spec.device_type)))
                .collect();
            if device_type == DeviceType::Default {
                devices.truncate(1);
            }
            if devices.is_empty() {
                return Err(StatusCode::DEVICE_NOT_FOUND);
            }
            Ok(devices)
        })
    }

    fn device_name(&self, device: DeviceId) -> ApiResult<String> {
        self.invoke(Call::DeviceName(device), |_| None, |state| {
            state.live_device(device).map(|d| d.spec.name.clone())
        })
    }

    fn create_context(&self, devices: &[DeviceId]) -> ApiResult<ContextHandle> {
        let call = Call::CreateContext {
            devices: devices.to_vec(),
        };
        self.invoke(call, |c| Some(Resource::Context(*c)), |state| {
            if devices.is_empty() {
                return Err(StatusCode::INVALID_VALUE);
            }
            for device in devices {
                state.live_device(*device)?;
            }
            let id = state.insert(Object::Context {
                devices: devices.to_vec(),
            });
            Ok(ContextHandle::from_raw(id))
        })
    }

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceId,
        properties: QueueProperties,
    ) -> ApiResult<QueueHandle> {
        let call = Call::CreateCommandQueue {
            context,
            device,
            properties,
        };
        self.invoke(call, |q| Some(Resource::Queue(*q)), |state| {
            if !state.context_devices(context)?.contains(&device) {
                return Err(StatusCode::INVALID_DEVICE);
            }
            let id = state.insert(Object::Queue { pending: Vec::new() });
            Ok(QueueHandle::from_raw(id))
        })
    }

    fn create_program_with_source(&self, context: ContextHandle, sources: &[&str]) -> ApiResult<ProgramHandle> {
        let source = sources.concat();
        let call = Call::CreateProgramWithSource {
            context,
            source: source.clone(),
        };
        self.invoke(call, |p| Some(Resource::Program(*p)), |state| {
            state.context_devices(context)?;
            if source.is_empty() {
                return Err(StatusCode::INVALID_VALUE);
            }
            let id = state.insert(Object::Program(ProgramObject {
                source: Some(source),
                stage: Stage::Source,
                log: String::new(),
                kernels: Vec::new(),
            }));
            Ok(ProgramHandle::from_raw(id))
        })
    }

    fn build_program(&self, program: ProgramHandle, devices: &[DeviceId], options: &str) -> ApiResult<()> {
        let call = Call::BuildProgram {
            program,
            options: options.to_string(),
        };
        self.invoke(call, |_| None, |state| {
            for device in devices {
                state.live_device(*device)?;
            }
            let source = source_for_compile(state.program(program)?)?;
            validate_options(options).map_err(|()| StatusCode::INVALID_BUILD_OPTIONS)?;

            let outcome = self
                .compile_source(&source)
                .and_then(|kernels| check_duplicates(&kernels, TOP_LEVEL_ORIGIN).map(|()| kernels));
            let object = state.program_mut(program)?;
            match outcome {
                Ok(kernels) => {
                    object.stage = Stage::Executable;
                    object.kernels = kernels;
                    object.log.clear();
                    Ok(())
                }
                Err(log) => {
                    object.stage = Stage::Failed;
                    object.log = log;
                    Err(StatusCode::BUILD_PROGRAM_FAILURE)
                }
            }
        })
    }

    fn compile_program(&self, program: ProgramHandle, devices: &[DeviceId], options: &str) -> ApiResult<()> {
        let call = Call::CompileProgram {
            program,
            options: options.to_string(),
        };
        self.invoke(call, |_| None, |state| {
            for device in devices {
                state.live_device(*device)?;
            }
            let source = source_for_compile(state.program(program)?)?;
            validate_options(options).map_err(|()| StatusCode::INVALID_COMPILER_OPTIONS)?;

            let outcome = self.compile_source(&source);
            let object = state.program_mut(program)?;
            match outcome {
                Ok(kernels) => {
                    object.stage = Stage::Compiled;
                    object.kernels = kernels;
                    object.log.clear();
                    Ok(())
                }
                Err(log) => {
                    object.stage = Stage::Failed;
                    object.log = log;
                    Err(StatusCode::COMPILE_PROGRAM_FAILURE)
                }
            }
        })
    }

    fn link_program(
        &self,
        context: ContextHandle,
        devices: &[DeviceId],
        options: &str,
        inputs: &[ProgramHandle],
    ) -> Result<ProgramHandle, LinkFailure> {
        let call = Call::LinkProgram {
            context,
            options: options.to_string(),
            inputs: inputs.to_vec(),
        };
        let mut log_program = None;
        let result = self.invoke(call, |p| Some(Resource::Program(*p)), |state| {
            let kernels = link_inputs(state, context, devices, options, inputs)?;
            let failed = check_duplicates(&kernels, "<link>").err();
            let (stage, log, kernels) = match failed {
                None => (Stage::Executable, String::new(), kernels),
                Some(log) => (Stage::Failed, log, Vec::new()),
            };
            let program = ProgramHandle::from_raw(state.insert(Object::Program(ProgramObject {
                source: None,
                stage,
                log,
                kernels,
            })));
            if stage == Stage::Failed {
                log_program = Some(program);
                return Err(StatusCode::LINK_PROGRAM_FAILURE);
            }
            Ok(program)
        });
        if let Some(program) = log_program {
            // A failed link still hands back a program carrying the log.
            if let Some(entry) = self.state.lock().journal.last_mut() {
                entry.created = Some(Resource::Program(program));
            }
        }
        result.map_err(|status| LinkFailure {
            status,
            program: log_program,
        })
    }

    fn program_build_log(&self, program: ProgramHandle, device: DeviceId) -> ApiResult<String> {
        let call = Call::ProgramBuildLog { program, device };
        self.invoke(call, |_| None, |state| {
            state.live_device(device)?;
            Ok(state.program(program)?.log.clone())
        })
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> ApiResult<KernelHandle> {
        let call = Call::CreateKernel {
            program,
            name: name.to_string(),
        };
        self.invoke(call, |k| Some(Resource::Kernel(*k)), |state| {
            let object = state.program(program)?;
            if object.stage != Stage::Executable {
                return Err(StatusCode::INVALID_PROGRAM_EXECUTABLE);
            }
            let signature = object
                .kernels
                .iter()
                .find(|k| k.name == name)
                .ok_or(StatusCode::INVALID_KERNEL_NAME)?;
            let args = vec![None; signature.params];
            let id = state.insert(Object::Kernel {
                name: name.to_string(),
                args,
            });
            Ok(KernelHandle::from_raw(id))
        })
    }

    fn create_buffer(&self, context: ContextHandle, access: MemAccess, size: usize) -> ApiResult<MemHandle> {
        let call = Call::CreateBuffer { context, access, size };
        self.invoke(call, |m| Some(Resource::Mem(*m)), |state| {
            let device = *state
                .context_devices(context)?
                .first()
                .ok_or(StatusCode::INVALID_CONTEXT)?;
            if size == 0 {
                return Err(StatusCode::INVALID_BUFFER_SIZE);
            }
            let size = u64::try_from(size).map_err(|_| StatusCode::INVALID_BUFFER_SIZE)?;
            let entry = state.devices.get_mut(&device).ok_or(StatusCode::INVALID_DEVICE)?;
            if entry.allocated.saturating_add(size) > entry.spec.memory_bytes {
                return Err(StatusCode::MEM_OBJECT_ALLOCATION_FAILURE);
            }
            entry.allocated += size;
            let id = state.insert(Object::Mem { device, size });
            Ok(MemHandle::from_raw(id))
        })
    }

    fn set_kernel_arg_buffer(&self, kernel: KernelHandle, index: u32, buffer: MemHandle) -> ApiResult<()> {
        let call = Call::SetKernelArg { kernel, index, buffer };
        self.invoke(call, |_| None, |state| {
            if !matches!(state.objects.get(&buffer.raw()), Some(Object::Mem { .. })) {
                return Err(StatusCode::INVALID_MEM_OBJECT);
            }
            let Some(Object::Kernel { args, .. }) = state.objects.get_mut(&kernel.raw()) else {
                return Err(StatusCode::INVALID_KERNEL);
            };
            let slot = args.get_mut(index as usize).ok_or(StatusCode::INVALID_ARG_INDEX)?;
            *slot = Some(buffer);
            Ok(())
        })
    }

    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_work_size: &[usize],
        local_work_size: Option<&[usize]>,
    ) -> ApiResult<()> {
        let call = Call::EnqueueNdRangeKernel {
            queue,
            kernel,
            global_work_size: global_work_size.to_vec(),
            local_work_size: local_work_size.map(<[usize]>::to_vec),
        };
        self.invoke(call, |_| None, |state| {
            let launch = match state.objects.get(&kernel.raw()) {
                Some(Object::Kernel { name, args }) => {
                    if args.iter().any(Option::is_none) {
                        return Err(StatusCode::INVALID_KERNEL_ARGS);
                    }
                    Launch {
                        kernel: name.clone(),
                        global_work_size: global_work_size.to_vec(),
                    }
                }
                _ => return Err(StatusCode::INVALID_KERNEL),
            };
            if global_work_size.is_empty() || global_work_size.len() > 3 {
                return Err(StatusCode::INVALID_WORK_DIMENSION);
            }
            if global_work_size.contains(&0) {
                return Err(StatusCode::INVALID_GLOBAL_WORK_SIZE);
            }
            if let Some(local) = local_work_size {
                if local.len() != global_work_size.len() {
                    return Err(StatusCode::INVALID_WORK_DIMENSION);
                }
                if local.iter().zip(global_work_size).any(|(l, g)| *l == 0 || g % l != 0) {
                    return Err(StatusCode::INVALID_WORK_GROUP_SIZE);
                }
            }
            let Some(Object::Queue { pending }) = state.objects.get_mut(&queue.raw()) else {
                return Err(StatusCode::INVALID_COMMAND_QUEUE);
            };
            pending.push(launch);
            Ok(())
        })
    }

    fn finish(&self, queue: QueueHandle) -> ApiResult<()> {
        self.invoke(Call::Finish(queue), |_| None, |state| {
            let Some(Object::Queue { pending }) = state.objects.get_mut(&queue.raw()) else {
                return Err(StatusCode::INVALID_COMMAND_QUEUE);
            };
            let drained = std::mem::take(pending);
            state.completed.extend(drained);
            Ok(())
        })
    }

    fn release_kernel(&self, kernel: KernelHandle) -> ApiResult<()> {
        self.release_object(Resource::Kernel(kernel), StatusCode::INVALID_KERNEL)
    }

    fn release_mem_object(&self, buffer: MemHandle) -> ApiResult<()> {
        self.release_object(Resource::Mem(buffer), StatusCode::INVALID_MEM_OBJECT)
    }

    fn release_program(&self, program: ProgramHandle) -> ApiResult<()> {
        self.release_object(Resource::Program(program), StatusCode::INVALID_PROGRAM)
    }

    fn release_command_queue(&self, queue: QueueHandle) -> ApiResult<()> {
        self.release_object(Resource::Queue(queue), StatusCode::INVALID_COMMAND_QUEUE)
    }

    fn release_context(&self, context: ContextHandle) -> ApiResult<()> {
        self.release_object(Resource::Context(context), StatusCode::INVALID_CONTEXT)
    }

    fn release_device(&self, device: DeviceId) -> ApiResult<()> {
        self.invoke(Call::Release(Resource::Device(device)), |_| None, |state| {
            match state.devices.get_mut(&device) {
                Some(entry) if !entry.released => {
                    entry.released = true;
                    debug!(%device, "released");
                    Ok(())
                }
                _ => Err(StatusCode::INVALID_DEVICE),
            }
        })
    }
}

/// Validate link inputs and collect their kernels in input order.
fn link_inputs(
    state: &State,
    context: ContextHandle,
    devices: &[DeviceId],
    options: &str,
    inputs: &[ProgramHandle],
) -> ApiResult<Vec<KernelSignature>> {
    state.context_devices(context)?;
    for device in devices {
        state.live_device(*device)?;
    }
    if inputs.is_empty() {
        return Err(StatusCode::INVALID_VALUE);
    }
    validate_options(options).map_err(|()| StatusCode::INVALID_LINKER_OPTIONS)?;
    let mut kernels = Vec::new();
    for input in inputs {
        let object = state.program(*input)?;
        if object.stage != Stage::Compiled {
            return Err(StatusCode::INVALID_OPERATION);
        }
        kernels.extend(object.kernels.iter().cloned());
    }
    Ok(kernels)
}

fn source_for_compile(object: &ProgramObject) -> ApiResult<String> {
    match (&object.source, object.stage) {
        (Some(source), Stage::Source) => Ok(source.clone()),
        _ => Err(StatusCode::INVALID_OPERATION),
    }
}

/// Options are flags; only `-D` and `-I` take a separate value.
fn validate_options(options: &str) -> Result<(), ()> {
    let mut expects_value = false;
    for token in options.split_whitespace() {
        if expects_value {
            expects_value = false;
            continue;
        }
        if !token.starts_with('-') {
            return Err(());
        }
        if token == "-D" || token == "-I" {
            expects_value = true;
        }
        if let Some(standard) = token.strip_prefix("-cl-std=") {
            if !SUPPORTED_STANDARDS.contains(&standard) {
                return Err(());
            }
        }
    }
    if expects_value { Err(()) } else { Ok(()) }
}

fn check_duplicates(kernels: &[KernelSignature], origin: &str) -> Result<(), String> {
    let mut seen = HashSet::new();
    for kernel in kernels {
        if !seen.insert(kernel.name.as_str()) {
            return Err(format!(
                "{origin}: error: duplicate symbol '{}' defined by more than one kernel",
                kernel.name
            ));
        }
    }
    Ok(())
}

/// The `"name"` part of an include directive tail.
fn quoted(rest: &str) -> Option<&str> {
    let inner = rest.trim().strip_prefix('"')?;
    let end = inner.find('"')?;
    let name = &inner[..end];
    (!name.is_empty()).then_some(name)
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Punct(char),
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
        } else if text[i..].starts_with("//") {
            i = text[i..].find('\n').map_or(bytes.len(), |n| i + n);
        } else if text[i..].starts_with("/*") {
            i = text[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
        } else if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Token::Ident(&text[start..i]));
        } else if c.is_ascii() {
            tokens.push(Token::Punct(c as char));
            i += 1;
        } else {
            // Skip the whole multi-byte character.
            i += text[i..].chars().next().map_or(1, char::len_utf8);
        }
    }
    tokens
}

/// Find `kernel void name(params)` definitions and count their parameters.
fn scan_kernels(text: &str) -> Vec<KernelSignature> {
    let tokens = tokenize(text);
    let mut kernels = Vec::new();
    let mut i = 0;
    while i + 3 < tokens.len() {
        let is_kernel = matches!(tokens[i], Token::Ident("__kernel" | "kernel"));
        let header = (&tokens[i + 1], &tokens[i + 2], &tokens[i + 3]);
        let (Token::Ident("void"), Token::Ident(name), Token::Punct('(')) = header else {
            i += 1;
            continue;
        };
        if !is_kernel {
            i += 1;
            continue;
        }

        let mut depth = 1usize;
        let mut commas = 0usize;
        let mut body = Vec::new();
        let mut j = i + 4;
        while j < tokens.len() && depth > 0 {
            match tokens[j] {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => depth -= 1,
                Token::Punct(',') if depth == 1 => commas += 1,
                _ => {}
            }
            if depth > 0 {
                body.push(&tokens[j]);
            }
            j += 1;
        }
        let params = match body.as_slice() {
            [] | [Token::Ident("void")] => 0,
            _ => commas + 1,
        };
        kernels.push(KernelSignature {
            name: (*name).to_string(),
            params,
        });
        i = j;
    }
    kernels
}
