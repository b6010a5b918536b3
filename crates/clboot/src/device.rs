//! Device API boundary.
//!
//! The accelerator runtime is reached only through the [`DeviceApi`] trait.
//! Handles are opaque, `Copy` identifiers; ownership of the objects behind
//! them is tracked by the lifecycle layer, never by the handles themselves.
//!
//! Methods take `&self`: a device API is a stateful external service and
//! implementations are expected to use interior mutability. This lets kernels
//! and buffers borrow a session while the same backend is shared.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::status::StatusCode;

/// Result of a single device API call.
pub type ApiResult<T> = std::result::Result<T, StatusCode>;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw backend identifier.
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw backend identifier.
            #[must_use]
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle!(
    /// A compute platform (one vendor implementation of the API).
    PlatformId,
    "platform"
);
handle!(
    /// A physical or virtual accelerator device.
    DeviceId,
    "device"
);
handle!(
    /// An execution context bound to one device.
    ContextHandle,
    "context"
);
handle!(
    /// An in-order command queue.
    QueueHandle,
    "queue"
);
handle!(
    /// A program object: source, compiled unit, or linked executable.
    ProgramHandle,
    "program"
);
handle!(
    /// A kernel entry point extracted from an executable program.
    KernelHandle,
    "kernel"
);
handle!(
    /// A device memory object.
    MemHandle,
    "mem"
);

/// Device type filter used when enumerating devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// The platform's default device.
    Default,
    /// Host CPU devices.
    Cpu,
    /// GPUs.
    Gpu,
    /// Dedicated accelerators.
    Accelerator,
    /// Every device on the platform.
    #[default]
    All,
}

impl DeviceType {
    /// Lowercase name, as used in configuration files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::Accelerator => "accelerator",
            Self::All => "all",
        }
    }

    /// Whether a device of type `other` passes this filter.
    #[must_use]
    pub const fn admits(self, other: Self) -> bool {
        match self {
            Self::All => true,
            Self::Default => true,
            _ => self as u8 == other as u8,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "accelerator" => Ok(Self::Accelerator),
            "all" => Ok(Self::All),
            other => Err(format!("unknown device type '{other}'")),
        }
    }
}

/// Command queue creation flags.
///
/// The default is a plain in-order queue without profiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueProperties {
    /// Allow out-of-order execution.
    pub out_of_order: bool,
    /// Collect profiling timestamps.
    pub profiling: bool,
}

/// Host access mode for a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemAccess {
    /// Kernel may read and write.
    #[default]
    ReadWrite,
    /// Kernel may only read.
    ReadOnly,
    /// Kernel may only write.
    WriteOnly,
}

/// A failed link.
///
/// Like the underlying API, a failed link may still produce a program object
/// that carries the linker log. The caller owns it and must release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkFailure {
    /// Status reported by the linker.
    pub status: StatusCode,
    /// Program object holding the log, if one was created.
    pub program: Option<ProgramHandle>,
}

/// Device API entry points, used to label errors and journal entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Platform enumeration.
    PlatformIds,
    /// Platform name query.
    PlatformName,
    /// Device enumeration.
    DeviceIds,
    /// Device name query.
    DeviceName,
    /// Context creation.
    CreateContext,
    /// Command queue creation.
    CreateCommandQueue,
    /// Program creation from source text.
    CreateProgramWithSource,
    /// Single-step build.
    BuildProgram,
    /// Compilation of one unit.
    CompileProgram,
    /// Linking of compiled units.
    LinkProgram,
    /// Build log query.
    ProgramBuildLog,
    /// Kernel extraction.
    CreateKernel,
    /// Buffer allocation.
    CreateBuffer,
    /// Kernel argument binding.
    SetKernelArg,
    /// Kernel launch.
    EnqueueNdRangeKernel,
    /// Queue drain.
    Finish,
    /// Kernel release.
    ReleaseKernel,
    /// Buffer release.
    ReleaseMemObject,
    /// Program release.
    ReleaseProgram,
    /// Queue release.
    ReleaseCommandQueue,
    /// Context release.
    ReleaseContext,
    /// Device release.
    ReleaseDevice,
}

impl Operation {
    /// Name of the corresponding runtime entry point.
    #[must_use]
    pub const fn api_name(self) -> &'static str {
        match self {
            Self::PlatformIds => "clGetPlatformIDs",
            Self::PlatformName => "clGetPlatformInfo",
            Self::DeviceIds => "clGetDeviceIDs",
            Self::DeviceName => "clGetDeviceInfo",
            Self::CreateContext => "clCreateContext",
            Self::CreateCommandQueue => "clCreateCommandQueue",
            Self::CreateProgramWithSource => "clCreateProgramWithSource",
            Self::BuildProgram => "clBuildProgram",
            Self::CompileProgram => "clCompileProgram",
            Self::LinkProgram => "clLinkProgram",
            Self::ProgramBuildLog => "clGetProgramBuildInfo",
            Self::CreateKernel => "clCreateKernel",
            Self::CreateBuffer => "clCreateBuffer",
            Self::SetKernelArg => "clSetKernelArg",
            Self::EnqueueNdRangeKernel => "clEnqueueNDRangeKernel",
            Self::Finish => "clFinish",
            Self::ReleaseKernel => "clReleaseKernel",
            Self::ReleaseMemObject => "clReleaseMemObject",
            Self::ReleaseProgram => "clReleaseProgram",
            Self::ReleaseCommandQueue => "clReleaseCommandQueue",
            Self::ReleaseContext => "clReleaseContext",
            Self::ReleaseDevice => "clReleaseDevice",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// An owned device object, as tracked for release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// Selected device.
    Device(DeviceId),
    /// Execution context.
    Context(ContextHandle),
    /// Command queue.
    Queue(QueueHandle),
    /// Program (compiled unit or executable).
    Program(ProgramHandle),
    /// Kernel.
    Kernel(KernelHandle),
    /// Device buffer.
    Mem(MemHandle),
}

impl Resource {
    /// The release entry point for this kind of object.
    #[must_use]
    pub const fn release_operation(self) -> Operation {
        match self {
            Self::Device(_) => Operation::ReleaseDevice,
            Self::Context(_) => Operation::ReleaseContext,
            Self::Queue(_) => Operation::ReleaseCommandQueue,
            Self::Program(_) => Operation::ReleaseProgram,
            Self::Kernel(_) => Operation::ReleaseKernel,
            Self::Mem(_) => Operation::ReleaseMemObject,
        }
    }

    /// Release the object through `api`.
    pub fn release<B: DeviceApi + ?Sized>(self, api: &B) -> ApiResult<()> {
        match self {
            Self::Device(h) => api.release_device(h),
            Self::Context(h) => api.release_context(h),
            Self::Queue(h) => api.release_command_queue(h),
            Self::Program(h) => api.release_program(h),
            Self::Kernel(h) => api.release_kernel(h),
            Self::Mem(h) => api.release_mem_object(h),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(h) => fmt::Display::fmt(h, f),
            Self::Context(h) => fmt::Display::fmt(h, f),
            Self::Queue(h) => fmt::Display::fmt(h, f),
            Self::Program(h) => fmt::Display::fmt(h, f),
            Self::Kernel(h) => fmt::Display::fmt(h, f),
            Self::Mem(h) => fmt::Display::fmt(h, f),
        }
    }
}

/// The external accelerator runtime.
///
/// Every call either succeeds or reports a [`StatusCode`]. Implementations
/// must not release objects on their own; the caller releases everything it
/// created, exactly once.
pub trait DeviceApi {
    /// Enumerate available platforms.
    fn platform_ids(&self) -> ApiResult<Vec<PlatformId>>;

    /// Human-readable platform name.
    fn platform_name(&self, platform: PlatformId) -> ApiResult<String>;

    /// Enumerate devices of `device_type` on `platform`.
    fn device_ids(&self, platform: PlatformId, device_type: DeviceType) -> ApiResult<Vec<DeviceId>>;

    /// Human-readable device name.
    fn device_name(&self, device: DeviceId) -> ApiResult<String>;

    /// Create a context spanning `devices`.
    fn create_context(&self, devices: &[DeviceId]) -> ApiResult<ContextHandle>;

    /// Create a command queue for `device` within `context`.
    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceId,
        properties: QueueProperties,
    ) -> ApiResult<QueueHandle>;

    /// Create a program object from source strings.
    fn create_program_with_source(&self, context: ContextHandle, sources: &[&str]) -> ApiResult<ProgramHandle>;

    /// Compile and link a source program in one step.
    fn build_program(&self, program: ProgramHandle, devices: &[DeviceId], options: &str) -> ApiResult<()>;

    /// Compile a source program into a linkable unit.
    fn compile_program(&self, program: ProgramHandle, devices: &[DeviceId], options: &str) -> ApiResult<()>;

    /// Link compiled units, in order, into a new executable program.
    fn link_program(
        &self,
        context: ContextHandle,
        devices: &[DeviceId],
        options: &str,
        inputs: &[ProgramHandle],
    ) -> Result<ProgramHandle, LinkFailure>;

    /// The build/compile/link log of `program` for `device`.
    fn program_build_log(&self, program: ProgramHandle, device: DeviceId) -> ApiResult<String>;

    /// Extract the entry point `name` from an executable program.
    fn create_kernel(&self, program: ProgramHandle, name: &str) -> ApiResult<KernelHandle>;

    /// Allocate `size` bytes of device memory.
    fn create_buffer(&self, context: ContextHandle, access: MemAccess, size: usize) -> ApiResult<MemHandle>;

    /// Bind `buffer` to the zero-based parameter slot `index`.
    fn set_kernel_arg_buffer(&self, kernel: KernelHandle, index: u32, buffer: MemHandle) -> ApiResult<()>;

    /// Enqueue a kernel launch. Returns before the device finishes.
    fn enqueue_nd_range_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        global_work_size: &[usize],
        local_work_size: Option<&[usize]>,
    ) -> ApiResult<()>;

    /// Block until all work enqueued on `queue` has completed.
    fn finish(&self, queue: QueueHandle) -> ApiResult<()>;

    /// Release a kernel.
    fn release_kernel(&self, kernel: KernelHandle) -> ApiResult<()>;

    /// Release a device buffer.
    fn release_mem_object(&self, buffer: MemHandle) -> ApiResult<()>;

    /// Release a program.
    fn release_program(&self, program: ProgramHandle) -> ApiResult<()>;

    /// Release a command queue.
    fn release_command_queue(&self, queue: QueueHandle) -> ApiResult<()>;

    /// Release a context.
    fn release_context(&self, context: ContextHandle) -> ApiResult<()>;

    /// Release a device.
    fn release_device(&self, device: DeviceId) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DeviceType::All, DeviceType::Gpu, true ; "all admits gpu")]
    #[test_case(DeviceType::All, DeviceType::Cpu, true ; "all admits cpu")]
    #[test_case(DeviceType::Gpu, DeviceType::Gpu, true ; "exact match")]
    #[test_case(DeviceType::Gpu, DeviceType::Cpu, false ; "mismatch")]
    #[test_case(DeviceType::Accelerator, DeviceType::Gpu, false ; "accelerator rejects gpu")]
    fn device_type_filter(filter: DeviceType, device: DeviceType, expected: bool) {
        assert_eq!(filter.admits(device), expected);
    }

    #[test]
    fn device_type_parses_case_insensitively() {
        assert_eq!("GPU".parse::<DeviceType>(), Ok(DeviceType::Gpu));
        assert_eq!("all".parse::<DeviceType>(), Ok(DeviceType::All));
        assert!("fpga".parse::<DeviceType>().is_err());
    }

    #[test]
    fn device_type_defaults_to_all() {
        assert_eq!(DeviceType::default(), DeviceType::All);
    }

    #[test]
    fn handle_display() {
        assert_eq!(ProgramHandle::from_raw(7).to_string(), "program#7");
        assert_eq!(Resource::Queue(QueueHandle::from_raw(3)).to_string(), "queue#3");
    }

    #[test]
    fn release_operations_match_resource_kind() {
        assert_eq!(
            Resource::Program(ProgramHandle::from_raw(1)).release_operation(),
            Operation::ReleaseProgram
        );
        assert_eq!(
            Resource::Device(DeviceId::from_raw(1)).release_operation(),
            Operation::ReleaseDevice
        );
        assert_eq!(Operation::EnqueueNdRangeKernel.api_name(), "clEnqueueNDRangeKernel");
    }

    #[test]
    fn default_queue_is_in_order_without_profiling() {
        let props = QueueProperties::default();
        assert!(!props.out_of_order);
        assert!(!props.profiling);
    }
}
