//! Multi-module compilation and linking.
//!
//! Each module name becomes a one-line source unit, `#include "<name>"`,
//! compiled on its own against the target device. The compiled units are then
//! linked, in the order given, into a single executable program.
//!
//! Compiled units never escape this module. They are held by a guard that
//! releases each of them exactly once when compilation or linking finishes,
//! whichever way it finishes.

use tracing::{debug, info, warn};

use crate::device::{ContextHandle, DeviceApi, DeviceId, Operation, ProgramHandle, Resource};
use crate::diagnostics::{LOG_CAPACITY, report_build_log};
use crate::error::{BootError, Result};

/// Synthesize the source unit for module `name`.
///
/// Names that are empty or that contain a quote or a line break cannot be
/// written as an include directive and are rejected.
pub fn include_directive(name: &str) -> Result<String> {
    if name.is_empty() || name.contains(['"', '\n', '\r']) {
        return Err(BootError::InvalidModuleName(name.to_string()));
    }
    Ok(format!("#include \"{name}\""))
}

/// Release `resource`, logging instead of failing.
pub(crate) fn release_quietly<B: DeviceApi + ?Sized>(api: &B, resource: Resource) {
    match resource.release(api) {
        Ok(()) => debug!(%resource, "released"),
        Err(status) => warn!(%resource, %status, "release failed"),
    }
}

/// Compiled units awaiting link. Released on drop.
struct CompiledUnits<'a, B: DeviceApi + ?Sized> {
    api: &'a B,
    units: Vec<ProgramHandle>,
}

impl<'a, B: DeviceApi + ?Sized> CompiledUnits<'a, B> {
    fn with_capacity(api: &'a B, capacity: usize) -> Self {
        Self {
            api,
            units: Vec::with_capacity(capacity),
        }
    }
}

impl<B: DeviceApi + ?Sized> Drop for CompiledUnits<'_, B> {
    fn drop(&mut self) {
        while let Some(unit) = self.units.pop() {
            release_quietly(self.api, Resource::Program(unit));
        }
    }
}

/// Compiles and links source modules for one device.
#[derive(Debug)]
pub struct ModuleLinker<'a, B: ?Sized> {
    api: &'a B,
    context: ContextHandle,
    device: DeviceId,
    log_capacity: usize,
}

impl<'a, B: DeviceApi + ?Sized> ModuleLinker<'a, B> {
    /// Create a linker targeting `device` within `context`.
    pub const fn new(api: &'a B, context: ContextHandle, device: DeviceId) -> Self {
        Self {
            api,
            context,
            device,
            log_capacity: LOG_CAPACITY,
        }
    }

    /// Bound reported compiler and linker logs to `capacity` bytes.
    #[must_use]
    pub const fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Compile every module in order, then link them into one program.
    ///
    /// Stops at the first module that fails to compile; later modules are
    /// never submitted and no link is attempted. The returned program is
    /// owned by the caller.
    ///
    /// # Errors
    ///
    /// - [`BootError::EmptyModuleList`] or [`BootError::InvalidModuleName`]
    ///   before any device call.
    /// - [`BootError::Compile`] naming the first failing module.
    /// - [`BootError::Link`] if linking fails.
    /// - [`BootError::DeviceApi`] if a unit cannot be created.
    pub fn compile_and_link<S: AsRef<str>>(
        &self,
        compile_options: &str,
        link_options: &str,
        modules: &[S],
    ) -> Result<ProgramHandle> {
        if modules.is_empty() {
            return Err(BootError::EmptyModuleList);
        }
        let sources = modules
            .iter()
            .map(|m| include_directive(m.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let mut compiled = CompiledUnits::with_capacity(self.api, modules.len());
        for (module, source) in modules.iter().zip(&sources) {
            let module: &str = module.as_ref();
            let unit = self
                .api
                .create_program_with_source(self.context, &[source.as_str()])
                .map_err(|status| BootError::device(Operation::CreateProgramWithSource, status))?;
            compiled.units.push(unit);

            debug!(module, %unit, "compiling");
            if let Err(status) = self.api.compile_program(unit, &[self.device], compile_options) {
                let log = report_build_log(self.api, unit, self.device, self.log_capacity);
                return Err(BootError::Compile {
                    module: module.to_string(),
                    status,
                    log,
                });
            }
        }

        match self
            .api
            .link_program(self.context, &[self.device], link_options, &compiled.units)
        {
            Ok(program) => {
                info!(%program, modules = modules.len(), "linked program");
                Ok(program)
            }
            Err(failure) => {
                let log = match failure.program {
                    Some(program) => {
                        let log = report_build_log(self.api, program, self.device, self.log_capacity);
                        release_quietly(self.api, Resource::Program(program));
                        log
                    }
                    None => {
                        warn!(status = %failure.status, "link produced no program to query for a log");
                        String::new()
                    }
                };
                Err(BootError::Link {
                    status: failure.status,
                    log,
                })
            }
        }
    }
}

/// Compile and link `modules` for `device`, using the default log capacity.
///
/// See [`ModuleLinker::compile_and_link`].
pub fn compile_and_link<B, S>(
    api: &B,
    context: ContextHandle,
    device: DeviceId,
    compile_options: &str,
    link_options: &str,
    modules: &[S],
) -> Result<ProgramHandle>
where
    B: DeviceApi + ?Sized,
    S: AsRef<str>,
{
    ModuleLinker::new(api, context, device).compile_and_link(compile_options, link_options, modules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;
    use crate::simulated::{Call, SimulatedDevice};
    use crate::sources::SourceModules;
    use crate::status::StatusCode;
    use test_case::test_case;

    fn sources() -> SourceModules {
        SourceModules::new()
            .with_module("util.cl", "int add_one(int x) { return x + 1; }\n")
            .with_module("main.cl", "__kernel void cl_main(__global char* p) { p[0] = 0; }\n")
            .with_module("bad.cl", "#error not today\n")
            .with_module("dup.cl", "__kernel void cl_main(__global char* p) {}\n")
    }

    fn open(device: &SimulatedDevice) -> (DeviceId, ContextHandle) {
        let platform = device.platform_ids().expect("platforms")[0];
        let dev = device.device_ids(platform, DeviceType::All).expect("devices")[0];
        let context = device.create_context(&[dev]).expect("context");
        (dev, context)
    }

    fn compiled_modules(device: &SimulatedDevice) -> Vec<String> {
        device
            .journal()
            .into_iter()
            .filter_map(|e| match e.call {
                Call::CreateProgramWithSource { source, .. } => Some(source),
                _ => None,
            })
            .collect()
    }

    #[test_case("main.cl", Some("#include \"main.cl\""); "plain name")]
    #[test_case("dir/sub module.cl", Some("#include \"dir/sub module.cl\""); "path with space")]
    #[test_case("", None; "empty")]
    #[test_case("a\"b.cl", None; "quote")]
    #[test_case("a\nb.cl", None; "newline")]
    fn include_directive_cases(name: &str, expected: Option<&str>) {
        let result = include_directive(name);
        match expected {
            Some(directive) => assert_eq!(result.expect("valid name"), directive),
            None => assert!(matches!(result, Err(BootError::InvalidModuleName(_)))),
        }
    }

    #[test]
    fn links_modules_and_releases_units() {
        let device = SimulatedDevice::new(sources());
        let (dev, context) = open(&device);
        let program = compile_and_link(&device, context, dev, "", "", &["util.cl", "main.cl"]).expect("link");

        // Context plus the linked program; both units are gone.
        assert_eq!(device.live_objects(), 2);
        assert!(device.create_kernel(program, "cl_main").is_ok());
        assert_eq!(compiled_modules(&device), [
            "#include \"util.cl\"",
            "#include \"main.cl\"",
        ]);
    }

    #[test]
    fn empty_module_list_makes_no_device_calls() {
        let device = SimulatedDevice::new(sources());
        let (dev, context) = open(&device);
        let before = device.journal().len();
        let modules: [&str; 0] = [];
        let err = compile_and_link(&device, context, dev, "", "", &modules).expect_err("empty");
        assert!(matches!(err, BootError::EmptyModuleList));
        assert_eq!(device.journal().len(), before);
    }

    #[test]
    fn invalid_name_rejected_before_any_compile() {
        let device = SimulatedDevice::new(sources());
        let (dev, context) = open(&device);
        let err = compile_and_link(&device, context, dev, "", "", &["util.cl", "bad\".cl"]).expect_err("invalid");
        assert!(matches!(err, BootError::InvalidModuleName(ref n) if n == "bad\".cl"));
        assert!(compiled_modules(&device).is_empty());
    }

    #[test]
    fn compile_failure_stops_at_failing_module() {
        let device = SimulatedDevice::new(sources());
        let (dev, context) = open(&device);
        let err = compile_and_link(&device, context, dev, "", "", &["util.cl", "bad.cl", "main.cl"])
            .expect_err("compile failure");

        match &err {
            BootError::Compile { module, status, log } => {
                assert_eq!(module, "bad.cl");
                assert_eq!(*status, StatusCode::COMPILE_PROGRAM_FAILURE);
                assert!(log.contains("not today"), "log was {log:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(compiled_modules(&device).len(), 2);
        assert!(!device.operations().contains(&Operation::LinkProgram));
        assert_eq!(device.live_objects(), 1);
    }

    #[test]
    fn link_failure_reports_and_releases_log_program() {
        let device = SimulatedDevice::new(sources());
        let (dev, context) = open(&device);
        let err = compile_and_link(&device, context, dev, "", "", &["main.cl", "dup.cl"]).expect_err("link failure");

        match &err {
            BootError::Link { status, log } => {
                assert_eq!(*status, StatusCode::LINK_PROGRAM_FAILURE);
                assert!(log.contains("duplicate symbol 'cl_main'"), "log was {log:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(device.live_objects(), 1);
    }

    #[test]
    fn compile_options_are_forwarded() {
        let device = SimulatedDevice::new(sources());
        let (dev, context) = open(&device);
        let err = compile_and_link(&device, context, dev, "-cl-std=CL0.1", "", &["main.cl"]).expect_err("bad options");
        assert_eq!(err.status(), Some(StatusCode::INVALID_COMPILER_OPTIONS));
        assert_eq!(device.live_objects(), 1);
    }

    #[test]
    fn unit_creation_failure_releases_earlier_units() {
        let device = SimulatedDevice::builder()
            .device("gpu", DeviceType::Gpu)
            .sources(sources())
            .fail_nth(Operation::CreateProgramWithSource, 2, StatusCode::OUT_OF_HOST_MEMORY)
            .build();
        let (dev, context) = open(&device);
        let err = compile_and_link(&device, context, dev, "", "", &["util.cl", "main.cl"]).expect_err("create failure");
        assert!(matches!(
            err,
            BootError::DeviceApi {
                operation: Operation::CreateProgramWithSource,
                status: StatusCode::OUT_OF_HOST_MEMORY,
            }
        ));
        assert_eq!(device.live_objects(), 1);
    }
}
