//! The default run: acquire, build, dispatch one kernel, drain, release.

use serde::Serialize;
use tracing::info;

use crate::config::BootConfig;
use crate::device::DeviceApi;
use crate::error::Result;
use crate::lifecycle::{Bootstrap, ProgramOrigin, Session};

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Name of the selected platform.
    pub platform: String,
    /// Name of the selected device.
    pub device: String,
    /// How the program was produced.
    pub program: ProgramOrigin,
    /// Entry point launched.
    pub kernel: String,
    /// Global work size of the launch.
    pub global_work_size: usize,
}

/// Run the full bootstrap against `api` as described by `config`.
///
/// Every resource acquired is released before this returns, on success and
/// on every error path.
pub fn run<B: DeviceApi + ?Sized>(api: &B, config: &BootConfig) -> Result<RunReport> {
    config.validate()?;

    let queue = Bootstrap::new(api)
        .with_device_type(config.device_type)
        .with_log_capacity(config.log_capacity)
        .select_platform()?
        .select_device()?
        .create_context()?
        .create_queue()?;

    let session = if config.is_multi_module() {
        queue.link_program(config.modules.as_slice(), &config.compile_options, &config.link_options)?
    } else {
        queue.build_program(&config.entry_module, &config.build_options)?
    };

    dispatch_once(&session, config)?;

    let report = RunReport {
        platform: session.platform_name().to_string(),
        device: session.device_name().to_string(),
        program: session.origin().clone(),
        kernel: config.kernel_name.clone(),
        global_work_size: config.global_work_size,
    };
    session.release();
    info!(kernel = %report.kernel, program = %report.program, "run complete");
    Ok(report)
}

/// Launch the configured kernel once with a scratch buffer at argument 0.
fn dispatch_once<B: DeviceApi + ?Sized>(session: &Session<'_, B>, config: &BootConfig) -> Result<()> {
    let kernel = session.create_kernel(&config.kernel_name)?;
    let buffer = session.create_buffer(config.arg_buffer_size)?;
    session.bind_argument(&kernel, 0, &buffer)?;
    session.dispatch(&kernel, config.global_work_size)?;
    session.drain()?;
    // Release failures past this point are logged by the guards, not returned.
    drop(buffer);
    drop(kernel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Operation;
    use crate::error::BootError;
    use crate::simulated::SimulatedDevice;
    use crate::sources::SourceModules;
    use crate::status::StatusCode;

    fn sources() -> SourceModules {
        SourceModules::new().with_module("main.cl", "__kernel void cl_main(__global char* p) { p[0] = 1; }\n")
    }

    #[test]
    fn default_run_succeeds_and_releases_everything() {
        let api = SimulatedDevice::new(sources());
        let report = run(&api, &BootConfig::default()).expect("run");

        assert_eq!(report.kernel, "cl_main");
        assert_eq!(report.global_work_size, 1);
        assert_eq!(report.program, ProgramOrigin::Built {
            source_ref: "main.cl".into()
        });
        assert_eq!(api.completed_launches().len(), 1);
        assert_eq!(api.live_objects(), 0);
        assert_eq!(api.released_devices(), 1);
    }

    #[test]
    fn invalid_config_touches_nothing() {
        let api = SimulatedDevice::new(sources());
        let config = BootConfig {
            global_work_size: 0,
            ..BootConfig::default()
        };
        let err = run(&api, &config).expect_err("invalid");
        assert!(matches!(err, BootError::Config(_)));
        assert!(api.journal().is_empty());
    }

    #[test]
    fn drain_failure_still_releases() {
        let api = SimulatedDevice::builder()
            .device("gpu", crate::device::DeviceType::Gpu)
            .sources(sources())
            .fail(Operation::Finish, StatusCode::OUT_OF_RESOURCES)
            .build();
        let err = run(&api, &BootConfig::default()).expect_err("drain failure");
        assert_eq!(err.status(), Some(StatusCode::OUT_OF_RESOURCES));
        assert_eq!(api.live_objects(), 0);
        assert_eq!(api.released_devices(), 1);
    }

    #[test]
    fn report_serializes_program_origin() {
        let api = SimulatedDevice::new(sources());
        let report = run(&api, &BootConfig::default()).expect("run");
        let json = serde_json::to_value(&report).expect("json");
        assert_eq!(json["program"]["kind"], "built");
        assert_eq!(json["program"]["source_ref"], "main.cl");
    }
}
