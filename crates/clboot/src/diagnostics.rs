//! Build-log retrieval for compile, link and build failures.

use tracing::{error, warn};

use crate::device::{DeviceApi, DeviceId, ProgramHandle};

/// Default upper bound on a reported build log, in bytes.
pub const LOG_CAPACITY: usize = 2048;

/// Cut `log` to at most `capacity` bytes on a character boundary.
///
/// Truncation is silent; an oversized log is never an error.
#[must_use]
pub fn truncate_log(mut log: String, capacity: usize) -> String {
    if log.len() > capacity {
        let mut end = capacity;
        while !log.is_char_boundary(end) {
            end -= 1;
        }
        log.truncate(end);
    }
    log
}

/// Fetch the build log of `program` on `device` and emit it.
///
/// A failing log query yields a one-line placeholder naming the status
/// instead of an error, so reporting never masks the original failure.
pub fn report_build_log<B>(api: &B, program: ProgramHandle, device: DeviceId, capacity: usize) -> String
where
    B: DeviceApi + ?Sized,
{
    let log = match api.program_build_log(program, device) {
        Ok(log) => truncate_log(log, capacity),
        Err(status) => {
            warn!(%program, %device, %status, "build log unavailable");
            format!("<build log unavailable: {status}>")
        }
    };
    error!(%program, %device, log = %log.trim_end(), "build log");
    log
}
