//! Device API status codes and their human-readable labels.
//!
//! Every call across the device boundary reports a numeric [`StatusCode`].
//! [`translate`] turns one into a stable label for diagnostic output; it is
//! total, so reporting a failure can never fail in turn.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Label returned for codes outside the known table.
pub const UNKNOWN_LABEL: &str = "CL_UNKNOWN_ERROR";

/// A raw status code returned by the device API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(i32);

macro_rules! status_codes {
    ($($name:ident = $value:literal => $label:literal,)+) => {
        impl StatusCode {
            $(
                #[doc = concat!("`", $label, "`")]
                pub const $name: Self = Self($value);
            )+
        }

        /// Every status code with a known label, in table order.
        pub const KNOWN_CODES: &[StatusCode] = &[$(StatusCode::$name,)+];

        /// Translate a status code into its stable label.
        ///
        /// Unrecognized codes map to [`UNKNOWN_LABEL`].
        #[must_use]
        pub const fn translate(code: StatusCode) -> &'static str {
            match code.0 {
                $($value => $label,)+
                _ => UNKNOWN_LABEL,
            }
        }
    };
}

status_codes! {
    SUCCESS = 0 => "CL_SUCCESS",
    DEVICE_NOT_FOUND = -1 => "CL_DEVICE_NOT_FOUND",
    DEVICE_NOT_AVAILABLE = -2 => "CL_DEVICE_NOT_AVAILABLE",
    COMPILER_NOT_AVAILABLE = -3 => "CL_COMPILER_NOT_AVAILABLE",
    MEM_OBJECT_ALLOCATION_FAILURE = -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
    OUT_OF_RESOURCES = -5 => "CL_OUT_OF_RESOURCES",
    OUT_OF_HOST_MEMORY = -6 => "CL_OUT_OF_HOST_MEMORY",
    PROFILING_INFO_NOT_AVAILABLE = -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
    MEM_COPY_OVERLAP = -8 => "CL_MEM_COPY_OVERLAP",
    IMAGE_FORMAT_MISMATCH = -9 => "CL_IMAGE_FORMAT_MISMATCH",
    IMAGE_FORMAT_NOT_SUPPORTED = -10 => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
    BUILD_PROGRAM_FAILURE = -11 => "CL_BUILD_PROGRAM_FAILURE",
    MAP_FAILURE = -12 => "CL_MAP_FAILURE",
    MISALIGNED_SUB_BUFFER_OFFSET = -13 => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
    EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST = -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
    COMPILE_PROGRAM_FAILURE = -15 => "CL_COMPILE_PROGRAM_FAILURE",
    LINKER_NOT_AVAILABLE = -16 => "CL_LINKER_NOT_AVAILABLE",
    LINK_PROGRAM_FAILURE = -17 => "CL_LINK_PROGRAM_FAILURE",
    DEVICE_PARTITION_FAILED = -18 => "CL_DEVICE_PARTITION_FAILED",
    KERNEL_ARG_INFO_NOT_AVAILABLE = -19 => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
    INVALID_VALUE = -30 => "CL_INVALID_VALUE",
    INVALID_DEVICE_TYPE = -31 => "CL_INVALID_DEVICE_TYPE",
    INVALID_PLATFORM = -32 => "CL_INVALID_PLATFORM",
    INVALID_DEVICE = -33 => "CL_INVALID_DEVICE",
    INVALID_CONTEXT = -34 => "CL_INVALID_CONTEXT",
    INVALID_QUEUE_PROPERTIES = -35 => "CL_INVALID_QUEUE_PROPERTIES",
    INVALID_COMMAND_QUEUE = -36 => "CL_INVALID_COMMAND_QUEUE",
    INVALID_HOST_PTR = -37 => "CL_INVALID_HOST_PTR",
    INVALID_MEM_OBJECT = -38 => "CL_INVALID_MEM_OBJECT",
    INVALID_IMAGE_FORMAT_DESCRIPTOR = -39 => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
    INVALID_IMAGE_SIZE = -40 => "CL_INVALID_IMAGE_SIZE",
    INVALID_SAMPLER = -41 => "CL_INVALID_SAMPLER",
    INVALID_BINARY = -42 => "CL_INVALID_BINARY",
    INVALID_BUILD_OPTIONS = -43 => "CL_INVALID_BUILD_OPTIONS",
    INVALID_PROGRAM = -44 => "CL_INVALID_PROGRAM",
    INVALID_PROGRAM_EXECUTABLE = -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
    INVALID_KERNEL_NAME = -46 => "CL_INVALID_KERNEL_NAME",
    INVALID_KERNEL_DEFINITION = -47 => "CL_INVALID_KERNEL_DEFINITION",
    INVALID_KERNEL = -48 => "CL_INVALID_KERNEL",
    INVALID_ARG_INDEX = -49 => "CL_INVALID_ARG_INDEX",
    INVALID_ARG_VALUE = -50 => "CL_INVALID_ARG_VALUE",
    INVALID_ARG_SIZE = -51 => "CL_INVALID_ARG_SIZE",
    INVALID_KERNEL_ARGS = -52 => "CL_INVALID_KERNEL_ARGS",
    INVALID_WORK_DIMENSION = -53 => "CL_INVALID_WORK_DIMENSION",
    INVALID_WORK_GROUP_SIZE = -54 => "CL_INVALID_WORK_GROUP_SIZE",
    INVALID_WORK_ITEM_SIZE = -55 => "CL_INVALID_WORK_ITEM_SIZE",
    INVALID_GLOBAL_OFFSET = -56 => "CL_INVALID_GLOBAL_OFFSET",
    INVALID_EVENT_WAIT_LIST = -57 => "CL_INVALID_EVENT_WAIT_LIST",
    INVALID_EVENT = -58 => "CL_INVALID_EVENT",
    INVALID_OPERATION = -59 => "CL_INVALID_OPERATION",
    INVALID_GL_OBJECT = -60 => "CL_INVALID_GL_OBJECT",
    INVALID_BUFFER_SIZE = -61 => "CL_INVALID_BUFFER_SIZE",
    INVALID_MIP_LEVEL = -62 => "CL_INVALID_MIP_LEVEL",
    INVALID_GLOBAL_WORK_SIZE = -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
    INVALID_PROPERTY = -64 => "CL_INVALID_PROPERTY",
    INVALID_IMAGE_DESCRIPTOR = -65 => "CL_INVALID_IMAGE_DESCRIPTOR",
    INVALID_COMPILER_OPTIONS = -66 => "CL_INVALID_COMPILER_OPTIONS",
    INVALID_LINKER_OPTIONS = -67 => "CL_INVALID_LINKER_OPTIONS",
    INVALID_DEVICE_PARTITION_COUNT = -68 => "CL_INVALID_DEVICE_PARTITION_COUNT",
    INVALID_PIPE_SIZE = -69 => "CL_INVALID_PIPE_SIZE",
    INVALID_DEVICE_QUEUE = -70 => "CL_INVALID_DEVICE_QUEUE",
    INVALID_SPEC_ID = -71 => "CL_INVALID_SPEC_ID",
    MAX_SIZE_RESTRICTION_EXCEEDED = -72 => "CL_MAX_SIZE_RESTRICTION_EXCEEDED",
    INVALID_GL_SHAREGROUP_REFERENCE = -1000 => "CL_INVALID_GL_SHAREGROUP_REFERENCE_KHR",
    PLATFORM_NOT_FOUND = -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
}

impl StatusCode {
    /// Wrap a raw status value.
    #[must_use]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw numeric value.
    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether this is the success status.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Stable label for this code. See [`translate`].
    #[must_use]
    pub const fn label(self) -> &'static str {
        translate(self)
    }

    /// Whether the code has an entry in the label table.
    #[must_use]
    pub fn is_known(self) -> bool {
        translate(self) != UNKNOWN_LABEL
    }
}

impl From<i32> for StatusCode {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.0)
    }
}
