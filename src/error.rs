//! Error types for the Veertu driver.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving VeertuManage.
#[derive(Error, Debug)]
pub enum Error {
    // Control tool errors
    /// VeertuManage, or something it needs to run, could not be found.
    #[error("VeertuManage could not be found; install Veertu or set manage_path in ~/.veertu_config")]
    ToolNotFound,

    /// VeertuManage ran but reported failure.
    #[error("VeertuManage failed: {command}\nstdout: {stdout}\nstderr: {stderr}")]
    ToolExecution {
        /// The arguments that were passed to the tool.
        command: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// VeertuManage could not be started at all.
    #[error("failed to launch VeertuManage: {0}")]
    ToolLaunch(String),

    /// The installed tool version has no matching driver.
    #[error("unsupported Veertu version {detected}; supported versions: {supported}")]
    UnsupportedVersion {
        /// Version string reported by the tool.
        detected: String,
        /// Comma separated list of supported version prefixes.
        supported: String,
    },

    /// The tool version could not be determined.
    #[error("could not detect Veertu version: {0}")]
    VersionDetection(String),

    /// The operation has no meaning for this driver.
    #[error("operation not supported by Veertu: {action}")]
    Unsupported {
        /// Name of the unsupported action.
        action: String,
    },

    // VM errors
    /// A VM identifier does not correspond to a live VM.
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// The driver is not bound to any VM yet.
    #[error("no vm has been created for this machine")]
    NotCreated,

    /// The VM is in the wrong state for the requested action.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// The machine was created by another user.
    #[error("machine was created by uid {original_uid}, but current uid is {uid}")]
    UserMismatch {
        /// Uid recorded for the machine.
        original_uid: String,
        /// Uid of this process.
        uid: String,
    },

    // Output errors
    /// Tool output did not have the expected structure.
    #[error("failed to parse VeertuManage output: {0}")]
    Parse(String),

    /// The dry-run import did not report a suggested VM name.
    #[error("import dry-run did not report a suggested VM name:\n{output}")]
    NoSuggestedName {
        /// Full dry-run output.
        output: String,
    },

    // Configuration errors
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a tool execution error from a command line and captured output.
    pub fn tool_execution(
        args: &[String],
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::ToolExecution {
            command: format!("{:?}", args),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a parse error with a message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(action: impl Into<String>) -> Self {
        Self::Unsupported {
            action: action.into(),
        }
    }

    /// Whether this error means the VM identifier is stale.
    pub fn is_vm_not_found(&self) -> bool {
        matches!(self, Error::VmNotFound(_))
    }

    /// Whether this error is worth retrying.
    ///
    /// Only a tool that ran and failed can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ToolExecution { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
