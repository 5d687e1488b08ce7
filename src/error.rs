//! Error types for the storage array driver
//!
//! One closed taxonomy for every layer: local validation, array-reported
//! object conflicts, response integrity, transport failures and timeouts.
//! Array error codes are translated into variants in exactly one place,
//! [`ArrayErrorCode::classify`], at the transport boundary.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Array Object Errors
    // =========================================================================
    #[error("{kind} not found: {name}")]
    NotFound { kind: ObjectKind, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: ObjectKind, name: String },

    #[error("{kind} {name} is in use: {reason}")]
    InUse {
        kind: ObjectKind,
        name: String,
        reason: String,
    },

    #[error("Invalid state transition for PiT mapping {mapping}: {event} not allowed in state {state}")]
    InvalidStateTransition {
        mapping: String,
        state: String,
        event: String,
    },

    #[error("Array API error during {operation}{}: {message}", code_suffix(.code))]
    BackendApi {
        operation: String,
        code: Option<ArrayErrorCode>,
        message: String,
    },

    // =========================================================================
    // Response Errors
    // =========================================================================
    #[error("Malformed response from {command}: {reason}")]
    MalformedResponse { command: String, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Command {command} failed with exit code {exit_code}: {stderr}")]
    CommandExecution {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    // =========================================================================
    // Timeouts
    // =========================================================================
    #[error("Timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    #[error("PiT mapping {mapping} did not reach {wanted} within {elapsed:?}")]
    SnapshotTimeout {
        mapping: String,
        wanted: String,
        elapsed: Duration,
    },

    // =========================================================================
    // IO / Serialization Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Kind of array object an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Volume,
    Snapshot,
    Host,
    HostMapping,
    PitMapping,
    VolumeCopy,
    Pool,
    Object,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Volume => write!(f, "Volume"),
            ObjectKind::Snapshot => write!(f, "Snapshot"),
            ObjectKind::Host => write!(f, "Host"),
            ObjectKind::HostMapping => write!(f, "Host mapping"),
            ObjectKind::PitMapping => write!(f, "PiT mapping"),
            ObjectKind::VolumeCopy => write!(f, "Volume copy"),
            ObjectKind::Pool => write!(f, "Pool"),
            ObjectKind::Object => write!(f, "Object"),
        }
    }
}

// =============================================================================
// Array Error Codes
// =============================================================================

/// Error codes the array prints on stderr (`CMMVCnnnnE`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayErrorCode {
    /// CMMVC5701E: no object ID was specified
    NoObjectId,
    /// CMMVC5707E: required parameters are missing
    MissingParameters,
    /// CMMVC5753E: the specified object does not exist
    ObjectMissing,
    /// CMMVC5754E: the specified object does not exist or the name is wrong
    ObjectUnknown,
    /// CMMVC5804E: the object was not specified
    ObjectNotSpecified,
    /// CMMVC5840E: the virtual disk is mapped or part of a PiT mapping
    VolumeInUse,
    /// CMMVC5871E: the host still has mappings
    HostHasMappings,
    /// CMMVC5879E: the (host, SCSI id) pair is already mapped
    LunTaken,
    /// CMMVC5903E: the mapping is in the wrong state for the request
    BadState,
    /// CMMVC5924E: source and target capacities differ
    SizeMismatch,
    /// CMMVC6035E: an object of that name already exists
    NameInUse,
    /// CMMVC6071E: the virtual disk is already mapped to another host
    AlreadyMapped,
    /// CMMVC6303E: source and target are the same virtual disk
    SameSourceTarget,
    /// CMMVC6353E: the copy does not exist
    CopyMissing,
    /// CMMVC6430E: the volume is already in the target pool
    SamePool,
    /// CMMVC6446E: extent sizes of source and target pool differ
    ExtentMismatch,
    /// CMMVC6527E: the name contains invalid characters
    InvalidName,
    /// CMMVC6581E: the initiator already belongs to another host
    PortAssigned,
    /// CMMVC7050E: compression is not supported
    CompressionUnsupported,
}

impl ArrayErrorCode {
    /// Parse a code from its textual form
    pub fn parse(code: &str) -> Option<Self> {
        let code = match code {
            "CMMVC5701E" => ArrayErrorCode::NoObjectId,
            "CMMVC5707E" => ArrayErrorCode::MissingParameters,
            "CMMVC5753E" => ArrayErrorCode::ObjectMissing,
            "CMMVC5754E" => ArrayErrorCode::ObjectUnknown,
            "CMMVC5804E" => ArrayErrorCode::ObjectNotSpecified,
            "CMMVC5840E" => ArrayErrorCode::VolumeInUse,
            "CMMVC5871E" => ArrayErrorCode::HostHasMappings,
            "CMMVC5879E" => ArrayErrorCode::LunTaken,
            "CMMVC5903E" => ArrayErrorCode::BadState,
            "CMMVC5924E" => ArrayErrorCode::SizeMismatch,
            "CMMVC6035E" => ArrayErrorCode::NameInUse,
            "CMMVC6071E" => ArrayErrorCode::AlreadyMapped,
            "CMMVC6303E" => ArrayErrorCode::SameSourceTarget,
            "CMMVC6353E" => ArrayErrorCode::CopyMissing,
            "CMMVC6430E" => ArrayErrorCode::SamePool,
            "CMMVC6446E" => ArrayErrorCode::ExtentMismatch,
            "CMMVC6527E" => ArrayErrorCode::InvalidName,
            "CMMVC6581E" => ArrayErrorCode::PortAssigned,
            "CMMVC7050E" => ArrayErrorCode::CompressionUnsupported,
            _ => return None,
        };
        Some(code)
    }

    /// Textual form of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ArrayErrorCode::NoObjectId => "CMMVC5701E",
            ArrayErrorCode::MissingParameters => "CMMVC5707E",
            ArrayErrorCode::ObjectMissing => "CMMVC5753E",
            ArrayErrorCode::ObjectUnknown => "CMMVC5754E",
            ArrayErrorCode::ObjectNotSpecified => "CMMVC5804E",
            ArrayErrorCode::VolumeInUse => "CMMVC5840E",
            ArrayErrorCode::HostHasMappings => "CMMVC5871E",
            ArrayErrorCode::LunTaken => "CMMVC5879E",
            ArrayErrorCode::BadState => "CMMVC5903E",
            ArrayErrorCode::SizeMismatch => "CMMVC5924E",
            ArrayErrorCode::NameInUse => "CMMVC6035E",
            ArrayErrorCode::AlreadyMapped => "CMMVC6071E",
            ArrayErrorCode::SameSourceTarget => "CMMVC6303E",
            ArrayErrorCode::CopyMissing => "CMMVC6353E",
            ArrayErrorCode::SamePool => "CMMVC6430E",
            ArrayErrorCode::ExtentMismatch => "CMMVC6446E",
            ArrayErrorCode::InvalidName => "CMMVC6527E",
            ArrayErrorCode::PortAssigned => "CMMVC6581E",
            ArrayErrorCode::CompressionUnsupported => "CMMVC7050E",
        }
    }

    /// Find the first array error code mentioned in stderr text
    pub fn find_in(stderr: &str) -> Option<Self> {
        stderr
            .split(|c: char| !c.is_ascii_alphanumeric())
            .find_map(Self::parse)
    }

    /// Map an array-reported failure onto the driver taxonomy.
    ///
    /// `kind` and `name` describe the object the command targeted so that
    /// the resulting error stays actionable without log correlation.
    pub fn classify(
        self,
        operation: &str,
        kind: ObjectKind,
        name: &str,
        message: &str,
    ) -> Error {
        match self {
            ArrayErrorCode::ObjectMissing
            | ArrayErrorCode::ObjectUnknown
            | ArrayErrorCode::CopyMissing => Error::NotFound {
                kind,
                name: name.to_string(),
            },
            ArrayErrorCode::NameInUse => Error::AlreadyExists {
                kind,
                name: name.to_string(),
            },
            // The requested SCSI id is the object in conflict, not the target
            ArrayErrorCode::LunTaken => Error::InUse {
                kind: ObjectKind::HostMapping,
                name: name.to_string(),
                reason: message.trim().to_string(),
            },
            ArrayErrorCode::VolumeInUse
            | ArrayErrorCode::HostHasMappings
            | ArrayErrorCode::AlreadyMapped
            | ArrayErrorCode::PortAssigned => Error::InUse {
                kind,
                name: name.to_string(),
                reason: message.trim().to_string(),
            },
            ArrayErrorCode::BadState => Error::InvalidStateTransition {
                mapping: name.to_string(),
                state: "unknown".to_string(),
                event: operation.to_string(),
            },
            ArrayErrorCode::InvalidName
            | ArrayErrorCode::SizeMismatch
            | ArrayErrorCode::SameSourceTarget
            | ArrayErrorCode::MissingParameters
            | ArrayErrorCode::NoObjectId
            | ArrayErrorCode::ObjectNotSpecified => {
                Error::InvalidInput(format!("{}: {}", operation, message.trim()))
            }
            ArrayErrorCode::SamePool
            | ArrayErrorCode::ExtentMismatch
            | ArrayErrorCode::CompressionUnsupported => Error::BackendApi {
                operation: operation.to_string(),
                code: Some(self),
                message: message.trim().to_string(),
            },
        }
    }
}

impl std::fmt::Display for ArrayErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Error Classification
// =============================================================================

/// Action a caller should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific duration
    RetryAfter(Duration),
    /// Surface the error, do not retry
    Abort,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // The array serialises conflicting transitions; try again shortly
            Error::InvalidStateTransition { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(5))
            }

            // Transport hiccups
            Error::CommandExecution { .. } | Error::Io(_) => ErrorAction::RetryWithBackoff,

            // Timeouts already consumed their budget
            Error::Timeout { .. } | Error::SnapshotTimeout { .. } => ErrorAction::Abort,

            // Validation and terminal object conflicts
            Error::InvalidInput(_)
            | Error::Configuration(_)
            | Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::InUse { .. }
            | Error::BackendApi { .. }
            | Error::MalformedResponse { .. }
            | Error::YamlParse(_)
            | Error::Json(_) => ErrorAction::Abort,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::Abort)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::CommandExecution { .. } | Error::Io(_))
    }

    /// Check if this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub(crate) fn backend(operation: &str, message: impl Into<String>) -> Self {
        Error::BackendApi {
            operation: operation.to_string(),
            code: None,
            message: message.into(),
        }
    }
}

fn code_suffix(code: &Option<ArrayErrorCode>) -> String {
    match code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;
