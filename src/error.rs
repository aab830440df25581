//! Error types for relay gateway operations.

use thiserror::Error;

/// Main error type for relay operations.
///
/// Every variant carries enough context to be rendered as a structured error
/// object (`kind` + human-readable cause) by the request router. `Clone` is
/// required because single-flight process starts share one outcome between
/// all waiting callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A catalog record or config section failed validation
    #[error("invalid definition for '{0}': {1}")]
    Validation(String, String),

    /// A record with this id already exists
    #[error("'{0}' already exists")]
    Conflict(String),

    /// Registry entry is still referenced by one or more virtual servers
    #[error("entry '{0}' is still referenced by virtual server(s): {1}")]
    InUse(String, String),

    /// Presented API key was missing, unknown or revoked
    #[error("authentication failed for virtual server '{0}': {1}")]
    Auth(String, String),

    /// Requested tool or prompt is not exposed by the virtual server
    #[error("capability '{0}' not found")]
    CapabilityNotFound(String),

    /// Provider could not be contacted
    #[error("provider '{0}' unreachable: {1}")]
    Unreachable(String, String),

    /// Provider answered with something that is not the expected protocol
    #[error("protocol mismatch for provider '{0}': {1}")]
    ProtocolMismatch(String, String),

    /// Local provider process could not be started
    #[error("failed to spawn process for '{0}': {1}")]
    ProcessSpawn(String, String),

    /// The port pool has no free port left
    #[error("no free port available for '{0}'")]
    PortExhausted(String),

    /// Spawned process did not pass its readiness probe in time
    #[error("process for '{0}' not ready after {1}ms")]
    ReadinessTimeout(String, u64),

    /// Call exceeded its deadline
    #[error("call to '{0}' timed out after {1}ms")]
    ToolTimeout(String, u64),

    /// Provider reported a failure while handling the call
    #[error("upstream error from '{0}': {1}")]
    Upstream(String, String),

    /// Malformed inbound message
    #[error("malformed request: {0}")]
    Protocol(String),

    /// Inbound message named a method the router does not serve
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Unknown catalog record
    #[error("'{0}' not found")]
    NotFound(String),

    /// Catalog backend I/O or encoding failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl RelayError {
    /// Stable kind string exposed to clients in structured error objects.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(..) => "ValidationError",
            RelayError::Conflict(_) => "ConflictError",
            RelayError::InUse(..) => "InUseError",
            RelayError::Auth(..) => "AuthError",
            RelayError::CapabilityNotFound(_) => "CapabilityNotFound",
            RelayError::Unreachable(..) => "Unreachable",
            RelayError::ProtocolMismatch(..) => "ProtocolMismatch",
            RelayError::ProcessSpawn(..) => "ProcessSpawnError",
            RelayError::PortExhausted(_) => "PortExhausted",
            RelayError::ReadinessTimeout(..) => "ReadinessTimeout",
            RelayError::ToolTimeout(..) => "ToolTimeout",
            RelayError::Upstream(..) => "UpstreamError",
            RelayError::Protocol(_) | RelayError::MethodNotFound(_) => "ProtocolError",
            RelayError::NotFound(_) => "NotFound",
            RelayError::Storage(_) => "StorageError",
        }
    }

    /// JSON-RPC error code for this failure.
    ///
    /// Standard codes are used where JSON-RPC defines one; relay-specific
    /// failures live in the implementation-defined `-32000..-32099` range.
    pub fn rpc_code(&self) -> i64 {
        match self {
            RelayError::Protocol(_) => -32600,
            RelayError::MethodNotFound(_) => -32601,
            RelayError::Validation(..) => -32602,
            RelayError::Storage(_) => -32603,
            RelayError::Auth(..) => -32001,
            RelayError::CapabilityNotFound(_) => -32002,
            RelayError::ToolTimeout(..) => -32003,
            RelayError::Upstream(..) => -32004,
            RelayError::Unreachable(..) => -32005,
            RelayError::ProtocolMismatch(..) => -32006,
            RelayError::ProcessSpawn(..) => -32007,
            RelayError::PortExhausted(_) => -32008,
            RelayError::ReadinessTimeout(..) => -32009,
            RelayError::InUse(..) => -32010,
            RelayError::NotFound(_) => -32011,
            RelayError::Conflict(_) => -32012,
        }
    }

    /// True for failures raised while talking to (or starting) a provider.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Unreachable(..)
                | RelayError::ProtocolMismatch(..)
                | RelayError::ProcessSpawn(..)
                | RelayError::PortExhausted(_)
                | RelayError::ReadinessTimeout(..)
                | RelayError::ToolTimeout(..)
                | RelayError::Upstream(..)
        )
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
