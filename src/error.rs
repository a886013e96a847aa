//! Error types and handling for iqflow

/// Result type alias for iqflow operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Comprehensive error types for the iqflow transport substrate
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O related errors (region files, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The configuration is malformed or semantically inconsistent
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// The shared-memory runtime failed to initialize
    #[error("Runtime init failed: {message}")]
    RuntimeInit { message: String },

    /// The shared-memory runtime was initialized twice in one process
    #[error("Runtime already initialized")]
    AlreadyInitialized,

    /// Empty or ill-formed object name passed to create/lookup
    #[error("Invalid object name: '{name}'")]
    InvalidName { name: String },

    /// Primary could not create (nor find pre-existing) a packet pool
    #[error("Pool create failed: {name} ({kind})")]
    PoolCreate { name: String, kind: String },

    /// Primary could not create (nor find pre-existing) a ring
    #[error("Ring create failed: {name}")]
    RingCreate { name: String },

    /// A pre-existing ring does not match the requested spec
    #[error("Ring conflict: {name} expected capacity {expected}, found {actual}")]
    RingConflict {
        name: String,
        expected: u32,
        actual: u32,
    },

    /// A pre-existing pool does not match the requested spec
    #[error("Pool conflict: {name} {field} expected {expected}, found {actual}")]
    PoolConflict {
        name: String,
        field: &'static str,
        expected: u32,
        actual: u32,
    },

    /// Secondary could not find a named shared-memory object
    #[error("Object not found: {name}")]
    NotFound { name: String },

    /// Attempted to append samples beyond a packet's tailroom
    #[error("No tailroom: requested {requested} bytes, {available} available")]
    NoTailroom { requested: usize, available: usize },

    /// A batch enqueue only partially succeeded within the timeout window
    #[error("Backpressure: {enqueued} packets enqueued, {released} released")]
    Backpressure { enqueued: u32, released: u32 },

    /// A blocking receive expired with zero samples delivered
    #[error("Timed out waiting for samples")]
    Timeout,

    /// Ring is full (transient, retryable)
    #[error("Ring full: {name}")]
    RingFull { name: String },

    /// Ring is empty (transient, retryable)
    #[error("Ring empty: {name}")]
    RingEmpty { name: String },

    /// Pool has no free packet buffers (transient, retryable)
    #[error("Pool exhausted: {name}")]
    PoolExhausted { name: String },
}

impl TransportError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create a runtime-init error
    pub fn runtime_init(message: impl Into<String>) -> Self {
        Self::RuntimeInit {
            message: message.into(),
        }
    }

    /// Create an invalid-name error
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    /// Create a pool-create error
    pub fn pool_create(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::PoolCreate {
            name: name.into(),
            kind: kind.into(),
        }
    }

    /// Create a ring-create error
    pub fn ring_create(name: impl Into<String>) -> Self {
        Self::RingCreate { name: name.into() }
    }

    /// Create a not-found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a no-tailroom error
    pub fn no_tailroom(requested: usize, available: usize) -> Self {
        Self::NoTailroom {
            requested,
            available,
        }
    }

    /// Create a ring-full error
    pub fn ring_full(name: impl Into<String>) -> Self {
        Self::RingFull { name: name.into() }
    }

    /// Create a ring-empty error
    pub fn ring_empty(name: impl Into<String>) -> Self {
        Self::RingEmpty { name: name.into() }
    }

    /// Create a pool-exhausted error
    pub fn pool_exhausted(name: impl Into<String>) -> Self {
        Self::PoolExhausted { name: name.into() }
    }

    /// True for transient conditions a caller may retry after a pause
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RingFull { .. } | Self::RingEmpty { .. } | Self::PoolExhausted { .. }
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}
