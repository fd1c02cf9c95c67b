//! Error types for Tephra

/// Result type alias for Tephra operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Tephra
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sample older than the partition's last ingested timestamp
    #[error("Out-of-order sample: got {got}, last ingested {last}")]
    OutOfOrderSample { got: i64, last: i64 },
    /// Record schema does not match the dataset schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    /// The shard's write-buffer pool has no free buffers
    #[error("Write buffer pool exhausted")]
    BufferPoolExhausted,
    /// Off-heap block memory budget exceeded
    #[error("Block memory exhausted: requested {requested} bytes, {available} available")]
    BlockMemoryExhausted { requested: usize, available: usize },
    /// Remote store did not acknowledge a chunk write in time
    #[error("Remote write timed out")]
    RemoteWriteTimeout,
    /// Remote store rejected a chunk write
    #[error("Remote write rejected: {0}")]
    RemoteWriteRejected(String),
    /// Remote store read failed
    #[error("Remote read error: {0}")]
    RemoteRead(String),
    /// Malformed or unsupported query plan
    #[error("Bad query: {0}")]
    BadQuery(String),
    /// Query references a column the schema does not define
    #[error("Undefined column: {0}")]
    UndefinedColumn(String),
    /// Dataset has not been set up in the memstore
    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),
    /// Query exceeded its deadline
    #[error("Query timed out")]
    QueryTimeout,
    /// Query produced more samples than the configured limit
    #[error("Query sample limit reached: {limit}")]
    QueryLimitReached { limit: usize },
    /// Query was cancelled before completion
    #[error("Query cancelled")]
    QueryCancelled,
    /// Counter period marker applied to a non-counter column
    #[error("Period marker mismatch: {0}")]
    PeriodMarkerMismatch(String),
    /// Corrupt or truncated encoded chunk data
    #[error("Chunk decode error: {0}")]
    ChunkDecode(String),
    /// Corrupt record container (bad length prefix or checksum)
    #[error("Record container error: {0}")]
    RecordContainer(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for ingest-side errors that drop the offending sample and are
    /// counted rather than propagated.
    pub fn is_ingest_local(&self) -> bool {
        matches!(
            self,
            Error::OutOfOrderSample { .. } | Error::SchemaMismatch(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}
