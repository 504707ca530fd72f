//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur while running the grid ladder
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("Grid level not found: index {0}")]
    LevelNotFound(usize),

    #[error("Order not found: client id {0}")]
    OrderNotFound(String),

    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Market data is stale: fetch took {elapsed_ms}ms (limit {limit_ms}ms)")]
    StaleMarketData { elapsed_ms: u64, limit_ms: u64 },

    #[error("State persistence error: {0}")]
    StatePersistence(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),
}

impl GridError {
    /// Transient errors skip the current cycle and are retried on the next one
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridError::Exchange(_) | GridError::StaleMarketData { .. } | GridError::Notification(_)
        )
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        GridError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        GridError::StatePersistence(err.to_string())
    }
}

impl From<config::ConfigError> for GridError {
    fn from(err: config::ConfigError) -> Self {
        GridError::InvalidConfig(err.to_string())
    }
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Notification(err.to_string())
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GridError::Exchange("timeout".into()).is_transient());
        assert!(GridError::StaleMarketData { elapsed_ms: 3500, limit_ms: 3000 }.is_transient());
        assert!(!GridError::CorruptState("bad".into()).is_transient());
        assert!(!GridError::InvalidConfig("bad".into()).is_transient());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(GridError::from(io), GridError::StatePersistence(_)));
    }
}
