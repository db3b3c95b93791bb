use std::result::Result as StdResult;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TestInfraError {
    #[error("container: {0}")]
    Container(#[from] testcontainers::TestcontainersError),
    /// The server never accepted a connection within the configured attempts.
    #[error("mysql not reachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error("bootstrap statement failed: {0}")]
    Bootstrap(#[source] sqlx::Error),
}

pub type Result<T> = StdResult<T, TestInfraError>;
