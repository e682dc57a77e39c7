//! Custom error types for the common library
//!
//! This module defines the infrastructure error types shared by the
//! services: one for PostgreSQL and one for Redis.

use redis::RedisError;
use sqlx::Error as SqlxError;
use thiserror::Error;

/// Custom error type for database operations
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error occurred during database connection
    #[error("Database connection error: {0}")]
    Connection(#[source] SqlxError),

    /// Configuration error
    #[error("Database configuration error: {0}")]
    Configuration(String),
}

/// Custom error type for Redis operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Could not open a client or obtain a connection
    #[error("Redis connection error: {0}")]
    Connection(#[source] RedisError),

    /// A command or script failed
    #[error("Redis command error: {0}")]
    Command(#[source] RedisError),
}

/// Type alias for Result with DatabaseError
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Type alias for Result with CacheError
pub type CacheResult<T> = Result<T, CacheError>;
