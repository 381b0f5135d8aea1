// src/core/errors.rs

//! Defines the primary error type for the entire pipeline.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the pipeline.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum PageVeilError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Bloom filter configuration error: {0}")]
    BloomConfig(String),

    #[error("Bad job: {0}")]
    BadJob(String),

    #[error("Bad job handler: {0}")]
    BadJobHandler(String),

    #[error("Job rejected: {0}")]
    JobRejected(String),

    #[error("Unsupported transformation '{0}'")]
    UnsupportedTransformation(String),

    #[error("Transformation failed validation: {0}")]
    TransformValidation(String),

    #[error("Patterns unavailable: {0}")]
    PatternsUnavailable(String),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Operation not permitted while unloaded")]
    Unloaded,

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for PageVeilError {
    fn clone(&self) -> Self {
        match self {
            PageVeilError::Io(e) => PageVeilError::Io(Arc::clone(e)),
            PageVeilError::Storage(s) => PageVeilError::Storage(s.clone()),
            PageVeilError::HttpClientError(s) => PageVeilError::HttpClientError(s.clone()),
            PageVeilError::BloomConfig(s) => PageVeilError::BloomConfig(s.clone()),
            PageVeilError::BadJob(s) => PageVeilError::BadJob(s.clone()),
            PageVeilError::BadJobHandler(s) => PageVeilError::BadJobHandler(s.clone()),
            PageVeilError::JobRejected(s) => PageVeilError::JobRejected(s.clone()),
            PageVeilError::UnsupportedTransformation(s) => {
                PageVeilError::UnsupportedTransformation(s.clone())
            }
            PageVeilError::TransformValidation(s) => PageVeilError::TransformValidation(s.clone()),
            PageVeilError::PatternsUnavailable(s) => PageVeilError::PatternsUnavailable(s.clone()),
            PageVeilError::Corrupted(s) => PageVeilError::Corrupted(s.clone()),
            PageVeilError::InvalidUrl(s) => PageVeilError::InvalidUrl(s.clone()),
            PageVeilError::InvalidConfig(s) => PageVeilError::InvalidConfig(s.clone()),
            PageVeilError::InvalidState(s) => PageVeilError::InvalidState(s.clone()),
            PageVeilError::Unloaded => PageVeilError::Unloaded,
            PageVeilError::Internal(s) => PageVeilError::Internal(s.clone()),
        }
    }
}

impl PartialEq for PageVeilError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PageVeilError::Io(e1), PageVeilError::Io(e2)) => e1.to_string() == e2.to_string(),
            (PageVeilError::Storage(s1), PageVeilError::Storage(s2)) => s1 == s2,
            (PageVeilError::HttpClientError(s1), PageVeilError::HttpClientError(s2)) => s1 == s2,
            (PageVeilError::BloomConfig(s1), PageVeilError::BloomConfig(s2)) => s1 == s2,
            (PageVeilError::BadJob(s1), PageVeilError::BadJob(s2)) => s1 == s2,
            (PageVeilError::BadJobHandler(s1), PageVeilError::BadJobHandler(s2)) => s1 == s2,
            (PageVeilError::JobRejected(s1), PageVeilError::JobRejected(s2)) => s1 == s2,
            (
                PageVeilError::UnsupportedTransformation(s1),
                PageVeilError::UnsupportedTransformation(s2),
            ) => s1 == s2,
            (PageVeilError::TransformValidation(s1), PageVeilError::TransformValidation(s2)) => {
                s1 == s2
            }
            (PageVeilError::PatternsUnavailable(s1), PageVeilError::PatternsUnavailable(s2)) => {
                s1 == s2
            }
            (PageVeilError::Corrupted(s1), PageVeilError::Corrupted(s2)) => s1 == s2,
            (PageVeilError::InvalidUrl(s1), PageVeilError::InvalidUrl(s2)) => s1 == s2,
            (PageVeilError::InvalidConfig(s1), PageVeilError::InvalidConfig(s2)) => s1 == s2,
            (PageVeilError::InvalidState(s1), PageVeilError::InvalidState(s2)) => s1 == s2,
            (PageVeilError::Internal(s1), PageVeilError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for PageVeilError {
    fn from(e: std::io::Error) -> Self {
        PageVeilError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for PageVeilError {
    fn from(e: reqwest::Error) -> Self {
        PageVeilError::HttpClientError(e.to_string())
    }
}

impl From<serde_json::Error> for PageVeilError {
    fn from(e: serde_json::Error) -> Self {
        PageVeilError::Corrupted(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<url::ParseError> for PageVeilError {
    fn from(e: url::ParseError) -> Self {
        PageVeilError::InvalidUrl(e.to_string())
    }
}
