//! Pluggable document serialization.
//!
//! # Responsibility
//! - Define the only boundary where entities become document text.
//! - Provide the default `serde_json` adapter.
//!
//! # Invariants
//! - Repository code never inspects document text; it is passed through as-is.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Serialization failure reported by a `DocumentCodec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(message) => write!(f, "failed to encode document: {message}"),
            Self::Decode(message) => write!(f, "failed to decode document: {message}"),
        }
    }
}

impl Error for CodecError {}

/// Converts entities to and from stored document text.
pub trait DocumentCodec<E> {
    fn encode(&self, entity: &E) -> Result<String, CodecError>;
    fn decode(&self, document: &str) -> Result<E, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<E> DocumentCodec<E> for JsonCodec
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, entity: &E) -> Result<String, CodecError> {
        serde_json::to_string(entity).map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn decode(&self, document: &str) -> Result<E, CodecError> {
        serde_json::from_str(document).map_err(|err| CodecError::Decode(err.to_string()))
    }
}
