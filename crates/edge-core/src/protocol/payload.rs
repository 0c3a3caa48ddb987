//! JSON payload decoding for the resources the client reads.
//!
//! Every decoder first checks the envelope (status `205`, JSON content
//! format) and only then parses the body, so a failed query can never be
//! mistaken for an empty result.
//!
//! Missing fields in a service detail record are tolerated and shown as
//! `"Unknown"`; a body that is not a JSON object at all is an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::response::{content_format, status, QueryResponse};
use crate::domain::identity::{PairingInfo, User};
use crate::domain::service::ServiceDescriptor;

/// Errors raised while interpreting a query response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PayloadError {
    /// The device answered with a status other than `205 Content`.
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    /// The payload is not tagged as JSON.
    #[error("unexpected content format {0:?}")]
    UnexpectedContentFormat(Option<u16>),
    /// The payload could not be parsed into the expected shape.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for PayloadError {
    fn from(e: serde_json::Error) -> Self {
        PayloadError::Malformed(e.to_string())
    }
}

fn decode_json<T: DeserializeOwned>(response: &QueryResponse) -> Result<T, PayloadError> {
    if !response.is_success() {
        return Err(PayloadError::UnexpectedStatus(response.status));
    }
    if response.content_format != Some(content_format::JSON) {
        return Err(PayloadError::UnexpectedContentFormat(response.content_format));
    }
    serde_json::from_slice(&response.payload).map_err(|e| {
        debug!(bytes = response.payload.len(), "rejecting malformed JSON payload: {e}");
        PayloadError::from(e)
    })
}

/// Encodes `value` as a `205 Content` JSON response.
///
/// # Errors
///
/// Returns [`PayloadError::Malformed`] if serialization fails.
pub fn encode_json<T: Serialize>(value: &T) -> Result<QueryResponse, PayloadError> {
    Ok(QueryResponse::json(serde_json::to_vec(value)?))
}

/// Decodes the list of service ids (`["ssh", "http"]`).
///
/// # Errors
///
/// Returns [`PayloadError`] for a non-success status, a non-JSON content
/// format, or a body that is not an array of strings.
pub fn decode_service_ids(response: &QueryResponse) -> Result<Vec<String>, PayloadError> {
    decode_json(response)
}

/// Decodes one service detail record.
///
/// # Errors
///
/// Returns [`PayloadError`] when the envelope is wrong or the body is not a
/// JSON object with correctly typed fields.
pub fn decode_service_detail(response: &QueryResponse) -> Result<ServiceDescriptor, PayloadError> {
    decode_json(response)
}

/// Encodes one service detail record.
///
/// # Errors
///
/// Returns [`PayloadError::Malformed`] if serialization fails.
pub fn encode_service_detail(service: &ServiceDescriptor) -> Result<QueryResponse, PayloadError> {
    encode_json(service)
}

/// Decodes the "who am I" answer.
///
/// `404 Not Found` means the device has no user for this client and yields
/// `Ok(None)`.
///
/// # Errors
///
/// Returns [`PayloadError`] for any other non-success status or a malformed
/// body.
pub fn decode_user(response: &QueryResponse) -> Result<Option<User>, PayloadError> {
    if response.status == status::NOT_FOUND {
        return Ok(None);
    }
    decode_json(response).map(Some)
}

/// Decodes the device's pairing info.
///
/// # Errors
///
/// Returns [`PayloadError`] when the envelope is wrong or the body is malformed.
pub fn decode_pairing_info(response: &QueryResponse) -> Result<PairingInfo, PayloadError> {
    decode_json(response)
}
