//! Device query protocol: response envelope and JSON payloads.

pub mod payload;
pub mod response;

pub use payload::{
    decode_pairing_info, decode_service_detail, decode_service_ids, decode_user, encode_json,
    encode_service_detail, PayloadError,
};
pub use response::{content_format, paths, status, QueryResponse};
