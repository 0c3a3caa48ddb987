//! Integration tests for the device payload layer.
//!
//! These exercise the public API the client uses when listing a device's
//! services: decode the id list, decode each detail record, render each
//! descriptor for display, and parse the display line back.

use edge_core::protocol::{
    decode_service_detail, decode_service_ids, encode_service_detail, paths, status,
    QueryResponse,
};
use edge_core::{PayloadError, ServiceDescriptor};

#[test]
fn test_catalog_entry_survives_payload_and_display_line() {
    let original = ServiceDescriptor::new("cam1", "rtsp", "10.0.0.5", 8554);

    let response = encode_service_detail(&original).expect("encode");
    let decoded = decode_service_detail(&response).expect("decode");
    let reparsed: ServiceDescriptor = decoded.to_string().parse().expect("parse line");

    assert_eq!(reparsed.id, "cam1");
    assert_eq!(reparsed.service_type, "rtsp");
    assert_eq!(reparsed.host, "10.0.0.5");
    assert_eq!(reparsed.port, 8554);
}

#[test]
fn test_service_detail_path_is_nested_under_service_list() {
    assert_eq!(paths::service_detail("ssh"), "/tcp-tunnels/services/ssh");
}

#[test]
fn test_failed_list_query_is_never_an_empty_catalog() {
    let response = QueryResponse::empty(status::BAD_REQUEST);
    assert_eq!(
        decode_service_ids(&response),
        Err(PayloadError::UnexpectedStatus(status::BAD_REQUEST))
    );
}

#[test]
fn test_list_with_non_string_entries_is_malformed() {
    let response = QueryResponse::json(b"[1, 2, 3]".to_vec());
    assert!(matches!(
        decode_service_ids(&response),
        Err(PayloadError::Malformed(_))
    ));
}
