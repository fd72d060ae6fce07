//! Black-box coverage of the correlation map's external/internal split,
//! exercised the way the engine actually drives it: insert on send,
//! remove on the matching response, drain on close.

use kafka_filter_proxy::correlation::{CorrelationMap, EntryKind};
use kafka_protocol::messages::ApiKey;
use rstest::rstest;

#[rstest]
#[case(ApiKey::MetadataKey, 3)]
#[case(ApiKey::FetchKey, 11)]
#[case(ApiKey::CreateTopicsKey, 5)]
fn external_entry_round_trips(#[case] api_key: ApiKey, #[case] api_version: i16) {
    let map = CorrelationMap::new();
    assert!(map.insert_external(1, api_key, api_version));

    let entry = map.remove(1).expect("entry should still be present");
    assert_eq!(entry.api_key, api_key);
    assert_eq!(entry.api_version, api_version);
    assert!(matches!(entry.kind, EntryKind::External));
    assert!(map.is_empty());
}

#[tokio::test]
async fn internal_entry_carries_its_recipient_and_promise() {
    let map = CorrelationMap::new();
    let (tx, rx) = tokio::sync::oneshot::channel();
    map.insert_internal(42, ApiKey::MetadataKey, 9, "filter:default".into(), tx);

    let entry = map.remove(42).unwrap();
    match entry.kind {
        EntryKind::Internal { recipient, promise } => {
            assert_eq!(recipient, "filter:default");
            let _ = promise.send(kafka_filter_proxy::frame::ResponseBody::Opaque(
                bytes::Bytes::new(),
            ));
        }
        EntryKind::External => panic!("expected an internal entry"),
    }
    assert!(rx.await.is_ok());
}

#[test]
fn unrelated_correlation_ids_do_not_collide() {
    let map = CorrelationMap::new();
    map.insert_external(1, ApiKey::MetadataKey, 0);
    map.insert_external(2, ApiKey::FetchKey, 0);
    assert_eq!(map.len(), 2);
    assert!(map.remove(1).is_some());
    assert_eq!(map.len(), 1);
    assert!(map.remove(3).is_none());
}
