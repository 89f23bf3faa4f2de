#![allow(clippy::unwrap_used)]
// Integration tests for resource access by device id: retries, the
// shared pool and link cache invalidation.

use std::time::Duration;

use ocfly_api::{CborCodec, ContentFormat, JsonCodec, Method, Scheme};
use ocfly_core::{Client, ClientConfig, Context, CoreError, ErrorKind, RetryConfig};
use ocfly_mock::{MockDevice, MockNetwork};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

const SWITCH: &str = "c1a2b3c4-0000-4000-8000-0000000000a1";
const SWITCH_HREF: &str = "/switch/0";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct BinarySwitch {
    value: bool,
}

// ── Helpers ─────────────────────────────────────────────────────────

fn setup(attempts: u32) -> (MockNetwork, MockDevice, Client) {
    let network = MockNetwork::new();
    let device = MockDevice::builder(SWITCH)
        .host("10.0.0.20")
        .resource(SWITCH_HREF, "oic.r.switch.binary", json!({"value": false}))
        .build();
    network.add(device.clone());

    let config = ClientConfig {
        operation_timeout: Duration::from_millis(500),
        retry: RetryConfig::Fixed {
            attempts,
            delay_ms: 5,
        },
        ..ClientConfig::default()
    };
    let client = Client::new(config, network.dialer());
    (network, device, client)
}

fn ctx() -> Context {
    Context::timeout(Duration::from_secs(5))
}

// ── Read / write / delete ───────────────────────────────────────────

#[tokio::test]
async fn test_get_resource_decodes_payload() {
    let (_network, device, client) = setup(1);

    let state: BinarySwitch = client
        .get_resource(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap();
    assert_eq!(state, BinarySwitch { value: false });

    let requests = device.requests();
    let get = requests.iter().find(|r| r.href == SWITCH_HREF).unwrap();
    assert_eq!(get.method, Method::Get);
    assert!(!get.secure);
    assert!(get.queries.is_empty());
}

#[tokio::test]
async fn test_get_resource_passes_interface_query() {
    let (_network, device, client) = setup(1);

    let _: Value = client
        .get_resource(&ctx(), SWITCH, SWITCH_HREF, &JsonCodec, Some("oic.if.baseline"))
        .await
        .unwrap();

    let requests = device.requests();
    let get = requests.iter().find(|r| r.href == SWITCH_HREF).unwrap();
    assert_eq!(get.queries, vec!["if=oic.if.baseline".to_owned()]);
}

#[tokio::test]
async fn test_update_resource_writes_body() {
    let (_network, device, client) = setup(1);

    let () = client
        .update_resource(
            &ctx(),
            SWITCH,
            SWITCH_HREF,
            &CborCodec,
            &BinarySwitch { value: true },
            None,
        )
        .await
        .unwrap();

    assert_eq!(device.resource(SWITCH_HREF).unwrap()["value"], json!(true));
    let writes = device.writes_to(SWITCH_HREF);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].body, json!({"value": true}));
}

#[tokio::test]
async fn test_update_resource_raw_round_trips_bytes() {
    let (_network, _device, client) = setup(1);

    let payload = b"\x01\x02opaque".to_vec();
    let echoed = client
        .update_resource_raw(
            &ctx(),
            SWITCH,
            SWITCH_HREF,
            ContentFormat::APP_OCTET_STREAM,
            &payload,
        )
        .await
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_delete_resource_removes_it() {
    let (_network, device, client) = setup(1);

    let () = client
        .delete_resource(&ctx(), SWITCH, SWITCH_HREF, &CborCodec)
        .await
        .unwrap();
    assert!(device.resource(SWITCH_HREF).is_none());
}

#[tokio::test]
async fn test_unknown_href_is_resource_not_found() {
    let (_network, _device, client) = setup(1);

    let err = client
        .get_resource::<Value, _>(&ctx(), SWITCH, "/nope", &CborCodec, None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::ResourceNotFound { ref href, .. } if href == "/nope"),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_secure_only_resource_needs_identity() {
    let network = MockNetwork::new();
    let device = MockDevice::builder(SWITCH).build();
    network.add(device.clone());
    let config = ClientConfig {
        retry: RetryConfig::Never,
        ..ClientConfig::default()
    };
    let client = Client::new(config, network.dialer());

    // pstat only advertises a coaps endpoint; without an identity there is
    // nothing to dial.
    let err = client
        .get_resource::<Value, _>(&ctx(), SWITCH, ocfly_api::schema::PSTAT_HREF, &CborCodec, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable, "{err:?}");
    assert!(device.endpoint(Scheme::UdpSecure).is_some());
}

// ── Retries and the pool ────────────────────────────────────────────

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let (_network, device, client) = setup(4);
    device.fail_next(2);

    let state: BinarySwitch = client
        .get_resource(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap();
    assert_eq!(state, BinarySwitch { value: false });
    let gets = device
        .requests()
        .into_iter()
        .filter(|r| r.href == SWITCH_HREF)
        .count();
    // Failed attempts reach the device too.
    assert_eq!(gets, 3);
}

#[tokio::test]
async fn test_retry_exhaustion_keeps_last_cause() {
    let (_network, device, client) = setup(2);
    device.fail_next(10);

    let err = client
        .get_resource::<Value, _>(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap_err();
    let CoreError::RetryExhausted { attempts, last, .. } = err else {
        panic!("expected RetryExhausted, got {err:?}");
    };
    assert_eq!(attempts, 2);
    assert_eq!(last.kind(), ErrorKind::Unavailable, "{last:?}");
}

#[tokio::test]
async fn test_connections_are_reused_and_redialed_after_loss() {
    let (network, device, client) = setup(3);

    for _ in 0..3 {
        let _: Value = client
            .get_resource(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
            .await
            .unwrap();
    }
    assert_eq!(network.dial_count(), 1);
    assert_eq!(client.pool().len(), 1);

    device.drop_sessions();
    let _: Value = client
        .get_resource(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap();
    assert_eq!(network.dial_count(), 2);
    assert_eq!(device.open_sessions(), 1);
}

#[tokio::test]
async fn test_unreachable_device_is_forgotten() {
    let (_network, device, client) = setup(2);

    let _: Value = client
        .get_resource(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap();
    assert!(client.link_cache().get(SWITCH).is_some());

    device.set_reachable(false);
    let err = client
        .get_resource::<Value, _>(&ctx(), SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable, "{err:?}");
    assert!(client.link_cache().get(SWITCH).is_none());
}

#[tokio::test]
async fn test_cancelled_context_stops_operation() {
    let (_network, _device, client) = setup(1);
    let ctx = ctx();
    let _: Value = client
        .get_resource(&ctx, SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap();

    ctx.cancel();
    let err = client
        .get_resource::<Value, _>(&ctx, SWITCH, SWITCH_HREF, &CborCodec, None)
        .await
        .unwrap_err();
    assert!(err.is_canceled(), "{err:?}");
}

// ── Device handles ──────────────────────────────────────────────────

#[tokio::test]
async fn test_resource_links_refresh_over_open_connection() {
    let (network, _device, client) = setup(1);
    let (handle, links) = client.get_device(&ctx(), SWITCH).await.unwrap();

    let _: Value = handle
        .get_resource(&ctx(), links.get(SWITCH_HREF).unwrap(), &CborCodec, &[])
        .await
        .unwrap();
    assert_eq!(handle.connection_count(), 1);

    let before = network.multicast_request_count();
    let fresh = handle.get_resource_links(&ctx()).await.unwrap();
    assert!(fresh.get(SWITCH_HREF).is_some());
    assert_eq!(network.multicast_request_count(), before);

    handle.close().await;
    assert_eq!(handle.connection_count(), 0);
}

#[tokio::test]
async fn test_resource_links_without_connection_rediscover() {
    let (network, _device, client) = setup(1);
    let (handle, _) = client.get_device(&ctx(), SWITCH).await.unwrap();
    let before = network.multicast_request_count();

    let fresh = handle.get_resource_links(&ctx()).await.unwrap();
    assert!(fresh.get(SWITCH_HREF).is_some());
    assert!(network.multicast_request_count() > before);
}
