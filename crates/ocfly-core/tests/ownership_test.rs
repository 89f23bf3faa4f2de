#![allow(clippy::unwrap_used)]
// Integration tests for Own/Disown against mock devices with real
// certificate chains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocfly_api::schema::{CRED_HREF, DOXM_HREF, PSTAT_HREF};
use ocfly_core::{
    Client, ClientConfig, Context, CoreError, IdentityCertificateSigner, IdentityConfig,
    ManufacturerCertificate, OwnershipPhase, RetryConfig,
};
use ocfly_mock::{MockDevice, MockNetwork, TestPki};
use serde_json::json;
use uuid::Uuid;

const THERMOSTAT: &str = "7d3f0e52-9a41-4c2a-8a55-1f4c0be1d3a9";
const NIL: &str = "00000000-0000-0000-0000-000000000000";

// ── Helpers ─────────────────────────────────────────────────────────

struct Fixture {
    pki: Arc<TestPki>,
    sdk_id: Uuid,
    network: MockNetwork,
    client: Client,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> Fixture {
    init_tracing();
    let pki = Arc::new(TestPki::new().unwrap());
    let sdk_id = Uuid::new_v4();
    let network = MockNetwork::new();
    let config = ClientConfig {
        operation_timeout: Duration::from_millis(500),
        retry: RetryConfig::Fixed {
            attempts: 2,
            delay_ms: 5,
        },
        identity: Some(IdentityConfig {
            tls: Arc::new(pki.client_identity(sdk_id).unwrap()),
            trust_anchors: vec![pki.identity_ca()],
        }),
        ..ClientConfig::default()
    };
    let client = Client::new(config, network.dialer());
    Fixture {
        pki,
        sdk_id,
        network,
        client,
    }
}

fn ctx() -> Context {
    Context::timeout(Duration::from_secs(5))
}

/// Issues the device identity from the test CA, ignoring the CSR contents.
struct TestSigner {
    pki: Arc<TestPki>,
    device_id: String,
}

#[async_trait]
impl IdentityCertificateSigner for TestSigner {
    async fn sign(&self, _ctx: &Context, csr_pem: &str) -> Result<String, CoreError> {
        assert!(csr_pem.contains("CERTIFICATE REQUEST"));
        self.pki
            .device_identity_pem(&self.device_id)
            .map_err(|e| CoreError::internal(e.to_string()))
    }
}

fn manufacturer_otm(fx: &Fixture, device_id: &str) -> ManufacturerCertificate {
    let signer = Arc::new(TestSigner {
        pki: Arc::clone(&fx.pki),
        device_id: device_id.to_owned(),
    });
    ManufacturerCertificate::new(
        Arc::new(fx.pki.client_identity(fx.sdk_id).unwrap()),
        vec![fx.pki.manufacturer_ca()],
        signer,
        vec![fx.pki.identity_ca_pem()],
    )
}

fn unowned_device(fx: &Fixture) -> MockDevice {
    MockDevice::builder(THERMOSTAT)
        .manufacturer_chain(fx.pki.manufacturer_chain(THERMOSTAT).unwrap())
        .build()
}

// ── Own ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_own_provisions_device() {
    let fx = setup();
    let device = unowned_device(&fx);
    fx.network.add(device.clone());
    let otm = manufacturer_otm(&fx, THERMOSTAT);

    let (handle, links) = fx.client.get_device(&ctx(), THERMOSTAT).await.unwrap();
    let mut phases = handle.watch_phase();
    handle.own(&ctx(), &links, &otm).await.unwrap();
    assert_eq!(handle.phase(), OwnershipPhase::Owned);
    assert!(phases.has_changed().unwrap());
    handle.close().await;

    let sdk = fx.sdk_id.to_string();
    let doxm = device.resource(DOXM_HREF).unwrap();
    assert_eq!(doxm["owned"], json!(true));
    assert_eq!(doxm["devowneruuid"], json!(sdk));
    assert_eq!(doxm["rowneruuid"], json!(sdk));
    assert_eq!(doxm["oxmsel"], json!(2));
    assert_eq!(device.resource(PSTAT_HREF).unwrap()["rowneruuid"], json!(sdk));

    // Provisioning ran over the manufacturer-authenticated session.
    let creds = device.writes_to(CRED_HREF);
    assert_eq!(creds.len(), 1);
    assert!(creds[0].secure);
    assert_eq!(creds[0].body["creds"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_own_is_a_no_op_when_already_owned_by_us() {
    let fx = setup();
    let device = MockDevice::builder(THERMOSTAT)
        .owned_by(fx.sdk_id.to_string())
        .build();
    fx.network.add(device.clone());
    let otm = manufacturer_otm(&fx, THERMOSTAT);

    fx.client
        .own_device(&ctx(), THERMOSTAT, &otm)
        .await
        .unwrap();
    assert!(device.writes_to(DOXM_HREF).is_empty());
}

#[tokio::test]
async fn test_own_refuses_foreign_owner() {
    let fx = setup();
    let device = MockDevice::builder(THERMOSTAT)
        .owned_by(Uuid::new_v4().to_string())
        .build();
    fx.network.add(device.clone());
    let otm = manufacturer_otm(&fx, THERMOSTAT);

    let err = fx
        .client
        .own_device(&ctx(), THERMOSTAT, &otm)
        .await
        .unwrap_err();
    assert!(err.is_permission_denied(), "{err:?}");
    assert!(device.writes_to(DOXM_HREF).is_empty());
}

#[tokio::test]
async fn test_failed_transfer_leaves_device_unowned() {
    let fx = setup();
    // No manufacturer chain: the secured transfer session can't be
    // authenticated.
    let device = MockDevice::builder(THERMOSTAT).build();
    fx.network.add(device.clone());
    let otm = manufacturer_otm(&fx, THERMOSTAT);

    let (handle, links) = fx.client.get_device(&ctx(), THERMOSTAT).await.unwrap();
    let err = handle.own(&ctx(), &links, &otm).await.unwrap_err();
    assert!(err.is_internal(), "{err:?}");
    assert_eq!(handle.phase(), OwnershipPhase::Unowned);
    assert_eq!(device.resource(DOXM_HREF).unwrap()["owned"], json!(false));
}

// ── Disown ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_disown_unowned_device_writes_nothing() {
    let fx = setup();
    let device = MockDevice::builder(THERMOSTAT).build();
    fx.network.add(device.clone());

    fx.client.disown_device(&ctx(), THERMOSTAT).await.unwrap();
    assert!(device.writes_to(PSTAT_HREF).is_empty());
    assert_eq!(device.resource(DOXM_HREF).unwrap()["devowneruuid"], json!(NIL));
}

#[tokio::test]
async fn test_disown_refuses_foreign_owner() {
    let fx = setup();
    let device = MockDevice::builder(THERMOSTAT)
        .owned_by(Uuid::new_v4().to_string())
        .build();
    fx.network.add(device.clone());

    let err = fx
        .client
        .disown_device(&ctx(), THERMOSTAT)
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::PermissionDenied { .. }),
        "{err:?}"
    );
    assert!(device.writes_to(PSTAT_HREF).is_empty());
}

#[tokio::test]
async fn test_disown_tolerates_reset_closing_the_session() {
    let fx = setup();
    let device = MockDevice::builder(THERMOSTAT)
        .owned_by(fx.sdk_id.to_string())
        .identity_chain(fx.pki.device_identity_chain(THERMOSTAT).unwrap())
        .build();
    fx.network.add(device.clone());

    fx.client.disown_device(&ctx(), THERMOSTAT).await.unwrap();

    let resets = device.writes_to(PSTAT_HREF);
    assert_eq!(resets.len(), 1);
    assert!(resets[0].secure);
    assert_eq!(resets[0].body["dos"]["s"], json!(0));
    assert_eq!(device.resource(DOXM_HREF).unwrap()["owned"], json!(false));
    assert_eq!(device.open_sessions(), 0);
    assert!(fx.client.link_cache().get(THERMOSTAT).is_none());
}

#[tokio::test]
async fn test_own_then_disown_round_trip() {
    let fx = setup();
    let device = unowned_device(&fx);
    fx.network.add(device.clone());
    let otm = manufacturer_otm(&fx, THERMOSTAT);

    fx.client
        .own_device(&ctx(), THERMOSTAT, &otm)
        .await
        .unwrap();
    assert_eq!(device.resource(DOXM_HREF).unwrap()["owned"], json!(true));

    // The identity installed during onboarding authenticates the device now.
    fx.client.disown_device(&ctx(), THERMOSTAT).await.unwrap();
    let doxm = device.resource(DOXM_HREF).unwrap();
    assert_eq!(doxm["owned"], json!(false));
    assert_eq!(doxm["devowneruuid"], json!(NIL));

    // Ownable again.
    fx.client
        .own_device(&ctx(), THERMOSTAT, &otm)
        .await
        .unwrap();
    assert_eq!(device.resource(DOXM_HREF).unwrap()["owned"], json!(true));
}
