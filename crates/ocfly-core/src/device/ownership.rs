// ── Ownership transfer ──
//
// Own: select a transfer method, open its secured session, provision the
// device's identity credential and trust anchors, then move it to normal
// operation. Disown: reset the device through its provisioning state.

use std::sync::Arc;

use async_trait::async_trait;
use ocfly_api::schema::{
    CRED_HREF, CSR_HREF, CertificateSigningRequest, Credential, CredentialUpdate, DOXM_HREF, Doxm,
    DoxmUpdate, OperationalState, OwnerTransferMethod, PSTAT_HREF, PstatUpdate, ResourceLinks,
};
use ocfly_api::{
    Addr, CborCodec, Connection, Dialer, Method, PeerVerification, Request, TlsIdentity,
};
use rustls_pki_types::CertificateDer;
use serde::Serialize;
use uuid::Uuid;

use super::{Device, decode_response, encode_request};
use crate::context::Context;
use crate::error::CoreError;
use crate::retry::operation_with_retries;

/// Where a device handle is in the ownership lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OwnershipPhase {
    Unowned,
    Onboarding,
    Owned,
    Disowning,
}

// ── Transfer method seams ────────────────────────────────────────

/// Signs the device's certificate signing request with the owner's
/// identity CA.
#[async_trait]
pub trait IdentityCertificateSigner: Send + Sync {
    /// Returns the PEM certificate chain for `csr_pem`, leaf first.
    async fn sign(&self, ctx: &Context, csr_pem: &str) -> Result<String, CoreError>;
}

/// An ownership transfer method (OTM) the device may offer in `oxms`.
#[async_trait]
pub trait OwnershipTransferMethod: Send + Sync {
    fn method(&self) -> OwnerTransferMethod;

    /// Open the secured session the transfer runs over.
    async fn dial(
        &self,
        dialer: &dyn Dialer,
        addr: &Addr,
    ) -> Result<Arc<dyn Connection>, ocfly_api::Error>;

    fn signer(&self) -> &dyn IdentityCertificateSigner;

    /// PEM CAs the device is told to trust for its owner's peers.
    fn trusted_identity_cas(&self) -> &[String];
}

/// Manufacturer-certificate transfer: the device proves itself with a
/// certificate chaining to a manufacturer CA.
pub struct ManufacturerCertificate {
    tls: Arc<TlsIdentity>,
    manufacturer_cas: Vec<CertificateDer<'static>>,
    signer: Arc<dyn IdentityCertificateSigner>,
    identity_cas: Vec<String>,
}

impl ManufacturerCertificate {
    pub fn new(
        tls: Arc<TlsIdentity>,
        manufacturer_cas: Vec<CertificateDer<'static>>,
        signer: Arc<dyn IdentityCertificateSigner>,
        identity_cas: Vec<String>,
    ) -> Self {
        Self {
            tls,
            manufacturer_cas,
            signer,
            identity_cas,
        }
    }
}

#[async_trait]
impl OwnershipTransferMethod for ManufacturerCertificate {
    fn method(&self) -> OwnerTransferMethod {
        OwnerTransferMethod::MANUFACTURER_CERTIFICATE
    }

    async fn dial(
        &self,
        dialer: &dyn Dialer,
        addr: &Addr,
    ) -> Result<Arc<dyn Connection>, ocfly_api::Error> {
        let verification = PeerVerification::Manufacturer {
            trust_anchors: self.manufacturer_cas.clone(),
        };
        dialer
            .dial_secure(addr, Arc::clone(&self.tls), verification)
            .await
    }

    fn signer(&self) -> &dyn IdentityCertificateSigner {
        self.signer.as_ref()
    }

    fn trusted_identity_cas(&self) -> &[String] {
        &self.identity_cas
    }
}

// ── Own / Disown ─────────────────────────────────────────────────

impl Device {
    /// Take ownership of the device with `otm`.
    ///
    /// Already owned by this SDK is a no-op; owned by anyone else is
    /// `PermissionDenied`. Failures after onboarding started are reported
    /// as internal errors and leave the handle `Unowned`.
    pub async fn own(
        &self,
        ctx: &Context,
        links: &ResourceLinks,
        otm: &dyn OwnershipTransferMethod,
    ) -> Result<(), CoreError> {
        let sdk_id = self.settings.identity()?.sdk_id()?;
        let doxm_link = self.require_link(links, DOXM_HREF)?.filter_unsecure_endpoints();
        let doxm: Doxm = self.get_resource(ctx, &doxm_link, &CborCodec, &[]).await?;
        let owner = parse_owner(&doxm.owner_id);

        if doxm.owned {
            if owner == Some(sdk_id) {
                tracing::debug!(device_id = %self.id, "device already owned by this sdk");
                self.set_phase(OwnershipPhase::Owned);
                return Ok(());
            }
            return Err(CoreError::permission_denied(format!(
                "device {} is owned by {}",
                self.id, doxm.owner_id
            )));
        }
        if let Some(owner) = owner.filter(|o| !o.is_nil() && *o != sdk_id) {
            return Err(CoreError::permission_denied(format!(
                "device {} is claimed by {owner}",
                self.id
            )));
        }
        if !doxm.supports(otm.method()) {
            return Err(CoreError::internal(format!(
                "cannot own device {}: ownership transfer method {} not offered",
                self.id,
                otm.method()
            )));
        }

        self.set_phase(OwnershipPhase::Onboarding);
        match self.transfer_ownership(ctx, links, otm, &sdk_id.to_string()).await {
            Ok(()) => {
                self.set_phase(OwnershipPhase::Owned);
                tracing::info!(device_id = %self.id, owner = %sdk_id, "device owned");
                Ok(())
            }
            Err(e) => {
                self.set_phase(OwnershipPhase::Unowned);
                Err(CoreError::internal_from(
                    format!("cannot own device {}", self.id),
                    e,
                ))
            }
        }
    }

    /// Reset the device so it can be owned again.
    ///
    /// A device owned by nobody succeeds without writing anything; owned by
    /// someone else is `PermissionDenied`. The device may drop the session
    /// while resetting; that is logged and counted as success.
    pub async fn disown(&self, ctx: &Context, links: &ResourceLinks) -> Result<(), CoreError> {
        let sdk_id = self.settings.identity()?.sdk_id()?;
        let doxm_link = self.require_link(links, DOXM_HREF)?;
        let doxm: Doxm = self.get_resource(ctx, doxm_link, &CborCodec, &[]).await?;

        match parse_owner(&doxm.owner_id) {
            Some(owner) if owner == sdk_id => {}
            Some(owner) if owner.is_nil() => {
                tracing::debug!(device_id = %self.id, "device has no owner");
                self.set_phase(OwnershipPhase::Unowned);
                return Ok(());
            }
            _ => {
                return Err(CoreError::permission_denied(format!(
                    "cannot disown device {}: owned by {:?}, not by {sdk_id}",
                    self.id, doxm.owner_id
                )));
            }
        }

        let pstat_link = self.require_link(links, PSTAT_HREF)?.filter_secure_endpoints();
        if pstat_link.endpoints.is_empty() {
            return Err(CoreError::internal(format!(
                "cannot disown device {}: no secured endpoint for {PSTAT_HREF}",
                self.id
            )));
        }

        self.set_phase(OwnershipPhase::Disowning);
        let request = encode_request(
            Method::Post,
            PSTAT_HREF,
            &CborCodec,
            &PstatUpdate::state(OperationalState::Reset),
        )?;
        match self.exchange_once(ctx, "disown", &pstat_link, request).await {
            Ok(_) => {}
            Err(e) if ctx.err().is_none() && e.is_connection_closed() => {
                // The device tears the session down as part of the reset.
                let err = CoreError::internal_from(format!("cannot disown device {}", self.id), e);
                (self.settings.error_sink)(&err);
            }
            Err(e) => {
                self.set_phase(OwnershipPhase::Owned);
                return Err(CoreError::internal_from(
                    format!("cannot disown device {}", self.id),
                    e,
                ));
            }
        }

        self.connections.close_all().await;
        self.set_phase(OwnershipPhase::Unowned);
        tracing::info!(device_id = %self.id, "device disowned");
        Ok(())
    }

    async fn transfer_ownership(
        &self,
        ctx: &Context,
        links: &ResourceLinks,
        otm: &dyn OwnershipTransferMethod,
        sdk_id: &str,
    ) -> Result<(), CoreError> {
        let doxm_link = self.require_link(links, DOXM_HREF)?;
        self.update_resource::<_, (), _>(
            ctx,
            &doxm_link.filter_unsecure_endpoints(),
            &CborCodec,
            &DoxmUpdate::select(otm.method()),
            &[],
        )
        .await?;

        let addr = doxm_link
            .filter_secure_endpoints()
            .preferred_addrs()
            .into_iter()
            .next()
            .ok_or_else(|| {
                CoreError::resource(
                    "own",
                    &self.id,
                    DOXM_HREF,
                    ocfly_api::Error::NoEndpoint {
                        href: DOXM_HREF.to_owned(),
                    },
                )
            })?;
        let dialer = self.settings.dialer.as_ref();
        let id = self.id.as_str();
        let addr = &addr;
        let conn = operation_with_retries(
            ctx,
            &self.settings.retry,
            self.settings.operation_timeout,
            |_attempt| async move {
                otm.dial(dialer, addr)
                    .await
                    .map_err(|e| CoreError::resource("own", id, DOXM_HREF, e))
            },
        )
        .await?;
        tracing::debug!(device_id = %self.id, %addr, method = %otm.method(), "ownership session open");

        let result = self.provision(ctx, &conn, otm, sdk_id).await;
        conn.close().await;
        result
    }

    async fn provision(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        otm: &dyn OwnershipTransferMethod,
        sdk_id: &str,
    ) -> Result<(), CoreError> {
        self.post_on(ctx, conn, DOXM_HREF, &DoxmUpdate::owner(sdk_id))
            .await?;

        let request = Request::get(CSR_HREF).with_accept(ocfly_api::ContentFormat::APP_OCF_CBOR);
        let response = self.exchange_on(ctx, conn, "own", request).await?;
        let csr: CertificateSigningRequest = decode_response(&CborCodec, &response)
            .map_err(|e| CoreError::resource("own", &self.id, CSR_HREF, e))?;
        let chain = otm.signer().sign(ctx, &csr.csr).await?;

        let mut credentials = vec![Credential::identity_certificate(&self.id, chain)];
        credentials.extend(
            otm.trusted_identity_cas()
                .iter()
                .map(|ca| Credential::trust_anchor(sdk_id, ca.clone())),
        );
        let update = CredentialUpdate {
            credentials,
            resource_owner_id: Some(sdk_id.to_owned()),
        };
        self.post_on(ctx, conn, CRED_HREF, &update).await?;

        self.post_on(ctx, conn, DOXM_HREF, &DoxmUpdate::resource_owner(sdk_id))
            .await?;
        self.post_on(ctx, conn, PSTAT_HREF, &PstatUpdate::resource_owner(sdk_id))
            .await?;
        self.post_on(ctx, conn, DOXM_HREF, &DoxmUpdate::owned(true))
            .await?;
        self.post_on(
            ctx,
            conn,
            PSTAT_HREF,
            &PstatUpdate::state(OperationalState::Rfnop),
        )
        .await
    }

    async fn post_on<B: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        href: &str,
        body: &B,
    ) -> Result<(), CoreError> {
        let request = encode_request(Method::Post, href, &CborCodec, body)?;
        self.exchange_on(ctx, conn, "own", request).await?;
        Ok(())
    }
}

/// Owner UUID from `devowneruuid`; empty or malformed is no owner at all.
fn parse_owner(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}
