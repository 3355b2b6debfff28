//! Secure result channel provisioning.
//!
//! Each scan gets its own root CA, a server certificate for the result
//! receiver and a client certificate for the uploaders, stored as secrets.
//! Every secret is created once and never updated in place. The receiver runs
//! as a deployment plus service named `<scan>-rs` mounting the scan's storage
//! claim.

use chrono::{Datelike, Days, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use complyd_model::{
    Container, Deployment, DeploymentSpec, Object, ObjectKey, ObjectMeta, PodSpec, Scan, Secret,
    Service, ServiceSpec, labels,
};

use crate::config::{ResultServerSettings, StorageDefaults, WorkloadImages};
use crate::error::{CoreError, Result};
use crate::naming;
use crate::store::{self, ObjectStore};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CA_KEY_KEY: &str = "ca.key";

const RESULT_SERVER_CONTAINER: &str = "result-server";
const RESULT_SERVER_PATH: &str = "/reports";

/// PEM encoded certificate and private key.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for IssuedPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedPair")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Server,
    Client,
}

/// Certificate issuance port.
pub trait TrustIssuer: Send + Sync {
    fn issue_root(&self, common_name: &str, validity_days: u32) -> Result<IssuedPair>;

    fn issue_leaf(
        &self,
        ca: &IssuedPair,
        common_name: &str,
        subject_alt_names: &[String],
        usage: CertUsage,
        validity_days: u32,
    ) -> Result<IssuedPair>;
}

/// [`TrustIssuer`] backed by `rcgen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenIssuer;

fn trust_err(err: impl std::fmt::Display) -> CoreError {
    CoreError::Trust(err.to_string())
}

fn validity(params: &mut CertificateParams, validity_days: u32) {
    let today = Utc::now().date_naive();
    let start = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    let end = today
        .checked_add_days(Days::new(u64::from(validity_days.max(1)) + 1))
        .unwrap_or(today);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

fn named(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

impl TrustIssuer for RcgenIssuer {
    fn issue_root(&self, common_name: &str, validity_days: u32) -> Result<IssuedPair> {
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.distinguished_name = named(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        validity(&mut params, validity_days);

        let cert = Certificate::from_params(params).map_err(trust_err)?;
        Ok(IssuedPair {
            cert_pem: cert.serialize_pem().map_err(trust_err)?,
            key_pem: cert.serialize_private_key_pem(),
        })
    }

    fn issue_leaf(
        &self,
        ca: &IssuedPair,
        common_name: &str,
        subject_alt_names: &[String],
        usage: CertUsage,
        validity_days: u32,
    ) -> Result<IssuedPair> {
        let ca_key = KeyPair::from_pem(&ca.key_pem).map_err(trust_err)?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca.cert_pem, ca_key).map_err(trust_err)?;
        let ca_cert = Certificate::from_params(ca_params).map_err(trust_err)?;

        let mut params = CertificateParams::new(subject_alt_names.to_vec());
        params.distinguished_name = named(common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![match usage {
            CertUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        validity(&mut params, validity_days);

        let cert = Certificate::from_params(params).map_err(trust_err)?;
        Ok(IssuedPair {
            cert_pem: cert.serialize_pem_with_signer(&ca_cert).map_err(trust_err)?,
            key_pem: cert.serialize_private_key_pem(),
        })
    }
}

/// Provisions and tears down the trust material and receiving endpoint of a scan.
#[derive(Debug, Clone)]
pub struct ResultChannel<I> {
    issuer: I,
    settings: ResultServerSettings,
    image: String,
}

impl<I: TrustIssuer> ResultChannel<I> {
    pub fn new(issuer: I, settings: ResultServerSettings, images: &WorkloadImages) -> Self {
        Self {
            issuer,
            settings,
            image: images.result_server.clone(),
        }
    }

    pub fn settings(&self) -> &ResultServerSettings {
        &self.settings
    }

    fn secret(scan: &Scan, name: String) -> Secret {
        let mut metadata = ObjectMeta::named(scan.namespace(), name).with_labels(scan.selector_labels());
        metadata.set_controller_owner(scan.as_owner());
        Secret {
            metadata,
            data: Default::default(),
        }
    }

    async fn root_ca<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<IssuedPair> {
        let key = ObjectKey::new(scan.namespace(), naming::root_ca_secret_name(scan.name()));
        let secret: Secret = store.get(&key).await?;
        match (secret.data.get(TLS_CERT_KEY), secret.data.get(TLS_KEY_KEY)) {
            (Some(cert), Some(key)) => Ok(IssuedPair {
                cert_pem: cert.clone(),
                key_pem: key.clone(),
            }),
            _ => Err(CoreError::Trust(format!(
                "secret {} is missing its key pair",
                secret.metadata.name
            ))),
        }
    }

    /// Creates the root CA secret unless it already exists.
    pub async fn ensure_root_ca<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        let name = naming::root_ca_secret_name(scan.name());
        if store::get_opt::<_, Secret>(store, &ObjectKey::new(scan.namespace(), name.clone()))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let ca = self
            .issuer
            .issue_root(&format!("{}-ca", scan.name()), self.settings.cert_validity_days)?;
        let mut secret = Self::secret(scan, name);
        secret.data.insert(TLS_CERT_KEY.into(), ca.cert_pem.clone());
        secret.data.insert(TLS_KEY_KEY.into(), ca.key_pem.clone());
        secret.data.insert(CA_CERT_KEY.into(), ca.cert_pem);
        secret.data.insert(CA_KEY_KEY.into(), ca.key_pem);
        store::create_if_absent(store, &secret).await?;
        tracing::debug!(target: "scan::channel", secret = %secret.metadata.name, "created root CA");
        Ok(())
    }

    async fn ensure_leaf<S: ObjectStore>(
        &self,
        store: &S,
        scan: &Scan,
        name: String,
        common_name: String,
        usage: CertUsage,
    ) -> Result<()> {
        if store::get_opt::<_, Secret>(store, &ObjectKey::new(scan.namespace(), name.clone()))
            .await?
            .is_some()
        {
            return Ok(());
        }

        let ca = self.root_ca(store, scan).await?;
        let sans = match usage {
            CertUsage::Server => vec![
                common_name.clone(),
                format!("{common_name}.{}.svc", scan.namespace()),
            ],
            CertUsage::Client => vec![common_name.clone()],
        };
        let leaf = self.issuer.issue_leaf(
            &ca,
            &common_name,
            &sans,
            usage,
            self.settings.cert_validity_days,
        )?;

        let mut secret = Self::secret(scan, name);
        secret.data.insert(TLS_CERT_KEY.into(), leaf.cert_pem);
        secret.data.insert(TLS_KEY_KEY.into(), leaf.key_pem);
        secret.data.insert(CA_CERT_KEY.into(), ca.cert_pem);
        store::create_if_absent(store, &secret).await?;
        tracing::debug!(target: "scan::channel", secret = %secret.metadata.name, ?usage, "issued certificate");
        Ok(())
    }

    pub async fn ensure_server_cert<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        self.ensure_leaf(
            store,
            scan,
            naming::server_cert_secret_name(scan.name()),
            naming::result_server_name(scan.name()),
            CertUsage::Server,
        )
        .await
    }

    pub async fn ensure_client_cert<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        self.ensure_leaf(
            store,
            scan,
            naming::client_cert_secret_name(scan.name()),
            format!("{}{}", scan.name(), naming::CLIENT_CERT_SUFFIX),
            CertUsage::Client,
        )
        .await
    }

    /// Root CA first; both leaves are signed by it.
    pub async fn ensure_trust<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        self.ensure_root_ca(store, scan).await?;
        self.ensure_server_cert(store, scan).await?;
        self.ensure_client_cert(store, scan).await
    }

    fn endpoint_labels(scan: &Scan) -> complyd_model::Labels {
        let mut endpoint = scan.selector_labels();
        endpoint.insert(labels::WORKLOAD.into(), labels::WORKLOAD_RESULT_SERVER.into());
        endpoint
    }

    pub fn endpoint_deployment(&self, scan: &Scan, claim: &str, rotation: u16) -> Deployment {
        let selector = Self::endpoint_labels(scan);
        let mut metadata = ObjectMeta::named(scan.namespace(), naming::result_server_name(scan.name()))
            .with_labels(selector.clone());
        metadata.set_controller_owner(scan.as_owner());
        let tls = "/etc/pki/tls";

        Deployment {
            metadata,
            spec: DeploymentSpec {
                replicas: 1,
                selector,
                template: PodSpec {
                    service_account: Some("complyd-resultserver".into()),
                    containers: vec![Container {
                        name: RESULT_SERVER_CONTAINER.into(),
                        image: self.image.clone(),
                        command: vec!["complyd-server".into(), "result-server".into()],
                        args: vec![
                            format!("--path={RESULT_SERVER_PATH}"),
                            format!("--port={}", self.settings.port),
                            format!("--owner={}", scan.name()),
                            format!("--scan-index={}", scan.status.current_index),
                            format!("--rotation={rotation}"),
                            format!("--tls-server-cert={tls}/{TLS_CERT_KEY}"),
                            format!("--tls-server-key={tls}/{TLS_KEY_KEY}"),
                            format!("--tls-ca={tls}/{CA_CERT_KEY}"),
                        ],
                        env_from: Vec::new(),
                    }],
                    secrets: vec![naming::server_cert_secret_name(scan.name())],
                    claims: vec![claim.to_string()],
                    ..PodSpec::default()
                },
            },
        }
    }

    pub fn endpoint_service(&self, scan: &Scan) -> Service {
        let selector = Self::endpoint_labels(scan);
        let mut metadata = ObjectMeta::named(scan.namespace(), naming::result_server_name(scan.name()))
            .with_labels(selector.clone());
        metadata.set_controller_owner(scan.as_owner());
        Service {
            metadata,
            spec: ServiceSpec {
                selector,
                port: self.settings.port,
            },
        }
    }

    /// Creates the receiving deployment and service unless they exist.
    pub async fn ensure_endpoint<S: ObjectStore>(
        &self,
        store: &S,
        scan: &Scan,
        storage: &StorageDefaults,
    ) -> Result<()> {
        let rotation = match scan.spec.raw_result_storage.rotation {
            0 => storage.rotation,
            rotation => rotation,
        };
        let claim = naming::storage_claim_name(scan.name());
        store::create_if_absent(store, &self.endpoint_deployment(scan, &claim, rotation)).await?;
        store::create_if_absent(store, &self.endpoint_service(scan)).await?;
        Ok(())
    }

    /// Stops the receiver without deleting it.
    pub async fn scale_to_zero<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        let key = ObjectKey::new(scan.namespace(), naming::result_server_name(scan.name()));
        let Some(mut deployment) = store::get_opt::<_, Deployment>(store, &key).await? else {
            return Ok(());
        };
        if deployment.spec.replicas == 0 {
            return Ok(());
        }
        deployment.spec.replicas = 0;
        store.update(&deployment).await?;
        tracing::debug!(target: "scan::channel", deployment = %key, "scaled result server to zero");
        Ok(())
    }

    pub async fn delete_endpoint<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        let key = ObjectKey::new(scan.namespace(), naming::result_server_name(scan.name()));
        store::delete_if_present::<_, Deployment>(store, &key).await?;
        store::delete_if_present::<_, Service>(store, &key).await?;
        Ok(())
    }

    pub async fn delete_server_cert<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        let key = ObjectKey::new(scan.namespace(), naming::server_cert_secret_name(scan.name()));
        store::delete_if_present::<_, Secret>(store, &key).await?;
        Ok(())
    }

    pub async fn delete_client_cert<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        let key = ObjectKey::new(scan.namespace(), naming::client_cert_secret_name(scan.name()));
        store::delete_if_present::<_, Secret>(store, &key).await?;
        Ok(())
    }

    pub async fn delete_root_ca<S: ObjectStore>(&self, store: &S, scan: &Scan) -> Result<()> {
        let key = ObjectKey::new(scan.namespace(), naming::root_ca_secret_name(scan.name()));
        store::delete_if_present::<_, Secret>(store, &key).await?;
        Ok(())
    }
}
