//! Deterministic, length-bounded names for per-scan objects.
//!
//! Object names are capped at 63 characters. When the friendly form would not
//! fit it is replaced by a prefix followed by the hex SHA-1 of the friendly
//! form. SHA-1 is used purely as a stable shortener here.

use sha1::{Digest, Sha1};

use complyd_model::ModelError;

/// Names must be strictly shorter than this.
pub const MAX_NAME_LEN: usize = 64;

pub const PLATFORM_TARGET: &str = "api-checks";

const SCAN_POD_HASH_PREFIX: &str = "openscap-pod-";
const AGGREGATOR_HASH_PREFIX: &str = "aggregator-pod-";
const SCRIPT_HASH_PREFIX: &str = "scap-entrypoint-";
const ENV_HASH_PREFIX: &str = "scap-env-";

pub const SCRIPT_CONFIG_SUFFIX: &str = "openscap-container-entrypoint";
pub const ENV_CONFIG_SUFFIX: &str = "openscap-env-map";
pub const PLATFORM_ENV_CONFIG_SUFFIX: &str = "openscap-env-map-platform";

pub const ROOT_CA_PREFIX: &str = "root-ca-";
pub const SERVER_CERT_PREFIX: &str = "result-server-cert-";
pub const CLIENT_CERT_PREFIX: &str = "result-client-cert-";
pub const RESULT_SERVER_SUFFIX: &str = "-rs";
pub const CLIENT_CERT_SUFFIX: &str = "-client";

/// Returns `friendly` when it fits under `max_len`, otherwise `hash_prefix`
/// followed by the SHA-1 of `friendly`.
pub fn length_name(max_len: usize, hash_prefix: &str, friendly: &str) -> Result<String, ModelError> {
    if friendly.len() < max_len {
        return Ok(friendly.to_string());
    }

    let digest = Sha1::digest(friendly.as_bytes());
    let hashed = format!("{hash_prefix}{}", hex::encode(digest));
    if hashed.len() >= max_len {
        return Err(ModelError::InvalidName(format!(
            "cannot shorten '{friendly}' with prefix {hash_prefix}"
        )));
    }
    Ok(hashed)
}

/// [`length_name`] with the object-name ceiling. Prefixes used in this crate
/// always leave room for the 40 character digest.
pub fn dns_length_name(hash_prefix: &str, friendly: &str) -> String {
    length_name(MAX_NAME_LEN, hash_prefix, friendly)
        .unwrap_or_else(|_| hex::encode(Sha1::digest(friendly.as_bytes())))
}

/// Name shared by the scan workload on `target` and the result artifact it writes.
pub fn workload_name(scan: &str, target: &str) -> String {
    dns_length_name(SCAN_POD_HASH_PREFIX, &format!("{scan}-{target}-pod"))
}

pub fn artifact_name(scan: &str, target: &str) -> String {
    workload_name(scan, target)
}

pub fn aggregator_name(scan: &str) -> String {
    dns_length_name(AGGREGATOR_HASH_PREFIX, &format!("aggregator-pod-{scan}"))
}

pub fn script_config_name(scan: &str) -> String {
    dns_length_name(SCRIPT_HASH_PREFIX, &format!("{scan}-{SCRIPT_CONFIG_SUFFIX}"))
}

pub fn env_config_name(scan: &str) -> String {
    dns_length_name(ENV_HASH_PREFIX, &format!("{scan}-{ENV_CONFIG_SUFFIX}"))
}

pub fn platform_env_config_name(scan: &str) -> String {
    dns_length_name(ENV_HASH_PREFIX, &format!("{scan}-{PLATFORM_ENV_CONFIG_SUFFIX}"))
}

pub fn root_ca_secret_name(scan: &str) -> String {
    format!("{ROOT_CA_PREFIX}{scan}")
}

pub fn server_cert_secret_name(scan: &str) -> String {
    format!("{SERVER_CERT_PREFIX}{scan}")
}

pub fn client_cert_secret_name(scan: &str) -> String {
    format!("{CLIENT_CERT_PREFIX}{scan}")
}

/// Deployment and service name of the scan's result receiver.
pub fn result_server_name(scan: &str) -> String {
    format!("{scan}{RESULT_SERVER_SUFFIX}")
}

pub fn result_server_uri(scan: &str, port: u16) -> String {
    format!("https://{}:{port}/", result_server_name(scan))
}

pub fn storage_claim_name(scan: &str) -> String {
    scan.to_string()
}

/// Turns a rule identifier into something usable inside an object name.
///
/// `xccdf_org.ssgproject.content_rule_audit_rules` becomes `audit-rules`.
pub fn rule_id_to_dns(rule_id: &str) -> String {
    let trimmed = rule_id
        .rsplit_once("_rule_")
        .map(|(_, rule)| rule)
        .unwrap_or(rule_id);
    let mut out = String::with_capacity(trimmed.len());
    let mut last_dash = true;
    for ch in trimmed.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Name of the check object for `rule_id` in `scan`.
pub fn check_name(scan: &str, rule_id: &str) -> String {
    dns_length_name("check-", &format!("{scan}-{}", rule_id_to_dns(rule_id)))
}

/// Remediations are named after their check; extra ones get an index suffix.
pub fn remediation_name(check: &str, index: usize) -> String {
    if index == 0 {
        return check.to_string();
    }
    dns_length_name("rem-", &format!("{check}-{index}"))
}
