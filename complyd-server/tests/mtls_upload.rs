use std::{fs, net::SocketAddr, path::Path, time::Duration};

use anyhow::Result;
use axum_server::Handle;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use complyd_config::{CollectorConfig, TlsPaths};
use complyd_core::{
    artifact,
    channel::{CertUsage, IssuedPair, RcgenIssuer, TrustIssuer},
    config::RetryConfig,
};
use complyd_model::{ConfigMap, labels};
use complyd_server::{
    collector::{self, CollectError},
    receiver::{self, ReceiverState},
    tls,
};

struct Pki {
    ca: IssuedPair,
    server: IssuedPair,
    client: IssuedPair,
}

fn issue_pki() -> Pki {
    let issuer = RcgenIssuer;
    let ca = issuer.issue_root("workers-ca", 1).expect("root");
    let server = issuer
        .issue_leaf(&ca, "workers-rs", &["localhost".into()], CertUsage::Server, 1)
        .expect("server");
    let client = issuer
        .issue_leaf(&ca, "workers-client", &["workers-client".into()], CertUsage::Client, 1)
        .expect("client");
    Pki { ca, server, client }
}

fn write_tls(dir: &Path, leaf: &IssuedPair, ca: &IssuedPair) -> TlsPaths {
    fs::create_dir_all(dir).expect("tls dir");
    let paths = TlsPaths {
        cert: dir.join("tls.crt"),
        key: dir.join("tls.key"),
        ca: dir.join("ca.crt"),
    };
    fs::write(&paths.cert, &leaf.cert_pem).expect("cert");
    fs::write(&paths.key, &leaf.key_pem).expect("key");
    fs::write(&paths.ca, &ca.cert_pem).expect("ca");
    paths
}

async fn start_receiver(root: &Path, tls_paths: &TlsPaths) -> Result<(SocketAddr, Handle<SocketAddr>)> {
    let acceptor = tls::receiver_acceptor(tls_paths).await?;
    let handle = Handle::new();
    let state = ReceiverState::new(root.join("0"), "workers");
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    tokio::spawn(receiver::serve(addr, acceptor, state, handle.clone()));
    let bound = handle
        .listening()
        .await
        .ok_or_else(|| anyhow::anyhow!("receiver did not start"))?;
    Ok((bound, handle))
}

fn collector_config(reports: &Path, tls_paths: TlsPaths, port: u16) -> CollectorConfig {
    CollectorConfig {
        arf_file: reports.join("report-arf.xml"),
        results_file: reports.join("report.xml"),
        output_file: reports.join("cmd_output"),
        exit_code_file: reports.join("exit_code"),
        warnings_file: reports.join("warning_output"),
        report_name: "workers-node-a-pod".into(),
        scan: "workers".into(),
        namespace: "compliance".into(),
        owner_uid: "scan-uid".into(),
        source: "node-a".into(),
        artifact_file: reports.join("artifact.json"),
        result_server_uri: format!("https://localhost:{port}/"),
        tls: tls_paths,
        compression_threshold: 64,
        timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts: 2,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            ..RetryConfig::default()
        },
    }
}

fn read_artifact(path: &Path) -> ConfigMap {
    serde_json::from_slice(&fs::read(path).expect("artifact")).expect("artifact json")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collector_uploads_over_mutual_tls_and_records_the_artifact() -> Result<()> {
    let dir = TempDir::new()?;
    let pki = issue_pki();
    let server_tls = write_tls(&dir.path().join("server-tls"), &pki.server, &pki.ca);
    let client_tls = write_tls(&dir.path().join("client-tls"), &pki.client, &pki.ca);
    let root = dir.path().join("results");
    let (addr, handle) = start_receiver(&root, &server_tls).await?;

    let reports = dir.path().join("reports");
    fs::create_dir_all(&reports)?;
    let arf = "<arf>".to_string() + &"x".repeat(512) + "</arf>";
    fs::write(reports.join("report-arf.xml"), &arf)?;
    fs::write(reports.join("report.xml"), "<xccdf/>")?;
    fs::write(reports.join("exit_code"), "2\n")?;
    fs::write(reports.join("warning_output"), "could not read /etc/audit\n")?;

    let config = collector_config(&reports, client_tls, addr.port());
    let outcome = collector::run(&config, &CancellationToken::new()).await?;
    assert_eq!(outcome.exit_code, "2");
    assert!(outcome.uploaded);

    let stored = fs::read(root.join("0/workers-node-a-pod.xml.bzip2"))?;
    assert_eq!(artifact::decompress(&stored)?, arf.as_bytes());

    let recorded = read_artifact(&config.artifact_file);
    assert_eq!(recorded.metadata.name, "workers-node-a-pod");
    assert_eq!(recorded.metadata.namespace, "compliance");
    assert_eq!(recorded.value(labels::KEY_EXIT_CODE), Some("2"));
    assert_eq!(recorded.value(labels::KEY_RESULTS), Some("<xccdf/>"));
    assert_eq!(recorded.value(labels::KEY_WARNINGS), Some("could not read /etc/audit"));
    assert_eq!(artifact::source(&recorded), "node-a");
    assert!(!artifact::is_compressed(&recorded));

    handle.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scanner_errors_are_recorded_without_uploading() -> Result<()> {
    let dir = TempDir::new()?;
    let pki = issue_pki();
    let client_tls = write_tls(&dir.path().join("client-tls"), &pki.client, &pki.ca);
    let reports = dir.path().join("reports");
    fs::create_dir_all(&reports)?;
    fs::write(reports.join("exit_code"), "1\n")?;
    fs::write(reports.join("cmd_output"), "OpenSCAP Error: no such profile")?;

    // Nothing listens on this port; an upload attempt would fail the run.
    let config = collector_config(&reports, client_tls, 9);
    let outcome = collector::run(&config, &CancellationToken::new()).await?;
    assert_eq!(outcome.exit_code, "1");
    assert!(!outcome.uploaded);

    let recorded = read_artifact(&config.artifact_file);
    assert_eq!(recorded.value(labels::KEY_EXIT_CODE), Some("1"));
    assert_eq!(
        recorded.value(labels::KEY_ERROR_MSG),
        Some("OpenSCAP Error: no such profile")
    );
    assert_eq!(recorded.value(labels::KEY_RESULTS), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clients_from_another_ca_are_refused() -> Result<()> {
    let dir = TempDir::new()?;
    let pki = issue_pki();
    let stranger = issue_pki();
    let server_tls = write_tls(&dir.path().join("server-tls"), &pki.server, &pki.ca);
    // Trusts the right server but presents a certificate from a foreign CA.
    let client_tls = TlsPaths {
        ca: server_tls.ca.clone(),
        ..write_tls(&dir.path().join("client-tls"), &stranger.client, &stranger.ca)
    };
    let root = dir.path().join("results");
    let (addr, handle) = start_receiver(&root, &server_tls).await?;

    let reports = dir.path().join("reports");
    fs::create_dir_all(&reports)?;
    fs::write(reports.join("report-arf.xml"), "<arf/>")?;
    fs::write(reports.join("report.xml"), "<xccdf/>")?;
    fs::write(reports.join("exit_code"), "0")?;

    let config = collector_config(&reports, client_tls, addr.port());
    let err = collector::run(&config, &CancellationToken::new())
        .await
        .expect_err("foreign client certificate");
    assert!(matches!(err, CollectError::Upload(_)), "unexpected error: {err}");
    assert!(!root.join("0/workers-node-a-pod.xml").exists());
    assert!(!config.artifact_file.exists());

    handle.shutdown();
    Ok(())
}
