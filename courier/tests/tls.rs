mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::timeout;
use courier::client::client_config::ClientConfig;
use courier::client::Client;
use courier::server::server_config::ServerConfig;
use courier::TlsVersion;
use common::{line_event, RunningServer};

struct TestCa {
    cert: Certificate,
    key: KeyPair,
}

impl TestCa {
    fn new(name: &str) -> TestCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        let cert = params.self_signed(&key).unwrap();
        TestCa { cert, key }
    }

    /// writes a certificate / key pair signed by this CA, returning their paths
    fn issue(&self, dir: &TempDir, cn: &str, usage: ExtendedKeyUsagePurpose) -> (PathBuf, PathBuf) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["127.0.0.1".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.extended_key_usages = vec![usage];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        let cert_path = dir.path().join(format!("{}.crt", cn));
        let key_path = dir.path().join(format!("{}.key", cn));
        fs::write(&cert_path, cert.pem()).unwrap();
        fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    fn write(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        fs::write(&path, self.cert.pem()).unwrap();
        path
    }
}

struct Pki {
    dir: TempDir,
    ca_dir: PathBuf,
    ca_path: PathBuf,
    server_cert: PathBuf,
    server_key: PathBuf,
    client_cert: PathBuf,
    client_key: PathBuf,
}

impl Pki {
    fn new() -> Pki {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestCa::new("courier test ca");
        let ca_dir = dir.path().join("ca");
        fs::create_dir(&ca_dir).unwrap();
        let ca_path = ca.write(&ca_dir, "ca.pem");
        let (server_cert, server_key) = ca.issue(&dir, "courier-server", ExtendedKeyUsagePurpose::ServerAuth);
        let (client_cert, client_key) = ca.issue(&dir, "shipper-01", ExtendedKeyUsagePurpose::ClientAuth);
        Pki { dir, ca_dir, ca_path, server_cert, server_key, client_cert, client_key }
    }

    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new("127.0.0.1", 0);
        config.ssl_certificate = Some(self.server_cert.clone());
        config.ssl_key = Some(self.server_key.clone());
        config
    }

    fn client_config(&self, port: u16) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", port);
        config.ssl_ca = Some(self.ca_path.clone());
        config.idle_timeout = Duration::from_millis(100);
        config.reconnect_backoff = Duration::from_millis(100);
        config
    }
}

async fn ship(client: Client, n: usize) -> bool {
    for i in 0..n {
        client.publish(line_event(i)).await.unwrap();
    }
    timeout(Duration::from_secs(30), client.shutdown(false)).await.unwrap()
}

#[tokio::test]
async fn test_tls() {
    let pki = Pki::new();
    let mut server = RunningServer::bind(pki.server_config()).await;
    let client = Client::new(pki.client_config(server.port())).unwrap();

    assert!(ship(client, 20).await);
    for i in 0..20 {
        assert_eq!(server.next_event().await, line_event(i));
    }
    server.stop().await;
}

#[tokio::test]
async fn test_tls13_only() {
    let pki = Pki::new();
    let mut server_config = pki.server_config();
    server_config.min_tls_version = TlsVersion::Tls13;
    let mut server = RunningServer::bind(server_config).await;

    let mut client_config = pki.client_config(server.port());
    client_config.min_tls_version = TlsVersion::Tls13;
    let client = Client::new(client_config).unwrap();

    assert!(ship(client, 1).await);
    assert_eq!(server.next_event().await, line_event(0));
    server.stop().await;
}

#[tokio::test]
async fn test_client_certificate_common_name() {
    let pki = Pki::new();
    let mut server_config = pki.server_config();
    server_config.ssl_verify = true;
    server_config.ssl_verify_ca = Some(pki.ca_dir.clone());
    server_config.add_peer_fields = true;
    let mut server = RunningServer::bind(server_config).await;

    let mut client_config = pki.client_config(server.port());
    client_config.ssl_certificate = Some(pki.client_cert.clone());
    client_config.ssl_key = Some(pki.client_key.clone());
    let client = Client::new(client_config).unwrap();

    assert!(ship(client, 3).await);
    for i in 0..3 {
        let event = server.next_event().await;
        assert_eq!(event["message"], json!(format!("line {}", i)));
        assert_eq!(event["peer_ssl_cn"], json!("shipper-01"));
        assert!(event["peer"].as_str().unwrap().starts_with("127.0.0.1:"));
    }
    server.stop().await;
}

#[tokio::test]
async fn test_missing_client_certificate_is_rejected() {
    let pki = Pki::new();
    let mut server_config = pki.server_config();
    server_config.ssl_verify = true;
    server_config.ssl_verify_ca = Some(pki.ca_path.clone());
    let mut server = RunningServer::bind(server_config).await;

    let client = Client::new(pki.client_config(server.port())).unwrap();
    client.publish(line_event(0)).await.unwrap();

    server.assert_no_event(Duration::from_secs(1)).await;
    client.shutdown(true).await;
    server.stop().await;
}

#[tokio::test]
async fn test_untrusted_server_is_rejected() {
    let pki = Pki::new();
    let mut server = RunningServer::bind(pki.server_config()).await;

    let other_dir = tempfile::tempdir().unwrap();
    let other_ca = TestCa::new("some other ca").write(other_dir.path(), "other.pem");
    let mut client_config = pki.client_config(server.port());
    client_config.ssl_ca = Some(other_ca);
    let client = Client::new(client_config).unwrap();
    client.publish(line_event(0)).await.unwrap();

    server.assert_no_event(Duration::from_secs(1)).await;
    client.shutdown(true).await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_requires_key_material() {
    let pki = Pki::new();
    let mut config = pki.server_config();
    config.ssl_key = Some(pki.dir.path().join("missing.key"));
    assert!(courier::server::Server::bind(config).await.is_err());
}
