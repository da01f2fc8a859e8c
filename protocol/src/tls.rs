use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use pkcs8::der::pem::PemLabel;
use pkcs8::{Document, EncryptedPrivateKeyInfo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, SupportedProtocolVersion};
use tracing::debug;
use crate::error::CourierError;

/// Minimum TLS protocol version to negotiate
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl TlsVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            TlsVersion::Tls12 => TLS12_AND_UP,
            TlsVersion::Tls13 => TLS13_ONLY,
        }
    }
}

impl FromStr for TlsVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1.2" | "tls1.2" => Ok(TlsVersion::Tls12),
            "1.3" | "tls1.3" => Ok(TlsVersion::Tls13),
            _ => anyhow::bail!("unsupported minimum TLS version '{}', expected 1.2 or 1.3", s),
        }
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_file(path: &Path) -> Result<Vec<u8>, CourierError> {
    fs::read(path)
        .map_err(|e| CourierError::Tls(format!("failed to read {}: {}", path.display(), e)))
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CourierError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CourierError::Tls(format!("failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(CourierError::Tls("no certificates found".to_string()));
    }
    Ok(certs)
}

pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, CourierError> {
    parse_certificates(&read_file(path)?)
        .map_err(|e| CourierError::Tls(format!("{}: {}", path.display(), e)))
}

/// Loads a PEM private key. Encrypted PKCS#8 keys (`ENCRYPTED PRIVATE KEY`) are decrypted with
///  `passphrase`, which is ignored for unencrypted keys.
pub fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>, CourierError> {
    let pem = read_file(path)?;
    let result = match (encrypted_key_document(&pem), passphrase) {
        (Some(doc), Some(passphrase)) => decrypt_private_key(&doc, passphrase),
        (Some(_), None) => Err("the key is encrypted, but no passphrase is configured".to_string()),
        (None, _) => PrivateKeyDer::from_pem_slice(&pem).map_err(|e| e.to_string()),
    };
    result.map_err(|e| CourierError::Tls(format!("failed to load private key {}: {}", path.display(), e)))
}

fn encrypted_key_document(pem: &[u8]) -> Option<Document> {
    let pem = std::str::from_utf8(pem).ok()?;
    let (label, doc) = Document::from_pem(pem).ok()?;
    (label == EncryptedPrivateKeyInfo::PEM_LABEL).then_some(doc)
}

fn decrypt_private_key(doc: &Document, passphrase: &str) -> Result<PrivateKeyDer<'static>, String> {
    let info = EncryptedPrivateKeyInfo::try_from(doc.as_bytes())
        .map_err(|e| format!("malformed encrypted key: {}", e))?;
    let decrypted = info.decrypt(passphrase)
        .map_err(|e| format!("decryption failed: {}", e))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(decrypted.as_bytes().to_vec())))
}

/// Loads trust anchors from a PEM file, or from every file in a directory
pub fn load_root_store(path: &Path) -> Result<RootCertStore, CourierError> {
    let mut store = RootCertStore::empty();
    if path.is_dir() {
        let entries = fs::read_dir(path)
            .map_err(|e| CourierError::Tls(format!("failed to list {}: {}", path.display(), e)))?;
        for entry in entries {
            let file = entry?.path();
            if !file.is_file() {
                continue;
            }
            // directories of trust anchors commonly hold unrelated files as well
            match load_certificates(&file) {
                Ok(certs) => add_all(&mut store, certs)?,
                Err(e) => debug!("skipping {}: {}", file.display(), e),
            }
        }
    }
    else {
        add_all(&mut store, load_certificates(path)?)?;
    }

    if store.is_empty() {
        return Err(CourierError::Tls(format!("no CA certificates found in {}", path.display())));
    }
    Ok(store)
}

fn add_all(store: &mut RootCertStore, certs: Vec<CertificateDer<'static>>) -> Result<(), CourierError> {
    for cert in certs {
        store.add(cert)?;
    }
    Ok(())
}

/// The public web PKI trust anchors
pub fn default_root_store() -> RootCertStore {
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
}

pub fn client_config(
    roots: RootCertStore,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    min_version: TlsVersion,
) -> Result<Arc<rustls::ClientConfig>, CourierError> {
    let builder = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(min_version.protocol_versions())?
        .with_root_certificates(roots);

    let config = match identity {
        Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// `client_roots` enables verification of client certificates against the given anchors
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
    min_version: TlsVersion,
) -> Result<Arc<rustls::ServerConfig>, CourierError> {
    let provider = crypto_provider();
    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(min_version.protocol_versions())?;

    let config = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| CourierError::Tls(format!("client certificate verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth()
            .with_single_cert(certs, key)?,
    };
    Ok(Arc::new(config))
}

/// The subject's common name, if the certificate parses and has one
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let cn = parsed.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkcs8::der::pem::LineEnding;
    use pkcs8::der::EncodePem;
    use pkcs8::pkcs5::{pbes2, EncryptionScheme};
    use rcgen::{CertificateParams, DnType, KeyPair};
    use rstest::rstest;

    struct TestCert {
        cert_pem: String,
        key_pem: String,
    }

    fn self_signed(cn: &str) -> TestCert {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = params.self_signed(&key).unwrap();
        TestCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    #[rstest]
    #[case::short_12("1.2", TlsVersion::Tls12)]
    #[case::short_13("1.3", TlsVersion::Tls13)]
    #[case::long_upper("TLS1.3", TlsVersion::Tls13)]
    fn test_tls_version_from_str(#[case] s: &str, #[case] expected: TlsVersion) {
        assert_eq!(s.parse::<TlsVersion>().unwrap(), expected);
    }

    #[test]
    fn test_tls_version_from_str_invalid() {
        assert!("1.1".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_common_name() {
        let test_cert = self_signed("edge-shipper-01");
        let certs = parse_certificates(test_cert.cert_pem.as_bytes()).unwrap();
        assert_eq!(common_name(&certs[0]), Some("edge-shipper-01".to_string()));
    }

    #[test]
    fn test_common_name_garbage() {
        assert_eq!(common_name(&CertificateDer::from(vec![1u8, 2, 3])), None);
    }

    #[test]
    fn test_parse_certificates_empty() {
        assert!(matches!(parse_certificates(b"no pem in here"), Err(CourierError::Tls(_))));
    }

    #[test]
    fn test_load_root_store_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.pem"), self_signed("a").cert_pem).unwrap();
        fs::write(dir.path().join("b.pem"), self_signed("b").cert_pem).unwrap();
        fs::write(dir.path().join("README"), "not a certificate").unwrap();

        assert_eq!(load_root_store(&dir.path().join("a.pem")).unwrap().len(), 1);
        assert_eq!(load_root_store(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_load_root_store_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_root_store(&dir.path().join("nope.pem")).is_err());
        assert!(load_root_store(dir.path()).is_err());
    }

    #[test]
    fn test_load_private_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, self_signed("x").key_pem).unwrap();

        assert!(load_private_key(&path, None).is_ok());
        assert!(load_private_key(&path, Some("ignored")).is_ok());
    }

    fn encrypted_pem(key: &KeyPair, passphrase: &str) -> String {
        let scheme = EncryptionScheme::from(pbes2::Parameters::pbkdf2_sha256_aes256cbc(2048, b"courier test salt", &[7u8; 16]).unwrap());
        let encrypted_data = scheme.encrypt(passphrase, &key.serialize_der()).unwrap();
        let info = EncryptedPrivateKeyInfo {
            encryption_algorithm: scheme,
            encrypted_data: &encrypted_data,
        };
        info.to_pem(LineEnding::LF).unwrap()
    }

    #[test]
    fn test_load_encrypted_private_key() {
        let key = KeyPair::generate().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, encrypted_pem(&key, "s3cret")).unwrap();

        match load_private_key(&path, Some("s3cret")).unwrap() {
            PrivateKeyDer::Pkcs8(decrypted) => assert_eq!(decrypted.secret_pkcs8_der(), key.serialize_der().as_slice()),
            other => panic!("expected a PKCS#8 key, got {:?}", other),
        }
        assert!(matches!(load_private_key(&path, Some("wrong")), Err(CourierError::Tls(_))));
        assert!(matches!(load_private_key(&path, None), Err(CourierError::Tls(_))));
    }

    #[test]
    fn test_encrypted_private_key_builds_server_config() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()]).unwrap().self_signed(&key).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        fs::write(&path, encrypted_pem(&key, "s3cret")).unwrap();

        let decrypted = load_private_key(&path, Some("s3cret")).unwrap();
        let certs = parse_certificates(cert.pem().as_bytes()).unwrap();
        assert!(server_config(certs, decrypted, None, TlsVersion::Tls12).is_ok());
    }

    #[rstest]
    #[case::tls12(TlsVersion::Tls12)]
    #[case::tls13(TlsVersion::Tls13)]
    fn test_build_configs(#[case] min_version: TlsVersion) {
        let test_cert = self_signed("server");
        let certs = parse_certificates(test_cert.cert_pem.as_bytes()).unwrap();
        let key = PrivateKeyDer::from_pem_slice(test_cert.key_pem.as_bytes()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(certs[0].clone()).unwrap();

        assert!(client_config(roots.clone(), None, min_version).is_ok());
        assert!(client_config(roots.clone(), Some((certs.clone(), key.clone_key())), min_version).is_ok());
        assert!(server_config(certs.clone(), key.clone_key(), None, min_version).is_ok());
        assert!(server_config(certs, key, Some(roots), min_version).is_ok());
    }

    #[test]
    fn test_default_root_store() {
        assert!(!default_root_store().is_empty());
    }
}
