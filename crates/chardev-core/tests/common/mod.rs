//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use tempfile::NamedTempFile;
use tokio::runtime::Handle;

use chardev_core::config::{TlsCredsConfig, TlsEndpoint};
use chardev_core::testing::RecordingFrontEnd;
use chardev_core::tls::TlsObjects;
use chardev_core::{CharBackend, Chardev, ChardevMetrics, ChardevRegistry};

/// Generous bound for anything that should happen "soon".
pub const WAIT: Duration = Duration::from_secs(5);

pub fn registry() -> ChardevRegistry {
    registry_with(TlsObjects::new())
}

pub fn registry_with(tls: TlsObjects) -> ChardevRegistry {
    ChardevRegistry::new(tls, Arc::new(ChardevMetrics::new()), Handle::current())
}

/// Attach a recording front-end with room for `capacity` bytes.
pub fn attach(chr: &Arc<Chardev>, capacity: usize) -> (CharBackend, Arc<RecordingFrontEnd>) {
    let mut handle = CharBackend::attach(Arc::clone(chr)).unwrap();
    let fe = RecordingFrontEnd::new(capacity);
    handle.set_handlers(fe.clone(), None).unwrap();
    (handle, fe)
}

/// First TCP address a listening device bound.
pub fn bound_addr(chr: &Chardev) -> SocketAddr {
    let status = chr.status().expect("socket devices report status");
    status.local[0].parse().unwrap()
}

/// A throwaway CA with one server and one client certificate.
pub struct TestPki {
    pub ca_cert: NamedTempFile,
    pub server_cert: NamedTempFile,
    pub server_key: NamedTempFile,
    pub client_cert: NamedTempFile,
    pub client_key: NamedTempFile,
}

fn pem_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

impl TestPki {
    pub fn generate(client_cn: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "integration CA");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params
            .distinguished_name
            .push(DnType::CommonName, client_cn);
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        Self {
            ca_cert: pem_file(&ca.pem()),
            server_cert: pem_file(&server.pem()),
            server_key: pem_file(&server_key.serialize_pem()),
            client_cert: pem_file(&client.pem()),
            client_key: pem_file(&client_key.serialize_pem()),
        }
    }

    /// Server credentials that require a client certificate from this CA.
    pub fn server_config(&self) -> TlsCredsConfig {
        TlsCredsConfig {
            endpoint: TlsEndpoint::Server,
            cert_path: Some(self.server_cert.path().to_path_buf()),
            key_path: Some(self.server_key.path().to_path_buf()),
            ca_cert_path: Some(self.ca_cert.path().to_path_buf()),
            verify_peer: true,
        }
    }

    /// Client credentials presenting the client certificate.
    pub fn client_config(&self) -> TlsCredsConfig {
        TlsCredsConfig {
            endpoint: TlsEndpoint::Client,
            cert_path: Some(self.client_cert.path().to_path_buf()),
            key_path: Some(self.client_key.path().to_path_buf()),
            ca_cert_path: Some(self.ca_cert.path().to_path_buf()),
            verify_peer: true,
        }
    }
}
