use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConnection};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::gateway::TlsInfo;

/// Builds the acceptor from the PEM certificate chain and private key.
pub fn load_acceptor(cfg: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(&cfg.cert_file)
        .with_context(|| format!("reading certificates from {}", cfg.cert_file.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", cfg.cert_file.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cfg.cert_file.display());
    }
    let key = PrivateKeyDer::from_pem_file(&cfg.key_file)
        .with_context(|| format!("reading private key from {}", cfg.key_file.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut server = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and key do not match")?;
    server.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server)))
}

/// What the handshake negotiated, as exposed in `Scope.tls`.
pub fn connection_info(conn: &ServerConnection) -> TlsInfo {
    TlsInfo {
        protocol: conn.protocol_version().map(|v| format!("{:?}", v)),
        cipher_suite: conn.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())),
        alpn_protocol: conn.alpn_protocol().map(Bytes::copy_from_slice),
        server_name: conn.server_name().map(str::to_owned),
        peer_certificates: conn
            .peer_certificates()
            .map(|chain| chain.iter().map(|c| Bytes::copy_from_slice(c.as_ref())).collect())
            .unwrap_or_default(),
    }
}
