pub mod verifier;

use crate::config::ClientOptions;
use crate::tls::verifier::NoCertificateVerification;
use rustls::crypto::ring::{default_provider, DEFAULT_CIPHER_SUITES};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

/// Builds the rustls client configuration shared by every connection.
///
/// ALPN is left empty; the caller decides which protocols to offer.
pub fn client_config(options: &ClientOptions) -> Result<ClientConfig, anyhow::Error> {
    let mut root_store = RootCertStore::empty();
    if let Some(file_path) = options.certificate_path.as_ref() {
        let f = std::fs::File::open(file_path)
            .map_err(|e| anyhow!("open certificate {} failed: {}", file_path.display(), e))?;
        let mut rd = std::io::BufReader::new(f);
        for cert in rustls_pemfile::certs(&mut rd) {
            root_store.add(cert?)?;
        }
        ensure!(
            !root_store.is_empty(),
            "no certificate found in {}",
            file_path.display()
        );
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    };

    let provider = Arc::new(CryptoProvider {
        cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
        ..default_provider()
    });

    let mut tls_config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if options.skip_certificate_validate {
        warn!("certificate validation is disabled");
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification::new(provider)));
    }
    Ok(tls_config)
}
