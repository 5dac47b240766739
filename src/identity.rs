//! IdentityExtractor: pulls a SPIFFE-style URI out of the peer certificate's SAN.
//!
//! Extraction happens once at request entry (the TLS layer already verified the
//! cert against the CA bundle); handlers never re-parse certificates.

use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

/// Extract the first SAN URI entry whose scheme is `spiffe`, if any.
///
/// `der` is the peer certificate in DER form, as handed back by the TLS stack
/// after the handshake completes. Absence of a SPIFFE SAN is not an error — it
/// just means `peer_identity` stays `None`.
pub fn extract_spiffe_id(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    find_spiffe_san(&cert)
}

fn find_spiffe_san(cert: &X509Certificate<'_>) -> Option<String> {
    let san_ext = cert.subject_alternative_name().ok().flatten()?;

    for name in &san_ext.value.general_names {
        if let GeneralName::URI(uri) = name {
            if uri.starts_with("spiffe://") {
                debug!(spiffe_id = %uri, "extracted SPIFFE identity from peer certificate");
                return Some(uri.to_string());
            }
        }
    }

    None
}
