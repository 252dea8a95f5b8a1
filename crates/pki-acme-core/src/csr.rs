//! CSR checks applied at finalize
//!
//! The names a CSR asks for must be a subset of what the order proved. No
//! CSR reaches the CA bridge without passing these checks.

use std::collections::BTreeSet;

use x509_parser::prelude::*;

use crate::error::{AcmeError, AcmeResult};
use crate::identifier::normalize_dns_name;
use crate::jose::decode_b64url;

#[derive(Debug, Clone)]
pub struct ParsedCsr {
    pub der: Vec<u8>,
    /// Subject common name plus DNS SANs, normalized
    pub names: BTreeSet<String>,
}

/// Decode a base64url DER CSR, verify its self-signature and collect its names
pub fn parse_csr(csr_b64: &str) -> AcmeResult<ParsedCsr> {
    let der = decode_b64url(csr_b64, "csr").map_err(|_| AcmeError::bad_csr("CSR is not valid base64url"))?;

    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| AcmeError::bad_csr(format!("CSR could not be parsed: {}", e)))?;

    csr.verify_signature()
        .map_err(|_| AcmeError::bad_csr("CSR signature is invalid"))?;

    let mut names = BTreeSet::new();

    for cn in csr.certification_request_info.subject.iter_common_name() {
        let value = cn
            .as_str()
            .map_err(|_| AcmeError::bad_csr("CSR common name is not a string"))?;
        names.insert(normalize_dns_name(value));
    }

    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => {
                            names.insert(normalize_dns_name(dns));
                        }
                        other => {
                            return Err(AcmeError::bad_csr(format!(
                                "CSR contains an unsupported subject alternative name: {:?}",
                                other
                            )))
                        }
                    }
                }
            }
        }
    }

    if names.is_empty() {
        return Err(AcmeError::bad_csr("CSR does not name any identifiers"));
    }

    Ok(ParsedCsr { der, names })
}

/// Every name in the CSR must be one of the order's identifiers
pub fn check_csr_names(csr: &ParsedCsr, identifiers: &BTreeSet<String>) -> AcmeResult<()> {
    let extra: Vec<&str> = csr
        .names
        .iter()
        .filter(|name| !identifiers.contains(*name))
        .map(String::as_str)
        .collect();

    if !extra.is_empty() {
        return Err(AcmeError::bad_csr(format!(
            "CSR names identifiers not authorized by this order: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProblemKind;
    use crate::jose::encode_b64url;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

    fn csr_for(cn: &str, sans: &[&str]) -> String {
        let mut params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let csr = params.serialize_request(&key).unwrap();
        encode_b64url(csr.der())
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_collects_cn_and_sans() {
        let parsed = parse_csr(&csr_for("Example.com", &["example.com", "www.example.com"])).unwrap();
        assert_eq!(parsed.names, set(&["example.com", "www.example.com"]));
    }

    #[test]
    fn test_subset_accepted() {
        let parsed = parse_csr(&csr_for("example.com", &["example.com"])).unwrap();
        assert!(check_csr_names(&parsed, &set(&["example.com", "www.example.com"])).is_ok());
    }

    #[test]
    fn test_extra_name_rejected() {
        let parsed = parse_csr(&csr_for("example.com", &["example.com", "evil.com"])).unwrap();
        let err = check_csr_names(&parsed, &set(&["example.com"])).unwrap_err();
        assert_eq!(err.kind, ProblemKind::BadCsr);
        assert!(err.detail.contains("evil.com"));
    }

    #[test]
    fn test_garbage_is_bad_csr() {
        assert_eq!(parse_csr("!!!").unwrap_err().kind, ProblemKind::BadCsr);
        assert_eq!(
            parse_csr(&encode_b64url(b"not a csr")).unwrap_err().kind,
            ProblemKind::BadCsr
        );
    }
}
