//! Certificate issuance bridge
//!
//! The engine never signs certificates itself. Finalize hands a checked CSR
//! to a [`CertificateIssuer`] and records whatever chain comes back.
//! [`LocalCaIssuer`] is a small rcgen-backed CA for single-node deployments
//! and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
    SerialNumber,
};
use rustls::pki_types::CertificateSigningRequestDer;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

#[derive(Debug, Clone)]
pub struct IssuanceRequest {
    pub order_id: String,
    pub profile_id: String,
    /// Validated identifiers of the order
    pub identifiers: Vec<String>,
    pub csr_der: Vec<u8>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    /// Used when the order does not ask for `notAfter`
    pub default_lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM chain, leaf first
    pub chain_pem: String,
    /// Hex serial number of the leaf
    pub serial: String,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum IssuanceError {
    /// The CA refused this CSR
    #[error("CSR rejected: {0}")]
    Rejected(String),

    #[error("Issuance failed: {0}")]
    Internal(String),
}

impl From<rcgen::Error> for IssuanceError {
    fn from(err: rcgen::Error) -> Self {
        IssuanceError::Internal(err.to_string())
    }
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request: IssuanceRequest) -> Result<IssuedCertificate, IssuanceError>;
}

/// rcgen-backed issuing CA
pub struct LocalCaIssuer {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_pem: String,
}

impl LocalCaIssuer {
    /// Generate an ephemeral CA; certificates it issues die with the process
    pub fn generate(common_name: &str) -> Result<Self, IssuanceError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = OffsetDateTime::now_utc() + time::Duration::days(3650);

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        let ca_pem = pem_with_newline(&ca_cert.pem());

        info!(common_name, "Generated ephemeral issuing CA");
        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem,
        })
    }

    /// Load a CA certificate and its private key from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, IssuanceError> {
        let ca_key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let ca_cert = params.self_signed(&ca_key)?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_pem: pem_with_newline(cert_pem),
        })
    }

    /// CA certificate as PEM
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// CA private key as PEM
    pub fn ca_key_pem(&self) -> String {
        self.ca_key.serialize_pem()
    }

    fn sign(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        let der = CertificateSigningRequestDer::from(request.csr_der.clone());
        let mut csr = CertificateSigningRequestParams::from_der(&der)
            .map_err(|e| IssuanceError::Rejected(e.to_string()))?;

        let now = Utc::now();
        let not_before = request.not_before.unwrap_or(now - Duration::minutes(5));
        let not_after = request
            .not_after
            .unwrap_or(now + request.default_lifetime);
        if not_after <= not_before {
            return Err(IssuanceError::Rejected("notAfter must be after notBefore".into()));
        }

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        serial[0] &= 0x7f;

        let params = &mut csr.params;
        params.subject_alt_names = request
            .identifiers
            .iter()
            .map(|name| Ok(SanType::DnsName(name.clone().try_into()?)))
            .collect::<Result<Vec<_>, rcgen::Error>>()?;
        let mut dn = DistinguishedName::new();
        if let Some(first) = request.identifiers.first() {
            dn.push(DnType::CommonName, first.as_str());
        }
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        let leaf = csr.signed_by(&self.ca_cert, &self.ca_key)?;
        let chain_pem = format!("{}{}", pem_with_newline(&leaf.pem()), self.ca_pem);

        Ok(IssuedCertificate {
            chain_pem,
            serial: serial.iter().map(|b| format!("{:02x}", b)).collect(),
            not_after: Utc
                .timestamp_opt(not_after.timestamp(), 0)
                .single()
                .unwrap_or(not_after),
        })
    }
}

fn pem_with_newline(pem: &str) -> String {
    format!("{}\n", pem.trim_end())
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, IssuanceError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| IssuanceError::Rejected(format!("validity out of range: {}", e)))
}

#[async_trait]
impl CertificateIssuer for LocalCaIssuer {
    async fn issue(&self, request: IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        let issued = self.sign(&request)?;
        info!(
            order_id = %request.order_id,
            profile_id = %request.profile_id,
            serial = %issued.serial,
            "Certificate issued"
        );
        Ok(issued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::GeneralName;

    fn csr_der(names: &[&str]) -> Vec<u8> {
        let params =
            CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap();
        let key = KeyPair::generate().unwrap();
        params.serialize_request(&key).unwrap().der().to_vec()
    }

    fn request(names: &[&str]) -> IssuanceRequest {
        IssuanceRequest {
            order_id: "order-1".into(),
            profile_id: "default".into(),
            identifiers: names.iter().map(|s| s.to_string()).collect(),
            csr_der: csr_der(names),
            not_before: None,
            not_after: None,
            default_lifetime: Duration::days(47),
        }
    }

    #[tokio::test]
    async fn test_issue_chain_leaf_first() {
        let issuer = LocalCaIssuer::generate("Test ACME CA").unwrap();
        let issued = issuer.issue(request(&["example.com"])).await.unwrap();

        assert_eq!(issued.chain_pem.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(issued.chain_pem.ends_with(issuer.ca_pem()));
        assert_eq!(issued.serial.len(), 32);

        let (_, first) = x509_parser::pem::parse_x509_pem(issued.chain_pem.as_bytes()).unwrap();
        let leaf = first.parse_x509().unwrap();
        let sans: Vec<String> = leaf
            .subject_alternative_name()
            .unwrap()
            .unwrap()
            .value
            .general_names
            .iter()
            .map(|name| match name {
                GeneralName::DNSName(dns) => dns.to_string(),
                other => format!("{:?}", other),
            })
            .collect();
        assert_eq!(sans, vec!["example.com"]);
        assert!(!leaf.is_ca());
    }

    #[tokio::test]
    async fn test_respects_requested_not_after() {
        let issuer = LocalCaIssuer::generate("Test ACME CA").unwrap();
        let not_after = Utc::now() + Duration::days(10);
        let mut req = request(&["example.com"]);
        req.not_after = Some(not_after);

        let issued = issuer.issue(req).await.unwrap();
        assert_eq!(issued.not_after.timestamp(), not_after.timestamp());
    }

    #[tokio::test]
    async fn test_garbage_csr_rejected() {
        let issuer = LocalCaIssuer::generate("Test ACME CA").unwrap();
        let mut req = request(&["example.com"]);
        req.csr_der = b"garbage".to_vec();

        assert!(matches!(
            issuer.issue(req).await,
            Err(IssuanceError::Rejected(_))
        ));
    }

    #[test]
    fn test_load_from_pem() {
        let generated = LocalCaIssuer::generate("Loaded CA").unwrap();
        let loaded = LocalCaIssuer::from_pem(generated.ca_pem(), &generated.ca_key_pem()).unwrap();
        assert_eq!(loaded.ca_pem(), generated.ca_pem());
    }
}
