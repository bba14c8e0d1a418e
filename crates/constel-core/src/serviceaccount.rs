//! `serviceaccount://` URIs carrying cloud credentials.
//!
//! The URI host selects the provider; every provider defines a fixed set of
//! query parameters. Parsing is total: anything malformed is a
//! [`Error::Configuration`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

const SCHEME: &str = "serviceaccount";

/// Azure service principal credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureServiceAccount {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub location: String,
}

/// GCP service account key, field names as in Google's JSON key files.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: String,
    pub client_email: String,
    pub client_id: String,
    /// Optional; empty when absent from the URI.
    pub auth_uri: String,
    pub token_uri: String,
    pub auth_provider_x509_cert_url: String,
    pub client_x509_cert_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAccount {
    Azure(AzureServiceAccount),
    Gcp(GcpServiceAccountKey),
}

// Secrets never reach log output.
impl fmt::Debug for AzureServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceAccount")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("location", &self.location)
            .finish()
    }
}

impl fmt::Debug for GcpServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpServiceAccountKey")
            .field("type", &self.key_type)
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("client_email", &self.client_email)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

struct Params {
    values: HashMap<String, String>,
}

impl Params {
    fn required(&self, key: &str) -> Result<String, Error> {
        match self.values.get(key) {
            Some(v) if !v.is_empty() => Ok(v.clone()),
            _ => Err(Error::Configuration(format!(
                "service account URI is missing parameter {:?}",
                key
            ))),
        }
    }

    fn optional(&self, key: &str) -> String {
        self.values.get(key).cloned().unwrap_or_default()
    }
}

/// Parse a `serviceaccount://<provider>?...` URI.
pub fn parse(uri: &str) -> Result<ServiceAccount, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::Configuration(format!("invalid service account URI: {}", e)))?;
    if url.scheme() != SCHEME {
        return Err(Error::Configuration(format!(
            "invalid service account URI: invalid scheme: {}",
            url.scheme()
        )));
    }
    let params = Params {
        values: url.query_pairs().into_owned().collect(),
    };

    match url.host_str() {
        Some("azure") => Ok(ServiceAccount::Azure(AzureServiceAccount {
            tenant_id: params.required("tenant_id")?,
            client_id: params.required("client_id")?,
            client_secret: params.required("client_secret")?,
            location: params.required("location")?,
        })),
        Some("gcp") => Ok(ServiceAccount::Gcp(GcpServiceAccountKey {
            key_type: params.required("type")?,
            project_id: params.required("project_id")?,
            private_key_id: params.required("private_key_id")?,
            private_key: params.required("private_key")?,
            client_email: params.required("client_email")?,
            client_id: params.required("client_id")?,
            auth_uri: params.optional("auth_uri"),
            token_uri: params.required("token_uri")?,
            auth_provider_x509_cert_url: params.required("auth_provider_x509_cert_url")?,
            client_x509_cert_url: params.required("client_x509_cert_url")?,
        })),
        other => Err(Error::Configuration(format!(
            "invalid service account URI: unknown provider: {}",
            other.unwrap_or("")
        ))),
    }
}

fn encode(host: &str, pairs: &[(&str, &String)]) -> String {
    let mut out = format!("{}://{}?", SCHEME, host);
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter())
        .finish();
    out.push_str(&query);
    out
}

impl AzureServiceAccount {
    pub fn to_uri(&self) -> String {
        encode(
            "azure",
            &[
                ("tenant_id", &self.tenant_id),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("location", &self.location),
            ],
        )
    }
}

impl GcpServiceAccountKey {
    pub fn to_uri(&self) -> String {
        encode(
            "gcp",
            &[
                ("type", &self.key_type),
                ("project_id", &self.project_id),
                ("private_key_id", &self.private_key_id),
                ("private_key", &self.private_key),
                ("client_email", &self.client_email),
                ("client_id", &self.client_id),
                ("auth_uri", &self.auth_uri),
                ("token_uri", &self.token_uri),
                (
                    "auth_provider_x509_cert_url",
                    &self.auth_provider_x509_cert_url,
                ),
                ("client_x509_cert_url", &self.client_x509_cert_url),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GCP_URI: &str = "serviceaccount://gcp?type=type&project_id=project-id&private_key_id=private-key-id&private_key=private-key&client_email=client-email&client_id=client-id&auth_uri=auth-uri&token_uri=token-uri&auth_provider_x509_cert_url=auth-provider-x509-cert-url&client_x509_cert_url=client-x509-cert-url";

    fn gcp_key() -> GcpServiceAccountKey {
        GcpServiceAccountKey {
            key_type: "type".to_string(),
            project_id: "project-id".to_string(),
            private_key_id: "private-key-id".to_string(),
            private_key: "private-key".to_string(),
            client_email: "client-email".to_string(),
            client_id: "client-id".to_string(),
            auth_uri: "auth-uri".to_string(),
            token_uri: "token-uri".to_string(),
            auth_provider_x509_cert_url: "auth-provider-x509-cert-url".to_string(),
            client_x509_cert_url: "client-x509-cert-url".to_string(),
        }
    }

    #[test]
    fn test_parse_gcp() {
        assert_eq!(parse(GCP_URI).unwrap(), ServiceAccount::Gcp(gcp_key()));
    }

    #[test]
    fn test_gcp_missing_required_parameters() {
        for key in [
            "type",
            "project_id",
            "private_key_id",
            "private_key",
            "client_email",
            "client_id",
            "token_uri",
            "auth_provider_x509_cert_url",
            "client_x509_cert_url",
        ] {
            let uri: String = GCP_URI
                .split(['?', '&'])
                .filter(|part| !part.starts_with(&format!("{}=", key)))
                .enumerate()
                .map(|(i, part)| match i {
                    0 => part.to_string(),
                    1 => format!("?{}", part),
                    _ => format!("&{}", part),
                })
                .collect();
            let err = parse(&uri).unwrap_err();
            assert!(
                format!("{}", err).contains(key),
                "missing {} should fail, got {}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_gcp_auth_uri_optional() {
        let uri = GCP_URI.replace("&auth_uri=auth-uri", "");
        match parse(&uri).unwrap() {
            ServiceAccount::Gcp(key) => assert!(key.auth_uri.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_azure() {
        let uri = "serviceaccount://azure?tenant_id=t&client_id=c&client_secret=s&location=westeurope";
        let expected = AzureServiceAccount {
            tenant_id: "t".to_string(),
            client_id: "c".to_string(),
            client_secret: "s".to_string(),
            location: "westeurope".to_string(),
        };
        assert_eq!(parse(uri).unwrap(), ServiceAccount::Azure(expected));
        assert!(parse("serviceaccount://azure?tenant_id=t&client_id=c&location=l").is_err());
    }

    #[test]
    fn test_invalid_uris() {
        assert!(parse("\u{0}").is_err());
        assert!(parse("invalid").is_err());
        assert!(parse("invalid://gcp?type=x").is_err());
        assert!(parse("serviceaccount://aws?key=x").is_err());
        assert!(matches!(
            parse("invalid://gcp").unwrap_err(),
            Error::Configuration(_)
        ));
    }

    #[test]
    fn test_to_uri_is_parseable() {
        let key = gcp_key();
        assert_eq!(parse(&key.to_uri()).unwrap(), ServiceAccount::Gcp(key));

        let account = AzureServiceAccount {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: "a&b=c".to_string(),
            location: "eu".to_string(),
        };
        assert_eq!(
            parse(&account.to_uri()).unwrap(),
            ServiceAccount::Azure(account)
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let debug = format!("{:?}", gcp_key());
        assert!(!debug.contains("private-key\""));
        assert!(debug.contains("<redacted>"));
    }
}
