//! Parsing of the storage connection string.
//!
//! The string is a `;`-separated list of `Key=Value` pairs, in the style of an Azure storage
//! connection string, but describing an S3 or S3-compatible endpoint:
//!
//! ```text
//! Endpoint=http://localhost:9000;Region=us-east-1;AccessKeyId=minioadmin;SecretAccessKey=minioadmin
//! ```
use crate::Result;
use snafu::prelude::*;
use std::str::FromStr;
use url::Url;

#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: Option<Url>,
    pub region: Option<String>,
    pub credentials: Option<StaticCredentials>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl FromStr for ConnectionString {
    type Err = crate::BulkLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(
            !s.trim().is_empty(),
            crate::error::MissingConnectionStringSnafu
        );

        let mut endpoint = None;
        let mut region = None;
        let mut access_key_id = None;
        let mut secret_access_key = None;
        let mut session_token = None;

        // A trailing `;` is common in copy-pasted connection strings, so empty segments are skipped
        for segment in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment
                .split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| {
                    crate::error::MalformedConnectionStringSnafu {
                        segment: redact(segment),
                    }
                    .build()
                })?;

            let slot = match key.to_ascii_lowercase().as_str() {
                "endpoint" => &mut endpoint,
                "region" => &mut region,
                "accesskeyid" => &mut access_key_id,
                "secretaccesskey" => &mut secret_access_key,
                "sessiontoken" => &mut session_token,
                _ => {
                    return crate::error::UnknownConnectionStringKeySnafu { key }.fail();
                }
            };

            ensure!(
                slot.is_none(),
                crate::error::DuplicateConnectionStringKeySnafu { key }
            );
            *slot = Some(value.to_string());
        }

        let endpoint = endpoint
            .map(|endpoint| -> Result<Url> {
                let url = Url::parse(&endpoint)
                    .with_context(|_| crate::error::InvalidEndpointSnafu {
                        endpoint: endpoint.clone(),
                    })?;

                ensure!(
                    matches!(url.scheme(), "http" | "https"),
                    crate::error::UnsupportedEndpointSchemeSnafu { url: url.clone() }
                );

                Ok(url)
            })
            .transpose()?;

        let credentials = match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(StaticCredentials {
                access_key_id,
                secret_access_key,
                session_token,
            }),
            (None, None) => None,
            _ => return crate::error::IncompleteConnectionStringCredentialsSnafu.fail(),
        };

        Ok(Self {
            endpoint,
            region,
            credentials,
        })
    }
}

/// Segments end up in error messages, so never echo back what might be a secret value
fn redact(segment: &str) -> String {
    if segment.chars().count() > 12 {
        format!("{}...", segment.chars().take(12).collect::<String>())
    } else {
        segment.to_string()
    }
}

// Hand-written so secrets never show up in log output
impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
