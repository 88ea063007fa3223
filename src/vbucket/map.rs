//! serde model of the bucket-streaming configuration document.
//!
//! Only the `vBucketServerMap` sub-tree plus the bucket name and SASL
//! password are consumed; everything else in the document is ignored.

use super::VbucketConfig;
use crate::error::ConfigError;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct BucketDocument {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "saslPassword")]
    sasl_password: Option<String>,
    #[serde(rename = "vBucketServerMap")]
    server_map: ServerMap,
}

#[derive(Debug, Deserialize)]
struct ServerMap {
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

/// Parse one JSON document into a [`VbucketConfig`].
pub(crate) fn parse_document(doc: &[u8]) -> Result<VbucketConfig, ConfigError> {
    let document: BucketDocument =
        serde_json::from_slice(doc).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    // A bucket with a SASL password authenticates with the bucket name
    // as the username.
    let credentials = match (document.name, document.sasl_password) {
        (Some(name), Some(password)) if !password.is_empty() => Some((name, password)),
        _ => None,
    };

    VbucketConfig::new(
        document.server_map.server_list,
        document.server_map.vbucket_map,
        credentials,
    )
}
