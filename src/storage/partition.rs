//! Partition key derivation.
//!
//! A key is a pure function of a `FetchSpec`: source identity (the remote
//! method), a monthly date bucket, a readable entity label and a short
//! signature over the normalised parameters. On disk it becomes
//! `<source>/<bucket>/<label>-<signature>/`.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::types::{FetchSpec, ParamValue, RecordIdentity};

/// Hex characters of the parameter digest kept in the directory name.
const SIGNATURE_LEN: usize = 16;

/// Bucket / label used when the spec carries no such parameter.
const UNBUCKETED: &str = "all";

/// Label used for multi-entity requests.
const MULTI_ENTITY: &str = "multi";

/// Location of one cached result set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    source: String,
    bucket: String,
    label: String,
    signature: String,
    identity: RecordIdentity,
    params: BTreeMap<String, String>,
}

impl PartitionKey {
    /// Derive the key for a fetch spec. Unset parameters were already
    /// dropped by normalisation, so they never affect the result.
    pub fn for_spec(spec: &FetchSpec) -> Self {
        let params: BTreeMap<String, String> = spec
            .params()
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();

        let bucket = spec
            .partition
            .bucket_param
            .as_deref()
            .and_then(|name| spec.param(name))
            .and_then(ParamValue::as_date)
            .map(|d| d.format("%Y-%m").to_string())
            .unwrap_or_else(|| UNBUCKETED.to_string());

        let label = spec
            .partition
            .label_param
            .as_deref()
            .and_then(|name| spec.param(name))
            .map(|value| match value {
                ParamValue::List(items) if items.len() == 1 => sanitize(&items[0]),
                ParamValue::List(_) => MULTI_ENTITY.to_string(),
                other => sanitize(&other.to_string()),
            })
            .unwrap_or_else(|| UNBUCKETED.to_string());

        Self {
            source: sanitize(&spec.method),
            bucket,
            label,
            signature: signature(&spec.method, &params, spec.fetch_all),
            identity: spec.identity.clone(),
            params,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn identity(&self) -> &RecordIdentity {
        &self.identity
    }

    /// Normalised parameters rendered as strings, recorded in metadata.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// Directory of this partition relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.source)
            .join(&self.bucket)
            .join(format!("{}-{}", self.label, self.signature))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}-{}",
            self.source, self.bucket, self.label, self.signature
        )
    }
}

fn signature(method: &str, params: &BTreeMap<String, String>, fetch_all: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    for (name, value) in params {
        hasher.update(b"\x1f");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    if !fetch_all {
        hasher.update(b"\x1ffirst_page_only");
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(SIGNATURE_LEN);
    digest
}

/// Keep path-safe characters only.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}
