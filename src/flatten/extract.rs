//! String value extractors.
//!
//! An extractor turns a string leaf into a JSON document that the walker
//! reinjects under `.<name>` at the leaf's path. The set is a fixed
//! capability registry: each variant is a name plus a decode function, and
//! the walker only consults the function when a key's cached extractor is
//! present.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{KilnError, Result};

/// Name of an extractable format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extract {
    Url,
    Json,
    GeoIp,
    NetIp,
}

impl Extract {
    pub fn name(self) -> &'static str {
        match self {
            Extract::Url => "URL",
            Extract::Json => "JSON",
            Extract::GeoIp => "GEOIP",
            Extract::NetIp => "NETIP",
        }
    }

    /// Resolve a configured extractor name.
    ///
    /// `GEOIP` and `NETIP` are recognized names but need loaded IP lookup
    /// databases, which this build does not ship; configuring them fails.
    pub fn from_name(name: &str) -> Result<Extract> {
        match name {
            "URL" => Ok(Extract::Url),
            "JSON" => Ok(Extract::Json),
            "GEOIP" | "NETIP" => Err(KilnError::Config(format!(
                "extractor {} requires loaded IP lookup databases",
                name
            ))),
            other => Err(KilnError::Config(format!("unknown extractor name: {}", other))),
        }
    }

    /// Decode a string value into JSON bytes to reinject.
    ///
    /// Failure is not an error condition for the pipeline; the caller keeps
    /// the leaf as a plain string.
    pub fn extract(self, s: &[u8]) -> Option<Vec<u8>> {
        match self {
            Extract::Url => decode_url(std::str::from_utf8(s).ok()?),
            Extract::Json => Some(s.to_vec()),
            Extract::GeoIp | Extract::NetIp => None,
        }
    }
}

impl fmt::Display for Extract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// JSON shape of a decoded URL.
#[derive(Debug, Default, Serialize)]
struct DecodedUrl {
    scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pass: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    host: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    port: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    path: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    query: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    fragment: String,
}

fn decode_url(s: &str) -> Option<Vec<u8>> {
    if !s.contains("://") {
        return None;
    }

    let u = url::Url::parse(s).ok()?;

    let mut decoded = DecodedUrl {
        scheme: u.scheme().to_string(),
        user: u.username().to_string(),
        pass: u.password().unwrap_or_default().to_string(),
        host: u.host_str().unwrap_or_default().to_string(),
        port: u.port().map(|p| p.to_string()).unwrap_or_default(),
        fragment: u.fragment().unwrap_or_default().to_string(),
        ..DecodedUrl::default()
    };

    let trimmed = u.path().trim_matches('/');
    if !trimmed.is_empty() {
        decoded.path = trimmed.split('/').map(str::to_string).collect();
    }

    for (k, v) in u.query_pairs() {
        decoded.query.entry(k.into_owned()).or_default().push(v.into_owned());
    }

    serde_json::to_vec(&decoded).ok()
}
