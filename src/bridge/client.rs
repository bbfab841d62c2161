//! Client side of the Bridge: `Helper::request` builds an envelope and POSTs
//! it to `${remote}/module/<name>/` (spec §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::KiwiError;

/// The RPC envelope: `{ method, url, params, headers, data }` (spec §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "serde_bytes_as_string")]
    pub data: Vec<u8>,
}

/// The framework's native response object, serialized identically (spec
/// §6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "serde_bytes_as_string")]
    pub body: Vec<u8>,
}

mod serde_bytes_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}

/// POST the envelope to the server's module endpoint and decode the
/// response back into the same shape (spec §4.5 client side). TLS
/// verification uses the configured CA chain when enabled.
pub async fn send(config: &Arc<Config>, module_name: &str, req: RpcRequest) -> anyhow::Result<RpcResponse> {
    let base_url = config.get_str("remote.base_url").unwrap_or_default();
    let target = format!("{}/module/{}/", base_url.trim_end_matches('/'), module_name);

    let client = build_client(config)?;
    let resp = client
        .post(&target)
        .json(&req)
        .send()
        .await
        .map_err(|e| KiwiError::RpcTransport(e.to_string()))
        .with_context(|| format!("sending RPC to {}", target))?;

    let status = resp.status();
    if status.is_server_error() {
        return Err(KiwiError::RpcApplication(status.as_u16()).into());
    }

    resp.json::<RpcResponse>()
        .await
        .map_err(|e| KiwiError::RpcTransport(e.to_string()).into())
}

fn build_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if config.get_bool("server.api.tls.enabled").unwrap_or(false) {
        if let Some(ca_path) = config.get_path_buf("server.api.tls.ca_chain") {
            if ca_path.is_file() {
                let pem = std::fs::read(&ca_path)?;
                let cert = reqwest::Certificate::from_pem(&pem)?;
                builder = builder.add_root_certificate(cert);
            }
        }
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let req = RpcRequest {
            method: "GET".to_owned(),
            url: "/".to_owned(),
            params: [("name".to_owned(), "Ada".to_owned())].into_iter().collect(),
            headers: Default::default(),
            data: Vec::new(),
        };
        let text = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(req.method, back.method);
        assert_eq!(req.params.get("name"), back.params.get("name"));
    }
}
