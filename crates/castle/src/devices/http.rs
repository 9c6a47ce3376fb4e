//! HTTP JSON device
//!
//! Status is read with a GET of `api`; every datapoint is located in the
//! returned document by a JSON pointer (default `/<id>`). Control requests are
//! POSTed as one JSON object of `id → value`.

use std::collections::HashMap;
use std::time::Duration;

use castle_types::{
    Datapoint, DatapointState, DeviceControlResponse, DeviceStatus, now_ms,
};
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, Uri};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DeviceError, state_from_json, state_to_json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpSettings {
    /// JSON pointer per private datapoint id
    #[serde(default)]
    pub pointers: HashMap<String, String>,
    /// Where control requests go; `api` when absent
    #[serde(default)]
    pub control_url: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

pub struct HttpJsonDevice {
    url: Uri,
    control_url: Uri,
    pointers: HashMap<String, String>,
    timeout: Duration,
    schema: Vec<Datapoint>,
    client: Client<HttpConnector>,
}

fn parse_uri(device: &str, url: &str) -> Result<Uri, DeviceError> {
    url.parse().map_err(|e| DeviceError::Settings {
        device: device.to_string(),
        message: format!("invalid url '{url}': {e}"),
    })
}

impl HttpJsonDevice {
    pub fn new(
        device: &str,
        api: &str,
        settings: HttpSettings,
        schema: Vec<Datapoint>,
    ) -> Result<Self, DeviceError> {
        let url = parse_uri(device, api)?;
        let control_url = match &settings.control_url {
            Some(control) => parse_uri(device, control)?,
            None => url.clone(),
        };
        Ok(Self {
            url,
            control_url,
            pointers: settings.pointers,
            timeout: Duration::from_millis(settings.timeout_ms),
            schema,
            client: Client::new(),
        })
    }

    fn pointer(&self, id: &str) -> String {
        self.pointers
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("/{id}"))
    }

    /// States of all schema datapoints found in `document`
    pub fn read_document(
        &self,
        document: &serde_json::Value,
        at: i64,
    ) -> HashMap<String, DatapointState> {
        self.schema
            .iter()
            .filter_map(|dp| {
                let value = document.pointer(&self.pointer(&dp.id))?;
                state_from_json(&dp.id, dp.value_type, at, value).map(|s| (dp.id.clone(), s))
            })
            .collect()
    }

    async fn send(&self, request: Request<Body>) -> Result<hyper::body::Bytes, DeviceError> {
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| DeviceError::Request(e.to_string()))?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| DeviceError::Request(e.to_string()))?;
            if !status.is_success() {
                return Err(DeviceError::Response(format!("HTTP {status}")));
            }
            Ok(body)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                DeviceError::Request(format!("timed out after {}ms", self.timeout.as_millis()))
            })?
    }

    async fn fetch_document(&self) -> Result<serde_json::Value, DeviceError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.url.clone())
            .body(Body::empty())
            .map_err(|e| DeviceError::Request(e.to_string()))?;
        let body = self.send(request).await?;
        serde_json::from_slice(&body).map_err(|e| DeviceError::Response(e.to_string()))
    }

    pub async fn fetch(&self) -> DeviceStatus {
        match self.fetch_document().await {
            Ok(document) => DeviceStatus::responsive(self.read_document(&document, now_ms())),
            Err(e) => {
                debug!(url = %self.url, error = %e, "HTTP device unresponsive");
                DeviceStatus::unresponsive(e.to_string())
            }
        }
    }

    pub async fn execute(&self, targets: &[(Datapoint, DatapointState)]) -> DeviceControlResponse {
        let mut body = serde_json::Map::new();
        for (dp, state) in targets {
            match state_to_json(dp.value_type, state) {
                Some(value) => {
                    body.insert(dp.id.clone(), value);
                }
                None => {
                    return DeviceControlResponse::failed(format!(
                        "no {} value for {}",
                        dp.value_type, dp.id
                    ));
                }
            }
        }

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.control_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::Value::Object(body).to_string()));
        let request = match request {
            Ok(request) => request,
            Err(e) => return DeviceControlResponse::failed(e.to_string()),
        };
        match self.send(request).await {
            Ok(_) => DeviceControlResponse::ok(),
            Err(e) => DeviceControlResponse::failed(e.to_string()),
        }
    }
}
