use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("control: request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control: server rejected allocation ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("control: invalid control host {0:?}")]
    InvalidHost(String),
}

/// Body of a successful allocation answer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResponse {
    pub id: String,
    #[serde(default)]
    pub ip: Option<String>,
    pub port: u16,
    pub url: String,
    #[serde(default)]
    pub cached_url: Option<String>,
    #[serde(default)]
    pub max_conn_count: Option<usize>,
    #[serde(default)]
    pub shared_tunnel: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// Everything a session needs to open links after a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: String,
    pub url: String,
    pub cached_url: Option<String>,
    pub remote_host: String,
    pub remote_ip: Option<String>,
    pub remote_port: u16,
    pub max_conn: usize,
    pub shared_tunnel: bool,
}

impl TunnelInfo {
    /// Address links dial: the advertised ip when there is one, the control host otherwise.
    pub fn remote_addr(&self) -> (String, u16) {
        let host = self
            .remote_ip
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.remote_host);
        (host.to_string(), self.remote_port)
    }
}

/// `GET {host}/{subdomain}` or `GET {host}/?new`.
pub fn allocation_url(control_host: &str, subdomain: Option<&str>) -> String {
    let base = control_host.trim_end_matches('/');
    match subdomain.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sub) => format!("{base}/{sub}"),
        None => format!("{base}/?new"),
    }
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    host: String,
    remote_host: String,
    headers: BTreeMap<String, String>,
}

impl ControlClient {
    pub fn new(host: &str, headers: BTreeMap<String, String>) -> Result<Self, AllocationError> {
        let parsed =
            url::Url::parse(host).map_err(|_| AllocationError::InvalidHost(host.to_string()))?;
        let remote_host = parsed
            .host_str()
            .ok_or_else(|| AllocationError::InvalidHost(host.to_string()))?
            .to_string();
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            host: host.to_string(),
            remote_host,
            headers,
        })
    }

    /// One allocation attempt; retrying is the caller's business.
    pub async fn allocate(&self, subdomain: Option<&str>) -> Result<TunnelInfo, AllocationError> {
        let uri = allocation_url(&self.host, subdomain);
        let mut req = self.http.get(&uri);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let res = req.send().await?;
        let status = res.status();
        if status != reqwest::StatusCode::OK {
            let body = res.bytes().await.unwrap_or_default();
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .unwrap_or_else(|| "server returned an error, please try again".to_string());
            return Err(AllocationError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: AllocationResponse = res.json().await?;
        tracing::debug!(id = %body.id, port = body.port, url = %body.url, "control: got tunnel information");
        Ok(self.info_from(body))
    }

    fn info_from(&self, body: AllocationResponse) -> TunnelInfo {
        TunnelInfo {
            id: body.id,
            url: body.url,
            cached_url: body.cached_url,
            remote_host: self.remote_host.clone(),
            remote_ip: body.ip,
            remote_port: body.port,
            max_conn: body.max_conn_count.filter(|n| *n > 0).unwrap_or(1),
            shared_tunnel: body.shared_tunnel.unwrap_or(false),
        }
    }
}
