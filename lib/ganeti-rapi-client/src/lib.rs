// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A client for the Ganeti remote API (RAPI), version 2.
//!
//! [`Client`] speaks the HTTP resources directly; [`RapiGateway`] adapts it
//! to the reconciliation engine's [`ganeti_reconciler::Gateway`] trait.

use std::fmt;
use std::time::Duration;

use ganeti_reconciler::JobId;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use slog::{debug, Logger};
use thiserror::Error;

mod gateway;
pub mod types;

pub use gateway::RapiGateway;

use types::{
    CreateInstanceRequest, ErrorBody, GroupInfo, GrowDiskRequest, InstanceInfo,
    JobInfo, ModifyInstanceRequest, RenameInstanceRequest, WireJobId,
};

pub const DEFAULT_PORT: u16 = 5080;

/// A password that never shows up in `Debug` output or logs.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    /// `https` or `http`.
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<Secret>,
    /// Accept any server certificate. RAPI daemons commonly run with a
    /// self-signed one.
    pub insecure: bool,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_PORT,
            scheme: "https".to_string(),
            user: None,
            password: None,
            insecure: false,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum RapiError {
    #[error("building HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The request never produced a response.
    #[error("{base}: {source}")]
    Request {
        base: String,
        #[source]
        source: reqwest::Error,
    },

    /// The daemon answered with a non-success status.
    #[error("{base}: {status}: {message}")]
    Status { base: String, status: StatusCode, message: String },

    #[error("{base}: parsing response: {message}")]
    Parse { base: String, message: String },
}

impl RapiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RapiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub struct Client {
    baseurl: String,
    client: reqwest::Client,
    credentials: Option<(String, Secret)>,
    log: Logger,
}

impl Client {
    pub fn new(
        config: &ClientConfig,
        log: Logger,
    ) -> Result<Client, RapiError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;
        let baseurl =
            format!("{}://{}:{}", config.scheme, config.address, config.port);
        let credentials = config.user.clone().map(|user| {
            let password =
                config.password.clone().unwrap_or_else(|| Secret::new(""));
            (user, password)
        });
        Ok(Client { baseurl, client, credentials, log })
    }

    pub fn baseurl(&self) -> &str {
        &self.baseurl
    }

    /// Returns a prefix for error messages about a request.
    fn error_message_base(&self, method: &Method, path: &str) -> String {
        format!("RAPI request to {} ({} {})", self.baseurl, method, path)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, RapiError> {
        let base = self.error_message_base(&method, path);
        debug!(self.log, "client request"; "method" => %method, "path" => path);

        let url = format!("{}{}", self.baseurl, path);
        let mut req = self.client.request(method, url);
        if let Some((user, password)) = &self.credentials {
            req = req.basic_auth(user, Some(password.expose()));
        }
        let res = build(req).send().await.map_err(|source| {
            RapiError::Request { base: base.clone(), source }
        })?;

        let status = res.status();
        debug!(self.log, "client response"; "status" => %status);
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(res);
        }

        let text = res.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody { message: Some(message), explain: Some(explain) })
                if !explain.is_empty() =>
            {
                format!("{message} ({explain})")
            }
            Ok(ErrorBody { message: Some(message), .. }) => message,
            _ => text.trim().to_string(),
        };
        Err(RapiError::Status { base, status, message })
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        method: &Method,
        path: &str,
        res: Response,
    ) -> Result<T, RapiError> {
        if res.status() == StatusCode::NOT_FOUND {
            return Err(RapiError::Status {
                base: self.error_message_base(method, path),
                status: StatusCode::NOT_FOUND,
                message: "not found".to_string(),
            });
        }
        res.json::<T>().await.map_err(|e| RapiError::Parse {
            base: self.error_message_base(method, path),
            message: e.to_string(),
        })
    }

    async fn submit(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<JobId, RapiError> {
        let res = self.send(method.clone(), path, build).await?;
        let id: WireJobId = self.read_json(&method, path, res).await?;
        Ok(id.into())
    }

    /// GET /2/instances/{name}
    ///
    /// Returns `None` when the cluster does not know the instance.
    pub async fn get_instance(
        &self,
        name: &str,
    ) -> Result<Option<InstanceInfo>, RapiError> {
        let path = format!("/2/instances/{name}");
        let res = self.send(Method::GET, &path, |req| req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.read_json(&Method::GET, &path, res).await.map(Some)
    }

    /// POST /2/instances
    pub async fn create_instance(
        &self,
        body: &CreateInstanceRequest,
    ) -> Result<JobId, RapiError> {
        self.submit(Method::POST, "/2/instances", |req| req.json(body)).await
    }

    /// DELETE /2/instances/{name}
    pub async fn delete_instance(
        &self,
        name: &str,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}");
        self.submit(Method::DELETE, &path, |req| req).await
    }

    /// PUT /2/instances/{name}/startup
    pub async fn startup_instance(
        &self,
        name: &str,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/startup");
        self.submit(Method::PUT, &path, |req| req).await
    }

    /// PUT /2/instances/{name}/shutdown
    pub async fn shutdown_instance(
        &self,
        name: &str,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/shutdown");
        self.submit(Method::PUT, &path, |req| req).await
    }

    /// PUT /2/instances/{name}/migrate
    pub async fn migrate_instance(
        &self,
        name: &str,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/migrate");
        self.submit(Method::PUT, &path, |req| {
            req.json(&serde_json::json!({}))
        })
        .await
    }

    /// PUT /2/instances/{name}/rename
    pub async fn rename_instance(
        &self,
        name: &str,
        body: &RenameInstanceRequest,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/rename");
        self.submit(Method::PUT, &path, |req| req.json(body)).await
    }

    /// PUT /2/instances/{name}/modify
    pub async fn modify_instance(
        &self,
        name: &str,
        body: &ModifyInstanceRequest,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/modify");
        self.submit(Method::PUT, &path, |req| req.json(body)).await
    }

    /// POST /2/instances/{name}/disk/{index}/grow
    pub async fn grow_disk(
        &self,
        name: &str,
        index: usize,
        body: &GrowDiskRequest,
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/disk/{index}/grow");
        self.submit(Method::POST, &path, |req| req.json(body)).await
    }

    /// PUT /2/instances/{name}/tags
    pub async fn add_tags(
        &self,
        name: &str,
        tags: &[String],
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/tags");
        let query: Vec<(&str, &str)> =
            tags.iter().map(|t| ("tag", t.as_str())).collect();
        self.submit(Method::PUT, &path, |req| req.query(&query)).await
    }

    /// DELETE /2/instances/{name}/tags
    pub async fn delete_tags(
        &self,
        name: &str,
        tags: &[String],
    ) -> Result<JobId, RapiError> {
        let path = format!("/2/instances/{name}/tags");
        let query: Vec<(&str, &str)> =
            tags.iter().map(|t| ("tag", t.as_str())).collect();
        self.submit(Method::DELETE, &path, |req| req.query(&query)).await
    }

    /// GET /2/jobs/{id}
    pub async fn get_job(&self, id: &JobId) -> Result<JobInfo, RapiError> {
        let path = format!("/2/jobs/{id}");
        let res = self.send(Method::GET, &path, |req| req).await?;
        self.read_json(&Method::GET, &path, res).await
    }

    /// GET /2/groups?bulk=1
    pub async fn get_groups(&self) -> Result<Vec<GroupInfo>, RapiError> {
        let path = "/2/groups";
        let res = self
            .send(Method::GET, path, |req| req.query(&[("bulk", "1")]))
            .await?;
        self.read_json(&Method::GET, path, res).await
    }
}
