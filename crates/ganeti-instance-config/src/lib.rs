// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::time::Duration;

use ganeti_rapi_client::{ClientConfig, Secret, DEFAULT_PORT};
use ganeti_reconciler::{Options, RawInstanceRequest};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the environment variable holding the RAPI password unless the
/// invocation names another one.
pub const DEFAULT_PASSWORD_ENV: &str = "GANETI_RAPI_PASSWORD";

/// One invocation of the reconciler: where the cluster is, how to run the
/// pass, and the instance as it should be.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,

    #[serde(default)]
    pub options: Options,

    #[serde(default)]
    pub instance: RawInstanceRequest,
}

/// How to reach the RAPI daemon.
///
/// The password is deliberately not part of the file; it is read from the
/// environment variable named by `password_env`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Connection {
    pub address: String,
    pub port: u16,
    pub scheme: String,
    pub user: Option<String>,
    pub password_env: String,
    pub insecure: bool,

    /// Seconds before a single HTTP request is abandoned.
    pub request_timeout: u64,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_PORT,
            scheme: "https".to_string(),
            user: None,
            password_env: DEFAULT_PASSWORD_ENV.to_string(),
            insecure: false,
            request_timeout: 60,
        }
    }
}

impl Connection {
    pub fn client_config(&self, password: Option<Secret>) -> ClientConfig {
        ClientConfig {
            address: self.address.clone(),
            port: self.port,
            scheme: self.scheme.clone(),
            user: self.user.clone(),
            password,
            insecure: self.insecure,
            timeout: Duration::from_secs(self.request_timeout),
        }
    }
}

/// Errors which may be returned when parsing an invocation file.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported scheme {0:?}, expected \"http\" or \"https\"")]
    Scheme(String),
}

/// Parses a TOML file into an invocation.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<Config, ParseError> {
    let cfg = toml::from_str::<Config>(contents)?;
    match cfg.connection.scheme.as_str() {
        "http" | "https" => Ok(cfg),
        other => Err(ParseError::Scheme(other.to_string())),
    }
}
