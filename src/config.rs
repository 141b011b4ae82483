use std::{fmt::Debug, fs, path::Path, time::Duration};

use chrono::TimeDelta;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use url::Url;

use crate::prelude::*;

/// Which of the two device APIs to talk to.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Legacy `/cgi-bin` XML API behind HTTP digest authentication.
    #[display("xml")]
    Xml,

    /// `/api` JSON API behind bearer tokens.
    #[display("json")]
    Json,
}

/// Connection settings.
///
/// ```toml
/// url = "https://egauge12345.local"
/// protocol = "json"
/// username = "owner"
/// password = "secret"
///
/// [name_overrides]
/// solar = "Solar+"
/// ```
#[serde_as]
#[derive(Clone, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Device base URL.
    pub url: Url,

    pub protocol: Protocol,

    #[builder(into)]
    pub username: Option<String>,

    #[builder(into)]
    pub password: Option<String>,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_timeout")]
    #[builder(default = Config::default_timeout())]
    pub timeout: Duration,

    /// eGauge devices ship with self-signed certificates.
    #[serde(default = "Config::default_accept_invalid_certs")]
    #[builder(default = Config::default_accept_invalid_certs())]
    pub accept_invalid_certs: bool,

    /// How long before its expiry a bearer token gets replaced.
    #[serde_as(as = "DurationSeconds<i64>")]
    #[serde(default = "Config::default_token_refresh_margin")]
    #[builder(default = Config::default_token_refresh_margin())]
    pub token_refresh_margin: TimeDelta,

    /// Instantaneous register names by historical name, in addition to the discovered pairs.
    #[serde(default)]
    #[builder(default)]
    pub name_overrides: IndexMap<String, String>,
}

impl Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url.as_str())
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "…"))
            .field("timeout", &self.timeout)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("token_refresh_margin", &self.token_refresh_margin)
            .field("name_overrides", &self.name_overrides)
            .finish()
    }
}

impl Config {
    const fn default_timeout() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_accept_invalid_certs() -> bool {
        true
    }

    const fn default_token_refresh_margin() -> TimeDelta {
        TimeDelta::seconds(60)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let this: Self = toml::from_str(text)
            .map_err(|error| Error::Config(format!("failed to parse the configuration: {error}")))?;
        this.validate()?;
        Ok(this)
    }

    #[instrument(skip_all, fields(path = ?path))]
    pub fn read_from<P: AsRef<Path> + Debug>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path).map_err(|error| {
            Error::Config(format!("failed to read `{}`: {error}", path.as_ref().display()))
        })?;
        Self::from_toml(&text)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result {
        if !matches!(self.url.scheme(), "http" | "https") || !self.url.has_host() {
            return Err(Error::Config(format!("`{}` is not an HTTP(S) URL", self.url)));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Config("username and password go together".into()));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("the timeout must be positive".into()));
        }
        if !(TimeDelta::seconds(1)..TimeDelta::seconds(600)).contains(&self.token_refresh_margin) {
            return Err(Error::Config(format!(
                "the token refresh margin must be within 1..600 seconds, got {}",
                self.token_refresh_margin,
            )));
        }
        if let Some((historical, instantaneous)) = self
            .name_overrides
            .iter()
            .find(|(historical, instantaneous)| historical.is_empty() || instantaneous.is_empty())
        {
            return Err(Error::Config(format!(
                "empty register name in the override `{historical}` = `{instantaneous}`"
            )));
        }
        Ok(())
    }

    /// Device URL with a trailing slash so that endpoint paths join onto it.
    #[must_use]
    pub fn base_url(&self) -> Url {
        let mut url = self.url.clone();
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);
        url
    }

    /// Username and password, if both are set.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username.as_deref().zip(self.password.as_deref())
    }
}
