//! Provider configuration.
//!
//! Providers come from two places, merged once at startup into an immutable
//! [`Config`] that is passed explicitly everywhere:
//!
//! - `OPKSSH_PROVIDERS`: `alias,issuer,client-id,client-secret,scopes`
//!   entries separated by `;`, with `OPKSSH_DEFAULT` naming the default
//!   alias.
//! - `/etc/opk/providers`: one `<issuer> <client-id> <expiration>` row per
//!   line; the verify side uses it as the accepted-issuer list.

use std::path::Path;

use crate::{error::AuthError, fs::FileSystem};

pub const PROVIDERS_PATH: &str = "/etc/opk/providers";
pub const PROVIDERS_ENV: &str = "OPKSSH_PROVIDERS";
pub const DEFAULT_ALIAS_ENV: &str = "OPKSSH_DEFAULT";

/// Loopback redirect ports tried in order during login.
pub const CALLBACK_PORTS: &[u16] = &[3000, 10001, 11110];

/// Tolerance for `iat` on both sides of `now`, seconds.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 300;

pub const DEFAULT_SCOPES: &[&str] = &["openid", "profile", "email"];

/// How long an issued SSH certificate may outlive the ID token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Certificate expires with the ID token's `exp`.
    Oidc,
    /// Like `Oidc`, but the client may re-run the flow to refresh silently.
    OidcRefreshed,
    /// Fixed lifetime in hours.
    Hours(u64),
}

impl Expiration {
    pub fn parse(s: &str) -> Result<Self, AuthError> {
        match s {
            "oidc" => Ok(Expiration::Oidc),
            "oidc-refreshed" => Ok(Expiration::OidcRefreshed),
            "1week" => Ok(Expiration::Hours(168)),
            _ => s
                .strip_suffix('h')
                .and_then(|h| h.parse::<u64>().ok())
                .filter(|h| *h > 0)
                .map(Expiration::Hours)
                .ok_or_else(|| {
                    AuthError::Configuration(format!("invalid expiration policy {s:?}"))
                }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub alias: Option<String>,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
    pub expiration: Expiration,
}

impl ProviderConfig {
    /// Parse a `--provider` / `OPKSSH_PROVIDERS` entry.
    ///
    /// Fields are comma-separated: `[alias,]issuer,client-id[,client-secret[,scopes]]`
    /// with scopes space-separated inside the final field. The client-ID is
    /// validated before the issuer.
    pub fn parse(entry: &str, has_alias: bool) -> Result<Self, AuthError> {
        let parts: Vec<&str> = entry.split(',').map(str::trim).collect();
        let (alias, fields) = if has_alias {
            (parts.first().copied(), parts.get(1..).unwrap_or(&[]))
        } else {
            (None, &parts[..])
        };

        let issuer = fields.first().copied().unwrap_or("");
        let client_id = fields.get(1).copied().unwrap_or("");
        let client_secret = fields.get(2).copied().filter(|s| !s.is_empty());
        let scopes: Vec<String> = fields
            .get(3)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect());

        if client_id.is_empty() {
            return Err(AuthError::Configuration(format!(
                "invalid provider client-ID value got ({client_id})"
            )));
        }
        if !issuer.starts_with("https://") {
            return Err(AuthError::Configuration(
                "invalid provider issuer value. Expected issuer to start with 'https://'".into(),
            ));
        }
        if has_alias && alias.map_or(true, str::is_empty) {
            return Err(AuthError::Configuration(format!(
                "invalid provider alias value got ({})",
                alias.unwrap_or("")
            )));
        }

        Ok(Self {
            alias: alias.map(str::to_string),
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            scopes,
            expiration: Expiration::Oidc,
        })
    }

    /// Parse one `/etc/opk/providers` row: `<issuer> <client-id> <expiration>`.
    pub fn parse_file_row(row: &str) -> Result<Self, AuthError> {
        let fields: Vec<&str> = row.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(AuthError::Configuration(format!(
                "expected `<issuer> <client-id> <expiration>` got {} fields",
                fields.len()
            )));
        }
        let mut provider = Self::parse(&format!("{},{}", fields[0], fields[1]), false)?;
        provider.expiration = Expiration::parse(fields[2])?;
        Ok(provider)
    }
}

/// Outcome of provider selection for login.
pub enum ProviderSelection<'a> {
    Chosen(&'a ProviderConfig),
    /// No alias chose a provider; the caller presents these to the user.
    Choices(Vec<&'a str>),
}

/// Immutable process configuration, loaded once at entry.
#[derive(Debug, Clone)]
pub struct Config {
    pub providers: Vec<ProviderConfig>,
    pub default_alias: Option<String>,
    pub clock_skew_secs: i64,
}

impl Config {
    /// Load from the environment plus the system providers file, if present.
    pub fn load(fs: &dyn FileSystem) -> Result<Self, AuthError> {
        let mut providers = Vec::new();

        if let Ok(raw) = std::env::var(PROVIDERS_ENV) {
            for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
                providers.push(ProviderConfig::parse(entry, true)?);
            }
        }

        let path = Path::new(PROVIDERS_PATH);
        if fs.exists(path) {
            let raw = fs.read(path)?;
            let text = String::from_utf8_lossy(&raw);
            for (lineno, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let provider = ProviderConfig::parse_file_row(line).map_err(|e| {
                    AuthError::Configuration(format!("{PROVIDERS_PATH}:{}: {e}", lineno + 1))
                })?;
                providers.push(provider);
            }
        }

        Ok(Self {
            providers,
            default_alias: std::env::var(DEFAULT_ALIAS_ENV).ok(),
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        })
    }

    pub fn from_providers(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers,
            default_alias: None,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        }
    }

    /// Issuer comparison tolerates one trailing slash either side.
    pub fn find_issuer(&self, issuer: &str) -> Option<&ProviderConfig> {
        let wanted = issuer.trim_end_matches('/');
        self.providers
            .iter()
            .find(|p| p.issuer.trim_end_matches('/') == wanted)
    }

    pub fn issuer_allowed(&self, issuer: &str) -> bool {
        self.find_issuer(issuer).is_some()
    }

    /// Pick a provider by explicit alias, the configured default, or, when
    /// exactly one is configured, that one. Otherwise return the alias list.
    pub fn select(&self, alias: Option<&str>) -> Result<ProviderSelection<'_>, AuthError> {
        if let Some(alias) = alias.or(self.default_alias.as_deref()) {
            return self
                .providers
                .iter()
                .find(|p| p.alias.as_deref() == Some(alias))
                .map(ProviderSelection::Chosen)
                .ok_or_else(|| {
                    AuthError::Configuration(format!("no provider with alias {alias:?}"))
                });
        }
        match self.providers.len() {
            0 => Err(AuthError::Configuration("no providers configured".into())),
            1 => Ok(ProviderSelection::Chosen(&self.providers[0])),
            _ => Ok(ProviderSelection::Choices(
                self.providers
                    .iter()
                    .filter_map(|p| p.alias.as_deref())
                    .collect(),
            )),
        }
    }
}
