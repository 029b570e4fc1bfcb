//! Settings validation for the authority host and tenant
//!
//! Everything that ends up in an authorize or token URL goes through here
//! first; callers build URLs from [`NormalizedAuthority`], never from the raw
//! settings strings.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::config::{Settings, DEFAULT_AUTHORITY_HOST};

/// Login endpoints of the public and sovereign Microsoft clouds.
pub const KNOWN_AUTHORITY_HOSTS: &[&str] = &[
    "login.microsoftonline.com",
    "login.microsoftonline.us",
    "login.chinacloudapi.cn",
    "login.microsoftonline.de",
    "login.partner.microsoftonline.cn",
];

/// Tenant literals accepted by the identity platform.
pub const RESERVED_TENANTS: &[&str] = &["organizations", "common", "consumers"];

const TENANT_ALIASES: &[(&str, &str)] = &[
    ("organisation", "organizations"),
    ("organisations", "organizations"),
    ("consumer", "consumers"),
];

const UNKNOWN_HOST_WARNING: &str = "Authority host is not a known Microsoft login endpoint.";

/// A settings value that blocks token acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsIssue {
    #[error("Authority host is required.")]
    MissingAuthorityHost,
    #[error("Authority host must be a valid URL (https://...).")]
    AuthorityNotUrl,
    #[error("Authority host must use https://.")]
    AuthorityScheme,
    #[error("Authority host must not include credentials.")]
    AuthorityCredentials,
    #[error("Authority host must not include query or hash.")]
    AuthorityQuery,
    #[error("Authority host must not include a path.")]
    AuthorityPath,
    #[error("Tenant is required.")]
    MissingTenant,
    #[error("Tenant must be a GUID, domain, or one of: organizations, common, consumers.")]
    InvalidTenant,
}

/// Authority host in its canonical `https://host[:port]` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorityHost {
    pub normalized: String,
    /// Set when the host is not one of [`KNOWN_AUTHORITY_HOSTS`].
    pub warning: Option<String>,
}

/// Values every downstream URL must be built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedAuthority {
    pub authority_host: String,
    pub tenant: String,
}

impl NormalizedAuthority {
    /// `{authority_host}/{tenant}`, the base of both OAuth endpoints.
    pub fn authority(&self) -> String {
        format!("{}/{}", self.authority_host, self.tenant)
    }
}

/// Outcome of [`validate_settings`].
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<SettingsIssue>,
    pub warnings: Vec<String>,
    pub normalized: NormalizedAuthority,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn normalize_authority_host(value: &str) -> Result<AuthorityHost, SettingsIssue> {
    let raw = value.trim();
    if raw.is_empty() {
        return Err(SettingsIssue::MissingAuthorityHost);
    }

    let url = Url::parse(raw).map_err(|_| SettingsIssue::AuthorityNotUrl)?;
    if url.scheme() != "https" {
        return Err(SettingsIssue::AuthorityScheme);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(SettingsIssue::AuthorityCredentials);
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(SettingsIssue::AuthorityQuery);
    }
    if !matches!(url.path(), "" | "/") {
        return Err(SettingsIssue::AuthorityPath);
    }

    let host = url.host_str().ok_or(SettingsIssue::AuthorityNotUrl)?;
    let normalized = match url.port() {
        Some(port) => format!("https://{}:{}", host, port),
        None => format!("https://{}", host),
    };
    let warning = (!KNOWN_AUTHORITY_HOSTS.contains(&host)).then(|| UNKNOWN_HOST_WARNING.to_string());

    Ok(AuthorityHost {
        normalized,
        warning,
    })
}

pub fn normalize_tenant(value: &str) -> Result<String, SettingsIssue> {
    let mut tenant = value.trim();
    if tenant.is_empty() {
        return Err(SettingsIssue::MissingTenant);
    }
    if let Some((_, canonical)) = TENANT_ALIASES.iter().find(|(alias, _)| *alias == tenant) {
        tenant = *canonical;
    }

    if RESERVED_TENANTS.contains(&tenant) || guid_pattern().is_match(tenant) || domain_pattern().is_match(tenant) {
        Ok(tenant.to_string())
    } else {
        Err(SettingsIssue::InvalidTenant)
    }
}

/// Validate the authority host and tenant of a settings snapshot.
///
/// Unknown authority hosts produce a warning unless
/// `allow_custom_authority_host` is set; they never fail validation.
pub fn validate_settings(settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::default();

    let host = if settings.authority_host.trim().is_empty() {
        DEFAULT_AUTHORITY_HOST
    } else {
        settings.authority_host.as_str()
    };
    match normalize_authority_host(host) {
        Ok(authority) => {
            if let Some(warning) = authority.warning {
                if !settings.allow_custom_authority_host {
                    report.warnings.push(warning);
                }
            }
            report.normalized.authority_host = authority.normalized;
        }
        Err(issue) => report.errors.push(issue),
    }

    match normalize_tenant(&settings.tenant) {
        Ok(tenant) => report.normalized.tenant = tenant,
        Err(issue) => report.errors.push(issue),
    }

    report
}

fn guid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .expect("GUID pattern is valid")
    })
}

fn domain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9-]+(\.[a-zA-Z0-9-]+)+$").expect("domain pattern is valid"))
}
