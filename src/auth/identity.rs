//! Account identity from the cached ID token
//!
//! The payload is decoded without checking the signature. The result feeds
//! display and UX branching (for example warning that personal accounts cannot
//! create Teams meetings directly); it must not be used to make trust
//! decisions. Swap in a verifying [`IdentityDecoder`] if that ever changes.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Tenant id the identity platform assigns to Microsoft personal accounts.
pub const CONSUMER_TENANT_ID: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Personal,
    Work,
    #[default]
    Unknown,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccountType::Personal => "personal",
            AccountType::Work => "work",
            AccountType::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Who the cached tokens belong to, as claimed by the ID token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub account_type: AccountType,
    pub tenant_id: String,
    pub email: String,
    pub name: String,
}

/// Turns an ID token into an [`AccountIdentity`]. Must not fail.
pub trait IdentityDecoder: Send + Sync {
    fn decode(&self, id_token: &str) -> AccountIdentity;
}

/// Reads the claims segment of a compact JWT without verifying it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnverifiedIdTokenDecoder;

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    upn: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl IdentityDecoder for UnverifiedIdTokenDecoder {
    fn decode(&self, id_token: &str) -> AccountIdentity {
        let Some(claims) = decode_claims(id_token) else {
            return AccountIdentity::default();
        };

        let tenant_id = claims.tid.unwrap_or_default();
        let account_type = if tenant_id == CONSUMER_TENANT_ID {
            AccountType::Personal
        } else {
            AccountType::Work
        };

        AccountIdentity {
            account_type,
            tenant_id,
            email: claims
                .email
                .or(claims.preferred_username)
                .or(claims.upn)
                .unwrap_or_default(),
            name: claims.name.unwrap_or_default(),
        }
    }
}

fn decode_claims(token: &str) -> Option<IdTokenClaims> {
    let payload = token.split('.').nth(1).filter(|segment| !segment.is_empty())?;

    // base64url -> base64, then restore the padding JWTs strip
    let mut normalized: String = payload
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let padding = (4 - normalized.len() % 4) % 4;
    normalized.extend(std::iter::repeat('=').take(padding));

    let bytes = STANDARD.decode(normalized).ok()?;
    serde_json::from_slice(&bytes).ok()
}
