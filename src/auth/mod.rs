//! Authentication module for Teams meeting creation
//!
//! Implements the OAuth2 authorization code flow with PKCE against the
//! Microsoft identity platform, with a scope-aware token cache and silent
//! refresh in front of the interactive browser prompt.

pub mod error;
pub mod flow;
pub mod identity;
pub mod manager;
pub mod oauth;
pub mod pkce;
pub mod scopes;
pub mod tokens;
pub mod validation;

pub use error::AuthError;
pub use flow::{FlowError, InteractiveFlow, LoopbackBrowserFlow, RedirectProvider, UnavailableFlow};
pub use identity::{AccountIdentity, AccountType, IdentityDecoder, UnverifiedIdTokenDecoder};
pub use manager::{AuthStatus, TokenManager};
pub use oauth::{GrantError, ReqwestTransport, TokenTransport, TransportError};
pub use tokens::{MemorySecretStore, SecretStore, StoreChange, StoreError, TokenCache, TokenState};
pub use validation::{validate_settings, SettingsIssue, ValidationReport};
