//! Teams meeting token manager
//!
//! Acquires, caches, refreshes and invalidates the Microsoft identity platform
//! bearer tokens used to create Teams meetings and calendar events, running the
//! authorization code flow with PKCE only when no usable cached credential
//! exists.

pub mod auth;
pub mod config;

pub use auth::{AccountIdentity, AccountType, AuthError, AuthStatus, TokenManager};
pub use config::{AccountMode, MeetingMode, Settings};
