//! OAuth2 endpoints of the Microsoft identity platform
//!
//! Authorize URL construction plus the authorization-code and refresh-token
//! grants. Grant requests go through the `oauth2` crate over a pluggable
//! [`TokenTransport`].

use std::time::Duration;

use async_trait::async_trait;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse, BasicTokenType,
};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, Client, ClientId, ExtraTokenFields, HttpRequest, HttpResponse,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope, StandardRevocableToken,
    StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::pkce::PkceContext;
use super::validation::NormalizedAuthority;
use super::AuthError;

/// Upper bound for a single token endpoint round trip.
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Sends token endpoint requests built by the `oauth2` crate.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// `reqwest` transport with a request timeout and redirects disabled.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            // Token endpoints never redirect
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TokenTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        tracing::debug!("Token endpoint {} {}", request.method, request.url);

        let response = self
            .http
            .request(request.method, request.url.as_str())
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status_code = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status_code,
            headers,
            body,
        })
    }
}

/// The `id_token` the identity platform returns next to the access token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

pub type MeetingTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type MeetingOAuthClient = Client<
    BasicErrorResponse,
    MeetingTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// Tokens returned by a successful grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Seconds; 0 when the response carried no `expires_in`.
    pub expires_in: u64,
}

impl From<MeetingTokenResponse> for GrantedTokens {
    fn from(response: MeetingTokenResponse) -> Self {
        Self {
            access_token: response.access_token().secret().to_string(),
            refresh_token: response.refresh_token().map(|t| t.secret().to_string()),
            id_token: response.extra_fields().id_token.clone(),
            expires_in: response.expires_in().map(|d| d.as_secs()).unwrap_or_default(),
        }
    }
}

pub fn authorize_endpoint(authority: &NormalizedAuthority) -> String {
    format!("{}/oauth2/v2.0/authorize", authority.authority())
}

pub fn token_endpoint(authority: &NormalizedAuthority) -> String {
    format!("{}/oauth2/v2.0/token", authority.authority())
}

/// Parameters of one interactive authorize request.
pub struct AuthorizeRequest<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a str,
    pub pkce: &'a PkceContext,
    pub state: &'a str,
}

/// Build the URL the browser flow opens.
pub fn authorize_url(authority: &NormalizedAuthority, request: &AuthorizeRequest<'_>) -> Result<Url, AuthError> {
    let mut url = Url::parse(&authorize_endpoint(authority)).map_err(|e| AuthError::Endpoint(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("client_id", request.client_id)
        .append_pair("response_type", "code")
        .append_pair("redirect_uri", request.redirect_uri)
        .append_pair("response_mode", "query")
        .append_pair("scope", request.scopes)
        .append_pair("code_challenge", request.pkce.challenge())
        .append_pair("code_challenge_method", request.pkce.challenge_method())
        .append_pair("prompt", "select_account")
        .append_pair("state", request.state);
    Ok(url)
}

/// Token endpoint client for one authority and application.
pub struct TokenEndpoint<'a> {
    client: MeetingOAuthClient,
    transport: &'a dyn TokenTransport,
}

impl<'a> TokenEndpoint<'a> {
    pub fn new(
        authority: &NormalizedAuthority,
        client_id: &str,
        transport: &'a dyn TokenTransport,
    ) -> Result<Self, AuthError> {
        let auth_url = AuthUrl::new(authorize_endpoint(authority)).map_err(|e| AuthError::Endpoint(e.to_string()))?;
        let token_url = TokenUrl::new(token_endpoint(authority)).map_err(|e| AuthError::Endpoint(e.to_string()))?;

        // Public client: client_id travels in the form body, no secret
        let client = MeetingOAuthClient::new(ClientId::new(client_id.to_string()), None, auth_url, Some(token_url))
            .set_auth_type(AuthType::RequestBody);

        Ok(Self { client, transport })
    }

    /// Redeem an authorization code with the attempt's PKCE verifier.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce: &PkceContext,
        redirect_uri: &str,
        scopes: &str,
    ) -> Result<GrantedTokens, AuthError> {
        let redirect = RedirectUrl::new(redirect_uri.to_string()).map_err(|e| AuthError::Endpoint(e.to_string()))?;

        tracing::debug!("Exchanging authorization code for tokens");
        let response = self
            .client
            .clone()
            .set_redirect_uri(redirect)
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce.verifier().to_string()))
            .add_extra_param("scope", scopes.to_string())
            .request_async(|request| self.transport.send(request))
            .await
            .map_err(|e| AuthError::TokenExchangeFailed(GrantError::from(e).to_string()))?;

        Ok(response.into())
    }

    /// Refresh-token grant.
    pub async fn refresh(&self, refresh_token: &str, scopes: &str) -> Result<GrantedTokens, GrantError> {
        tracing::debug!("Refreshing access token");
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .add_scopes(scopes.split_whitespace().map(|s| Scope::new(s.to_string())))
            .request_async(|request| self.transport.send(request))
            .await
            .map_err(GrantError::from)?;

        Ok(response.into())
    }
}

/// Why a grant request did not produce tokens.
#[derive(Debug, Error)]
pub enum GrantError {
    /// Provider `error_description`, or the bare `error` code.
    #[error("{0}")]
    Provider(String),
    #[error("token request failed: {0}")]
    Transport(TransportError),
    #[error("unparsable token response ({reason}): {body}")]
    Parse { reason: String, body: String },
    #[error("{0}")]
    Other(String),
}

impl From<RequestTokenError<TransportError, BasicErrorResponse>> for GrantError {
    fn from(err: RequestTokenError<TransportError, BasicErrorResponse>) -> Self {
        match err {
            RequestTokenError::ServerResponse(response) => match response.error_description() {
                Some(description) => Self::Provider(description.clone()),
                None => {
                    let code: &str = response.error().as_ref();
                    Self::Provider(code.to_string())
                }
            },
            RequestTokenError::Request(e) => Self::Transport(e),
            RequestTokenError::Parse(e, body) => Self::Parse {
                reason: e.to_string(),
                body: String::from_utf8_lossy(&body).into_owned(),
            },
            RequestTokenError::Other(message) => Self::Other(message),
        }
    }
}
