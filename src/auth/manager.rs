//! Access token acquisition
//!
//! [`TokenManager`] serves a cached token when it is still fresh, silently
//! refreshes it when possible and otherwise falls back to an interactive
//! authorization code + PKCE sign-in. Concurrent callers asking for the same
//! scope set share one acquisition.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use url::Url;

use super::flow::{InteractiveFlow, RedirectProvider, UnavailableFlow};
use super::identity::{AccountIdentity, AccountType, IdentityDecoder, UnverifiedIdTokenDecoder};
use super::oauth::{authorize_url, AuthorizeRequest, GrantedTokens, TokenEndpoint, TokenTransport};
use super::pkce::{generate_state, PkceContext};
use super::scopes::requested_scopes;
use super::tokens::{SecretStore, StoreChange, TokenCache, TokenState, TokenUpdate};
use super::validation::{validate_settings, NormalizedAuthority};
use super::AuthError;
use crate::config::{AccountMode, Settings, SettingsProvider};

/// A cached token must outlive now by this much to be served.
pub const SAFETY_MARGIN_MS: i64 = 60_000;

/// Snapshot of the sign-in state. Never triggers a network call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub configured: bool,
    pub account_mode: AccountMode,
    /// Decoded from the cached ID token, if any.
    pub identity: Option<AccountIdentity>,
    /// Epoch milliseconds; `None` when no access token is cached.
    pub token_expires_at: Option<i64>,
    pub has_refresh_token: bool,
    pub token_scopes: String,
}

impl AuthStatus {
    pub fn signed_in(&self) -> bool {
        self.token_expires_at.is_some() || self.has_refresh_token
    }

    /// Note for when the cached account does not match `account_mode`.
    pub fn account_mode_mismatch(&self) -> Option<String> {
        let identity = self.identity.as_ref()?;
        match (self.account_mode, identity.account_type) {
            (AccountMode::Work, AccountType::Personal) => Some(
                "Signed in with a personal Microsoft account, but account_mode is 'work'. \
                 Personal accounts cannot create Teams meetings through the online meetings API."
                    .to_string(),
            ),
            (AccountMode::Personal, AccountType::Work) => Some(
                "Signed in with a work or school account, but account_mode is 'personal'.".to_string(),
            ),
            _ => None,
        }
    }
}

/// Coordination for one normalized scope set.
///
/// `silent` covers the cache check and refresh, `sign_in` the interactive
/// prompt. No caller holds both, so silent callers never wait on a browser.
#[derive(Default)]
struct Flight {
    silent: Mutex<()>,
    sign_in: Mutex<()>,
}

pub struct TokenManager {
    settings: Arc<dyn SettingsProvider>,
    cache: TokenCache,
    transport: Arc<dyn TokenTransport>,
    flow: Arc<dyn InteractiveFlow>,
    redirect: Arc<dyn RedirectProvider>,
    identity: Arc<dyn IdentityDecoder>,
    // Keyed by normalized scope set; entries leave with their last caller
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

impl TokenManager {
    /// Manager without an interactive flow; sign-in fails with
    /// [`AuthError::FlowUnavailable`] until one is attached.
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        store: Arc<dyn SecretStore>,
        transport: Arc<dyn TokenTransport>,
    ) -> Self {
        let unavailable = Arc::new(UnavailableFlow::new("no interactive sign-in flow is configured"));
        Self {
            settings,
            cache: TokenCache::new(store),
            transport,
            flow: unavailable.clone(),
            redirect: unavailable,
            identity: Arc::new(UnverifiedIdTokenDecoder),
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_interactive_flow(
        mut self,
        flow: Arc<dyn InteractiveFlow>,
        redirect: Arc<dyn RedirectProvider>,
    ) -> Self {
        self.flow = flow;
        self.redirect = redirect;
        self
    }

    pub fn with_identity_decoder(mut self, identity: Arc<dyn IdentityDecoder>) -> Self {
        self.identity = identity;
        self
    }

    /// Bearer token for the configured scopes.
    ///
    /// With `interactive == false` the call never opens a browser and fails
    /// with [`AuthError::NoCachedToken`] when neither the cache nor a refresh
    /// can supply a token, even while another caller's sign-in is pending.
    /// Interactive callers for the same scopes share one sign-in.
    pub async fn get_access_token(&self, interactive: bool) -> Result<String, AuthError> {
        let settings = self.settings.get().await?;
        if !settings.is_configured() {
            self.settings.request_configuration();
            return Err(AuthError::NotConfigured);
        }
        let authority = validated_authority(&settings)?;
        let scopes = requested_scopes(&settings);

        let flight = self.join_flight(&scopes).await;
        let result = self.acquire(&flight, &settings, &authority, &scopes, interactive).await;
        self.leave_flight(&scopes, flight).await;
        result
    }

    async fn acquire(
        &self,
        flight: &Flight,
        settings: &Settings,
        authority: &NormalizedAuthority,
        scopes: &str,
        interactive: bool,
    ) -> Result<String, AuthError> {
        let endpoint = TokenEndpoint::new(authority, settings.client_id.trim(), self.transport.as_ref())?;

        {
            let _silent = flight.silent.lock().await;
            if let Some(token) = self.cached_or_refreshed(&endpoint, scopes).await? {
                return Ok(token);
            }
        }

        if !interactive {
            return Err(AuthError::NoCachedToken);
        }

        let _sign_in = flight.sign_in.lock().await;
        // A sign-in that completed while this caller waited has filled the cache
        let cached = self.cache.read().await?;
        if cached.token_scopes == scopes && cached.is_fresh(now_millis(), SAFETY_MARGIN_MS) {
            tracing::debug!("Using access token from a concurrent sign-in");
            return Ok(cached.access_token);
        }

        self.sign_in(&endpoint, authority, &settings.client_id, scopes).await
    }

    /// Fast path and silent refresh; `None` when only a sign-in can help.
    async fn cached_or_refreshed(
        &self,
        endpoint: &TokenEndpoint<'_>,
        scopes: &str,
    ) -> Result<Option<String>, AuthError> {
        self.cache.invalidate_if_scopes_changed(scopes).await?;
        let cached = self.cache.read().await?;
        if cached.is_fresh(now_millis(), SAFETY_MARGIN_MS) {
            tracing::debug!("Using cached access token");
            return Ok(Some(cached.access_token));
        }

        if cached.has_refresh_token() {
            match endpoint.refresh(&cached.refresh_token, scopes).await {
                Ok(granted) => {
                    tracing::info!("Access token refreshed");
                    return self.store_refreshed(granted, &cached, scopes).await.map(Some);
                }
                Err(err) => tracing::warn!("Token refresh failed: {}", err),
            }
        }

        Ok(None)
    }

    /// Sign in if needed, then report who the token belongs to.
    pub async fn test_connection(&self) -> Result<AccountIdentity, AuthError> {
        self.get_access_token(true).await?;
        self.account_identity().await
    }

    /// Identity claimed by the cached ID token; `unknown` when there is none.
    pub async fn account_identity(&self) -> Result<AccountIdentity, AuthError> {
        let state = self.cache.read().await?;
        Ok(self.identity.decode(&state.id_token))
    }

    pub async fn status(&self) -> Result<AuthStatus, AuthError> {
        let settings = self.settings.get().await?;
        let state = self.cache.read().await?;

        Ok(AuthStatus {
            configured: settings.is_configured(),
            account_mode: settings.account_mode,
            identity: (!state.id_token.is_empty()).then(|| self.identity.decode(&state.id_token)),
            token_expires_at: (!state.access_token.is_empty()).then_some(state.token_expires_at),
            has_refresh_token: state.has_refresh_token(),
            token_scopes: state.token_scopes,
        })
    }

    /// Forget all cached tokens.
    pub async fn logout(&self) -> Result<(), AuthError> {
        self.cache.logout().await?;
        tracing::info!("Cached tokens cleared");
        Ok(())
    }

    /// Notifications for every change to the stored token state.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.cache.subscribe()
    }

    async fn join_flight(&self, scopes: &str) -> Arc<Flight> {
        let mut flights = self.flights.lock().await;
        flights.entry(scopes.to_string()).or_default().clone()
    }

    async fn leave_flight(&self, scopes: &str, flight: Arc<Flight>) {
        let mut flights = self.flights.lock().await;
        // Map entry plus this caller's handle
        let idle = flights
            .get(scopes)
            .is_some_and(|current| Arc::ptr_eq(current, &flight) && Arc::strong_count(&flight) == 2);
        if idle {
            flights.remove(scopes);
        }
    }

    async fn sign_in(
        &self,
        endpoint: &TokenEndpoint<'_>,
        authority: &NormalizedAuthority,
        client_id: &str,
        scopes: &str,
    ) -> Result<String, AuthError> {
        let redirect_uri = self
            .redirect
            .redirect_url()
            .ok_or_else(|| AuthError::FlowUnavailable("no redirect URI is available on this host".into()))?;

        let pkce = PkceContext::generate()?;
        let state = generate_state()?;
        let url = authorize_url(
            authority,
            &AuthorizeRequest {
                client_id: client_id.trim(),
                redirect_uri: &redirect_uri,
                scopes,
                pkce: &pkce,
                state: &state,
            },
        )?;

        tracing::info!("Starting interactive sign-in against {}", authority.authority());
        let redirected = self.flow.launch(url.as_str()).await?;
        let code = parse_callback(&redirected, &state)?;

        let granted = endpoint.exchange_code(&code, &pkce, &redirect_uri, scopes).await?;
        tracing::info!("Signed in");

        let access_token = granted.access_token.clone();
        self.cache
            .write(TokenUpdate {
                access_token: Some(granted.access_token),
                refresh_token: Some(granted.refresh_token.unwrap_or_default()),
                id_token: Some(granted.id_token.unwrap_or_default()),
                token_expires_at: Some(expires_at(granted.expires_in)),
                token_scopes: Some(scopes.to_string()),
            })
            .await?;
        Ok(access_token)
    }

    /// Persist a refresh result, keeping tokens the provider did not reissue.
    async fn store_refreshed(
        &self,
        granted: GrantedTokens,
        previous: &TokenState,
        scopes: &str,
    ) -> Result<String, AuthError> {
        let access_token = granted.access_token.clone();
        self.cache
            .write(TokenUpdate {
                access_token: Some(granted.access_token),
                refresh_token: Some(granted.refresh_token.unwrap_or_else(|| previous.refresh_token.clone())),
                id_token: Some(granted.id_token.unwrap_or_else(|| previous.id_token.clone())),
                token_expires_at: Some(expires_at(granted.expires_in)),
                token_scopes: Some(scopes.to_string()),
            })
            .await?;
        Ok(access_token)
    }
}

fn validated_authority(settings: &Settings) -> Result<NormalizedAuthority, AuthError> {
    let report = validate_settings(settings);
    if settings.debug_enabled {
        for warning in &report.warnings {
            tracing::warn!("{}", warning);
        }
    }
    if !report.is_ok() {
        return Err(AuthError::InvalidConfiguration(report.errors));
    }
    Ok(report.normalized)
}

/// Extract the authorization code from the final redirect URL.
pub fn parse_callback(redirected: &str, expected_state: &str) -> Result<String, AuthError> {
    let url = Url::parse(redirected)
        .map_err(|e| AuthError::AuthorizationFailed(format!("invalid redirect URL: {}", e)))?;
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(error) = params.get("error") {
        let message = params
            .get("error_description")
            .filter(|d| !d.is_empty())
            .unwrap_or(error);
        return Err(AuthError::AuthorizationFailed(message.clone()));
    }

    if params.get("state").map(String::as_str) != Some(expected_state) {
        return Err(AuthError::InvalidState);
    }

    params
        .get("code")
        .filter(|code| !code.is_empty())
        .cloned()
        .ok_or(AuthError::NoAuthorizationCode)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expires_at(expires_in: u64) -> i64 {
    let lifetime_ms = i64::try_from(expires_in).unwrap_or(i64::MAX).saturating_mul(1000);
    now_millis().saturating_add(lifetime_ms)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use oauth2::http::header::CONTENT_TYPE;
    use oauth2::http::{HeaderMap, HeaderValue, StatusCode};
    use oauth2::{HttpRequest, HttpResponse};
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::flow::FlowError;
    use crate::auth::identity::CONSUMER_TENANT_ID;
    use crate::auth::oauth::TransportError;
    use crate::auth::pkce::code_challenge;
    use crate::auth::tokens::MemorySecretStore;
    use crate::config::ConfigError;

    const REDIRECT: &str = "http://localhost:53682/callback";
    const DIRECT_SCOPES: &str = "OnlineMeetings.ReadWrite offline_access openid profile";

    type Form = HashMap<String, String>;

    /// Token endpoint that replays canned JSON responses in order.
    struct FakeTransport {
        responses: StdMutex<VecDeque<(u16, Value)>>,
        requests: StdMutex<Vec<Form>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<(u16, Value)>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                requests: StdMutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Form> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TokenTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let form = url::form_urlencoded::parse(&request.body).into_owned().collect();
            self.requests.lock().unwrap().push(form);

            let (status, body) = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Other("unexpected token request".into()))?;

            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(HttpResponse {
                status_code: StatusCode::from_u16(status).unwrap(),
                headers,
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    type Responder = Box<dyn Fn(&Url) -> Result<String, FlowError> + Send + Sync>;

    /// Browser stand-in answering the authorize URL with a canned redirect.
    struct FakeFlow {
        launches: AtomicUsize,
        authorize_urls: StdMutex<Vec<Url>>,
        respond: Responder,
        // Keeps the browser open until notified
        hold: Option<Arc<Notify>>,
    }

    impl FakeFlow {
        fn new(respond: impl Fn(&Url) -> Result<String, FlowError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                authorize_urls: StdMutex::new(Vec::new()),
                respond: Box::new(respond),
                hold: None,
            })
        }

        /// Completes sign-in, echoing the request state.
        fn approving() -> Arc<Self> {
            Self::new(|url| Ok(format!("{}?code=auth-code&state={}", REDIRECT, query(url, "state"))))
        }

        /// Like [`FakeFlow::approving`], but the user answers only once `release` fires.
        fn approving_after(release: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                authorize_urls: StdMutex::new(Vec::new()),
                respond: Box::new(|url| Ok(format!("{}?code=auth-code&state={}", REDIRECT, query(url, "state")))),
                hold: Some(release),
            })
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn last_authorize_url(&self) -> Url {
            self.authorize_urls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl InteractiveFlow for FakeFlow {
        async fn launch(&self, authorize_url: &str) -> Result<String, FlowError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let url = Url::parse(authorize_url).unwrap();
            self.authorize_urls.lock().unwrap().push(url.clone());
            match &self.hold {
                Some(release) => release.notified().await,
                None => tokio::task::yield_now().await,
            }
            (self.respond)(&url)
        }
    }

    impl RedirectProvider for FakeFlow {
        fn redirect_url(&self) -> Option<String> {
            Some(REDIRECT.to_string())
        }
    }

    /// Settings snapshot that counts configuration requests.
    struct CountingSettings {
        settings: Settings,
        configuration_requests: AtomicUsize,
    }

    #[async_trait]
    impl SettingsProvider for CountingSettings {
        async fn get(&self) -> Result<Settings, ConfigError> {
            Ok(self.settings.clone())
        }

        fn request_configuration(&self) {
            self.configuration_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn query(url: &Url, key: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default()
    }

    fn configured() -> Settings {
        Settings {
            client_id: "app-id".into(),
            ..Settings::default()
        }
    }

    fn id_token(claims: Value) -> String {
        format!("e30.{}.sig", URL_SAFE_NO_PAD.encode(claims.to_string()))
    }

    fn token_response(access_token: &str) -> (u16, Value) {
        (
            200,
            json!({
                "access_token": access_token,
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "rt-new",
                "id_token": id_token(json!({ "tid": "contoso-tid", "email": "ada@contoso.com", "name": "Ada" })),
            }),
        )
    }

    fn manager(
        settings: Settings,
        store: &Arc<MemorySecretStore>,
        transport: &Arc<FakeTransport>,
        flow: &Arc<FakeFlow>,
    ) -> TokenManager {
        TokenManager::new(Arc::new(settings), store.clone(), transport.clone())
            .with_interactive_flow(flow.clone(), flow.clone())
    }

    async fn seed(store: &Arc<MemorySecretStore>, state: TokenState) {
        TokenCache::new(store.clone())
            .write(TokenUpdate {
                access_token: Some(state.access_token),
                refresh_token: Some(state.refresh_token),
                id_token: Some(state.id_token),
                token_expires_at: Some(state.token_expires_at),
                token_scopes: Some(state.token_scopes),
            })
            .await
            .unwrap();
    }

    async fn stored(store: &Arc<MemorySecretStore>) -> TokenState {
        TokenCache::new(store.clone()).read().await.unwrap()
    }

    #[tokio::test]
    async fn test_fresh_cached_token_needs_no_network() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                access_token: "cached".into(),
                token_expires_at: now_millis() + 3_600_000,
                token_scopes: DIRECT_SCOPES.into(),
                ..TokenState::default()
            },
        )
        .await;
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::approving();

        let token = manager(configured(), &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap();

        assert_eq!(token, "cached");
        assert!(transport.requests().is_empty());
        assert_eq!(flow.launches(), 0);
    }

    #[tokio::test]
    async fn test_token_inside_safety_margin_is_not_served() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                access_token: "almost-expired".into(),
                token_expires_at: now_millis() + 30_000,
                token_scopes: DIRECT_SCOPES.into(),
                ..TokenState::default()
            },
        )
        .await;
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::approving();

        let err = manager(configured(), &store, &transport, &flow)
            .get_access_token(false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoCachedToken));
    }

    #[tokio::test]
    async fn test_scope_drift_discards_cached_tokens() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                access_token: "direct-token".into(),
                refresh_token: "direct-refresh".into(),
                token_expires_at: now_millis() + 3_600_000,
                token_scopes: DIRECT_SCOPES.into(),
                ..TokenState::default()
            },
        )
        .await;
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::approving();
        let settings = Settings {
            meeting_mode: crate::config::MeetingMode::Calendar,
            ..configured()
        };

        let err = manager(settings, &store, &transport, &flow)
            .get_access_token(false)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::NoCachedToken));
        assert!(transport.requests().is_empty());
        let state = stored(&store).await;
        assert!(state.access_token.is_empty());
        assert!(state.refresh_token.is_empty());
        assert_eq!(state.token_scopes, "Calendars.ReadWrite offline_access openid profile");
    }

    #[tokio::test]
    async fn test_refresh_keeps_tokens_not_reissued() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                access_token: "stale".into(),
                refresh_token: "rt-old".into(),
                id_token: "id-old".into(),
                token_expires_at: now_millis() - 1,
                token_scopes: DIRECT_SCOPES.into(),
            },
        )
        .await;
        let transport = FakeTransport::new(vec![(
            200,
            json!({ "access_token": "refreshed", "token_type": "Bearer", "expires_in": 3600 }),
        )]);
        let flow = FakeFlow::approving();

        let before = now_millis();
        let token = manager(configured(), &store, &transport, &flow)
            .get_access_token(false)
            .await
            .unwrap();
        let after = now_millis();

        assert_eq!(token, "refreshed");
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["grant_type"], "refresh_token");
        assert_eq!(requests[0]["refresh_token"], "rt-old");
        assert_eq!(requests[0]["client_id"], "app-id");
        assert_eq!(requests[0]["scope"], DIRECT_SCOPES);

        let state = stored(&store).await;
        assert_eq!(state.access_token, "refreshed");
        assert_eq!(state.refresh_token, "rt-old");
        assert_eq!(state.id_token, "id-old");
        assert!(state.token_expires_at >= before + 3_600_000);
        assert!(state.token_expires_at <= after + 3_600_000);
        assert_eq!(flow.launches(), 0);
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_sign_in() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                refresh_token: "rt-revoked".into(),
                token_scopes: DIRECT_SCOPES.into(),
                ..TokenState::default()
            },
        )
        .await;
        let transport = FakeTransport::new(vec![
            (400, json!({ "error": "invalid_grant", "error_description": "AADSTS700082: expired" })),
            token_response("interactive"),
        ]);
        let flow = FakeFlow::approving();

        let token = manager(configured(), &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap();

        assert_eq!(token, "interactive");
        assert_eq!(flow.launches(), 1);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        let exchange = &requests[1];
        assert_eq!(exchange["grant_type"], "authorization_code");
        assert_eq!(exchange["code"], "auth-code");
        assert_eq!(exchange["redirect_uri"], REDIRECT);
        assert_eq!(exchange["scope"], DIRECT_SCOPES);

        // The verifier sent on exchange matches the challenge in the authorize URL
        let authorize = flow.last_authorize_url();
        assert_eq!(query(&authorize, "code_challenge"), code_challenge(&exchange["code_verifier"]));
        assert_eq!(query(&authorize, "code_challenge_method"), "S256");
        assert_eq!(query(&authorize, "prompt"), "select_account");

        let state = stored(&store).await;
        assert_eq!(state.access_token, "interactive");
        assert_eq!(state.refresh_token, "rt-new");
        assert_eq!(state.token_scopes, DIRECT_SCOPES);
    }

    #[tokio::test]
    async fn test_failed_refresh_without_interaction() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                refresh_token: "rt-revoked".into(),
                token_scopes: DIRECT_SCOPES.into(),
                ..TokenState::default()
            },
        )
        .await;
        let transport = FakeTransport::new(vec![(400, json!({ "error": "invalid_grant" }))]);
        let flow = FakeFlow::approving();

        let err = manager(configured(), &store, &transport, &flow)
            .get_access_token(false)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoCachedToken));
        assert_eq!(flow.launches(), 0);
    }

    #[tokio::test]
    async fn test_state_mismatch_skips_exchange() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![token_response("never")]);
        let flow = FakeFlow::new(|_| Ok(format!("{}?code=auth-code&state=forged", REDIRECT)));

        let err = manager(configured(), &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidState));
        assert!(transport.requests().is_empty());
        assert!(stored(&store).await.access_token.is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_in_callback() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::new(|url| {
            Ok(format!(
                "{}?error=access_denied&error_description=The+user+declined+consent&state={}",
                REDIRECT,
                query(url, "state")
            ))
        });

        let err = manager(configured(), &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap_err();
        match err {
            AuthError::AuthorizationFailed(message) => assert_eq!(message, "The user declined consent"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_failure_carries_provider_text() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![(
            400,
            json!({ "error": "invalid_grant", "error_description": "AADSTS54005: code already redeemed" }),
        )]);
        let flow = FakeFlow::approving();

        let err = manager(configured(), &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap_err();
        match err {
            AuthError::TokenExchangeFailed(message) => assert!(message.contains("AADSTS54005")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_sign_in() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::new(|_| Err(FlowError::Cancelled));

        let err = manager(configured(), &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AuthorizationCancelled));
    }

    #[tokio::test]
    async fn test_missing_flow_is_unavailable() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![]);
        let manager = TokenManager::new(Arc::new(configured()), store, transport.clone());

        let err = manager.get_access_token(true).await.unwrap_err();
        assert!(matches!(err, AuthError::FlowUnavailable(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_client_id_requests_configuration() {
        let settings = Arc::new(CountingSettings {
            settings: Settings::default(),
            configuration_requests: AtomicUsize::new(0),
        });
        let transport = FakeTransport::new(vec![]);
        let manager = TokenManager::new(settings.clone(), Arc::new(MemorySecretStore::new()), transport.clone());

        let err = manager.get_access_token(true).await.unwrap_err();
        assert!(matches!(err, AuthError::NotConfigured));
        assert_eq!(settings.configuration_requests.load(Ordering::SeqCst), 1);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_settings_block_acquisition() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::approving();
        let settings = Settings {
            authority_host: "http://login.microsoftonline.com".into(),
            ..configured()
        };

        let err = manager(settings, &store, &transport, &flow)
            .get_access_token(true)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfiguration(ref issues) if issues.len() == 1));
        assert_eq!(flow.launches(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_sign_in() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![token_response("shared")]);
        let flow = FakeFlow::approving();
        let manager = manager(configured(), &store, &transport, &flow);

        let (first, second) = tokio::join!(manager.get_access_token(true), manager.get_access_token(true));

        assert_eq!(first.unwrap(), "shared");
        assert_eq!(second.unwrap(), "shared");
        assert_eq!(flow.launches(), 1);
        assert_eq!(transport.requests().len(), 1);
        assert!(manager.flights.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_flight_entries_are_dropped_after_each_call() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::approving();
        let manager = manager(configured(), &store, &transport, &flow);

        assert!(matches!(manager.get_access_token(false).await, Err(AuthError::NoCachedToken)));
        assert!(manager.flights.lock().await.is_empty());

        let scoped = Settings {
            scopes: "Calendars.ReadWrite".into(),
            ..configured()
        };
        let other = TokenManager::new(Arc::new(scoped), store.clone(), transport.clone());
        assert!(other.get_access_token(true).await.is_err());
        assert!(other.flights.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_silent_caller_does_not_wait_on_pending_sign_in() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![token_response("interactive")]);
        let release = Arc::new(Notify::new());
        let flow = FakeFlow::approving_after(release.clone());
        let manager = manager(configured(), &store, &transport, &flow);

        let silent = async {
            while flow.launches() == 0 {
                tokio::task::yield_now().await;
            }
            let result = manager.get_access_token(false).await;
            release.notify_one();
            result
        };
        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(manager.get_access_token(true), silent)
        });
        let (interactive, silent) = joined.await.expect("silent caller blocked behind the browser prompt");

        assert!(matches!(silent, Err(AuthError::NoCachedToken)));
        assert_eq!(interactive.unwrap(), "interactive");
        assert_eq!(flow.launches(), 1);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logged_while_validating(settings: &Settings) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || validated_authority(settings)).unwrap();
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_settings_warnings_logged_only_in_debug() {
        let custom = Settings {
            authority_host: "https://login.contoso.example".into(),
            ..configured()
        };
        assert!(!logged_while_validating(&custom).contains("not a known Microsoft login endpoint"));

        let debug = Settings {
            debug_enabled: true,
            ..custom
        };
        assert!(logged_while_validating(&debug).contains("Authority host is not a known Microsoft login endpoint."));
    }

    #[tokio::test]
    async fn test_status_and_identity_after_sign_in() {
        let store = Arc::new(MemorySecretStore::new());
        let transport = FakeTransport::new(vec![(
            200,
            json!({
                "access_token": "at",
                "token_type": "Bearer",
                "expires_in": 3600,
                "id_token": id_token(json!({ "tid": CONSUMER_TENANT_ID, "preferred_username": "ada@outlook.com" })),
            }),
        )]);
        let flow = FakeFlow::approving();
        let manager = manager(configured(), &store, &transport, &flow);

        let before = manager.status().await.unwrap();
        assert!(before.configured);
        assert!(!before.signed_in());
        assert_eq!(before.identity, None);

        let identity = manager.test_connection().await.unwrap();
        assert_eq!(identity.account_type, AccountType::Personal);
        assert_eq!(identity.email, "ada@outlook.com");

        let after = manager.status().await.unwrap();
        assert!(after.signed_in());
        assert!(!after.has_refresh_token);
        assert_eq!(after.identity, Some(identity));
        assert!(after.account_mode_mismatch().is_some());
    }

    #[tokio::test]
    async fn test_logout_notifies_and_forgets_tokens() {
        let store = Arc::new(MemorySecretStore::new());
        seed(
            &store,
            TokenState {
                access_token: "at".into(),
                refresh_token: "rt".into(),
                token_expires_at: now_millis() + 3_600_000,
                token_scopes: DIRECT_SCOPES.into(),
                ..TokenState::default()
            },
        )
        .await;
        let transport = FakeTransport::new(vec![]);
        let flow = FakeFlow::approving();
        let manager = manager(configured(), &store, &transport, &flow);
        let mut changes = manager.subscribe();

        manager.logout().await.unwrap();

        assert!(changes.recv().await.is_ok());
        let status = manager.status().await.unwrap();
        assert!(!status.signed_in());
        assert_eq!(status.token_scopes, DIRECT_SCOPES);
        assert_eq!(manager.account_identity().await.unwrap(), AccountIdentity::default());
    }

    #[test]
    fn test_parse_callback() {
        assert_eq!(
            parse_callback("http://localhost:1/cb?code=abc&state=s1", "s1").unwrap(),
            "abc"
        );
        assert!(matches!(
            parse_callback("http://localhost:1/cb?code=abc", "s1"),
            Err(AuthError::InvalidState)
        ));
        assert!(matches!(
            parse_callback("http://localhost:1/cb?state=s1", "s1"),
            Err(AuthError::NoAuthorizationCode)
        ));
        assert!(matches!(
            parse_callback("http://localhost:1/cb?error=access_denied&state=s1", "s1"),
            Err(AuthError::AuthorizationFailed(ref m)) if m == "access_denied"
        ));
    }
}
