// Integration tests for toolkit-credentials
//
// These tests drive the public API end to end: registry, token providers,
// reauthentication and event delivery wired through AuthContext.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolkit_credentials::auth::{
    CredentialStore, LoginOutcome, LoginPrompt, MemoryCredentialStore, ReauthOutcome, ReauthPhase,
    RefreshMaterial, RetryPolicy, SsoOidcBackend, TokenBackend, TokenData, TokenState,
};
use toolkit_credentials::notifier::{Event, ImmediateDispatcher, ThreadDispatcher, Topic};
use toolkit_credentials::{
    AuthContext, AuthError, AuthSettings, Connection, ConnectionId, FeatureId, Result,
};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

struct FakeBackend {
    script: Mutex<VecDeque<Result<TokenData>>>,
    fallback: Result<TokenData>,
    calls: AtomicUsize,
}

impl FakeBackend {
    fn new(script: Vec<Result<TokenData>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Err(AuthError::Backend("script exhausted".to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    fn always(result: Result<TokenData>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: result,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenBackend for FakeBackend {
    async fn refresh(&self, _connection: &Connection, _material: &RefreshMaterial) -> Result<TokenData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Login flow that completes after `delay` unless the user closes it first
struct FakePrompt {
    delay: Duration,
    live: bool,
    cancelled: AtomicBool,
    calls: AtomicUsize,
}

impl FakePrompt {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            live: true,
            cancelled: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// The flow hands back only the refresh grant, without an access token
    fn without_access_token(mut self) -> Self {
        self.live = false;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LoginPrompt for FakePrompt {
    fn login(&self, connection: &Connection) -> Result<LoginOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        let started = std::time::Instant::now();
        while started.elapsed() < self.delay {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(LoginOutcome::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(LoginOutcome::Completed(material(&format!("login-{}", connection.id), self.live)))
    }

    fn cancel(&self, _connection: &Connection) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn material(refresh_token: &str, live: bool) -> RefreshMaterial {
    RefreshMaterial {
        refresh_token: refresh_token.to_string(),
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        access_token: live.then(|| format!("access-{}", refresh_token)),
        expires_at: live.then(|| Utc::now() + ChronoDuration::hours(1)),
        scopes: vec!["codecatalyst:read_write".to_string()],
    }
}

fn fresh_token(access_token: &str) -> TokenData {
    TokenData {
        access_token: access_token.to_string(),
        refresh_token: None,
        expires_at: Utc::now() + ChronoDuration::hours(1),
    }
}

struct TestEnv {
    context: Arc<AuthContext>,
    backend: Arc<FakeBackend>,
    prompt: Arc<FakePrompt>,
    credentials: Arc<MemoryCredentialStore>,
    events: Arc<Mutex<Vec<Event>>>,
}

fn env_with(backend: FakeBackend, prompt: FakePrompt) -> TestEnv {
    let backend = Arc::new(backend);
    let prompt = Arc::new(prompt);
    let credentials = Arc::new(MemoryCredentialStore::new());
    let context = Arc::new(AuthContext::new(
        AuthSettings {
            refresh_threshold: 300,
            retry: RetryPolicy::new(3, 1),
        },
        backend.clone(),
        credentials.clone(),
        prompt.clone(),
        Arc::new(ImmediateDispatcher),
    ));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _subscription = context.subscribe(Topic::ConnectionStateChanged, move |event| {
        sink.lock().unwrap().push(event.clone());
    });

    TestEnv {
        context,
        backend,
        prompt,
        credentials,
        events,
    }
}

fn sso(id: &str) -> Connection {
    Connection::bearer(
        id,
        "AWS Builder ID",
        "https://view.awsapps.com/start",
        "us-east-1",
        ["codecatalyst:read_write"],
    )
}

fn state_changes(env: &TestEnv) -> Vec<(String, TokenState, TokenState)> {
    env.events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            Event::StateChanged(change) => Some((
                change.connection_id.to_string(),
                change.old.clone(),
                change.new.clone(),
            )),
            _ => None,
        })
        .collect()
}

// ==================================================================================================
// Scenarios
// ==================================================================================================

#[tokio::test]
async fn test_prompt_auth_emits_exactly_one_transition() {
    let env = env_with(FakeBackend::new(vec![]), FakePrompt::new(Duration::ZERO));
    let c1 = ConnectionId::new("c1");
    env.context.add_connection(sso("c1")).await;

    let provider = env.context.prompt_auth(&c1).await.unwrap();

    assert_eq!(provider.state(), TokenState::Authorized);
    assert_eq!(
        state_changes(&env),
        vec![(
            "c1".to_string(),
            TokenState::NotAuthenticated,
            TokenState::Authorized
        )]
    );
}

#[tokio::test]
async fn test_unbound_features_are_independent() {
    let env = env_with(FakeBackend::new(vec![]), FakePrompt::new(Duration::ZERO));
    env.context.add_connection(sso("c1")).await;

    for feature in ["codecatalyst", "codewhisperer"] {
        let feature = FeatureId::new(feature);
        assert!(env.context.active_connection_for_feature(&feature).is_none());
        assert_eq!(
            env.context.connection_state_for_feature(&feature),
            TokenState::NotAuthenticated
        );
    }
    assert!(state_changes(&env).is_empty());
}

#[tokio::test]
async fn test_network_errors_then_success_emit_one_event() {
    let network = || Err(AuthError::NetworkError("connection reset".to_string()));
    let env = env_with(
        FakeBackend::new(vec![network(), network(), network(), Ok(fresh_token("renewed"))]),
        FakePrompt::new(Duration::ZERO),
    );
    let c1 = ConnectionId::new("c1");
    env.credentials.put(&c1, &material("r0", false)).unwrap();
    assert_eq!(env.context.add_connection(sso("c1")).await, TokenState::ExpiredRefreshable);
    env.events.lock().unwrap().clear();

    let provider = env.context.registry().provider(&c1).unwrap();
    let state = provider.refresh_with_retry(&RetryPolicy::new(3, 1)).await.unwrap();

    assert_eq!(state, TokenState::Authorized);
    assert_eq!(env.backend.calls(), 4);
    assert_eq!(
        state_changes(&env),
        vec![(
            "c1".to_string(),
            TokenState::ExpiredRefreshable,
            TokenState::Authorized
        )]
    );
    assert_eq!(provider.access_token().await.unwrap(), "renewed");
}

#[tokio::test]
async fn test_retries_exhausted_leave_state_unchanged() {
    let env = env_with(
        FakeBackend::always(Err(AuthError::NetworkError("timeout".to_string()))),
        FakePrompt::new(Duration::ZERO),
    );
    let c1 = ConnectionId::new("c1");
    env.credentials.put(&c1, &material("r0", false)).unwrap();
    env.context.add_connection(sso("c1")).await;
    env.events.lock().unwrap().clear();

    let provider = env.context.registry().provider(&c1).unwrap();
    let err = provider.refresh_with_retry(&RetryPolicy::new(2, 1)).await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(env.backend.calls(), 3);
    assert_eq!(provider.state(), TokenState::ExpiredRefreshable);
    assert!(state_changes(&env).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_prompts_invoke_one_login() {
    let env = env_with(FakeBackend::new(vec![]), FakePrompt::new(Duration::from_millis(100)));
    env.context.add_connection(sso("c1")).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let context = Arc::clone(&env.context);
        handles.push(tokio::spawn(async move {
            context.prompt_auth(&ConnectionId::new("c1")).await
        }));
    }
    let mut providers = Vec::new();
    for handle in handles {
        providers.push(handle.await.unwrap().unwrap());
    }
    assert!(providers.iter().all(|p| Arc::ptr_eq(p, &providers[0])));

    assert_eq!(env.prompt.calls(), 1);
    assert_eq!(state_changes(&env).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_resolves_every_waiter() {
    let env = env_with(FakeBackend::new(vec![]), FakePrompt::new(Duration::from_millis(500)));
    let c1 = ConnectionId::new("c1");
    env.context.add_connection(sso("c1")).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let context = Arc::clone(&env.context);
        handles.push(tokio::spawn(async move {
            context.prompt_auth(&ConnectionId::new("c1")).await
        }));
    }

    while env.prompt.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(env.context.coordinator().cancel(&c1));

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap_err(), AuthError::UserCancelled);
    }

    // The login flow closes and the slot settles as cancelled
    while matches!(env.context.coordinator().phase(&c1), ReauthPhase::PromptInFlight(_)) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        env.context.coordinator().phase(&c1),
        ReauthPhase::Resolved(ReauthOutcome::Cancelled)
    );
    assert_eq!(env.prompt.calls(), 1);
    assert_eq!(env.context.store().get(&c1), TokenState::NotAuthenticated);
    assert!(state_changes(&env).is_empty());
}

#[tokio::test]
async fn test_login_without_access_token_is_exchanged_immediately() {
    let env = env_with(
        FakeBackend::new(vec![Ok(fresh_token("exchanged"))]),
        FakePrompt::new(Duration::ZERO).without_access_token(),
    );
    let c1 = ConnectionId::new("c1");
    env.context.add_connection(sso("c1")).await;

    let provider = env.context.prompt_auth(&c1).await.unwrap();
    assert_eq!(provider.access_token().await.unwrap(), "exchanged");
    env.context.prompt_auth(&c1).await.unwrap();

    assert_eq!(env.backend.calls(), 1);
    assert_eq!(env.prompt.calls(), 1);
    assert_eq!(
        state_changes(&env),
        vec![(
            "c1".to_string(),
            TokenState::NotAuthenticated,
            TokenState::Authorized
        )]
    );
}

#[tokio::test]
async fn test_revoked_is_idempotent() {
    let env = env_with(FakeBackend::always(Err(AuthError::Revoked)), FakePrompt::new(Duration::ZERO));
    let c1 = ConnectionId::new("c1");
    env.credentials.put(&c1, &material("r0", true)).unwrap();
    env.context.add_connection(sso("c1")).await;
    env.events.lock().unwrap().clear();

    let provider = env.context.registry().provider(&c1).unwrap();
    assert_eq!(provider.refresh().await.unwrap_err(), AuthError::Revoked);
    assert_eq!(provider.refresh().await.unwrap_err(), AuthError::Revoked);

    assert_eq!(provider.state(), TokenState::NotAuthenticated);
    assert!(env.credentials.get(&c1).unwrap().is_none());
    assert_eq!(
        state_changes(&env),
        vec![(
            "c1".to_string(),
            TokenState::Authorized,
            TokenState::NotAuthenticated
        )]
    );
    assert_eq!(env.backend.calls(), 1);
}

#[tokio::test]
async fn test_passive_connection_settings_never_prompt() {
    let env = env_with(
        FakeBackend::always(Err(AuthError::ExpiredRefreshToken)),
        FakePrompt::new(Duration::ZERO),
    );
    let c1 = ConnectionId::new("c1");
    env.credentials.put(&c1, &material("r0", false)).unwrap();
    env.context.add_connection(sso("c1")).await;
    env.context
        .set_active_connection(FeatureId::new("codecatalyst"), Some(c1.clone()))
        .unwrap();

    let manager = env.context.feature("codecatalyst");
    assert!(manager.is_connected());
    assert!(manager.connection_settings(true).await.unwrap().is_none());
    assert_eq!(env.prompt.calls(), 0);

    let settings = manager.connection_settings(false).await.unwrap().unwrap();
    assert_eq!(env.prompt.calls(), 1);
    assert_eq!(settings.bearer_token().await.unwrap(), "access-login-c1");
}

#[tokio::test]
async fn test_rebinding_publishes_active_connection_changes() {
    let env = env_with(FakeBackend::new(vec![]), FakePrompt::new(Duration::ZERO));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = env.context.subscribe(Topic::ActiveConnectionChanged, move |event| {
        if let Event::ActiveConnectionChanged { connection, .. } = event {
            sink.lock().unwrap().push(connection.as_ref().map(|c| c.id.to_string()));
        }
    });

    env.context.add_connection(sso("c1")).await;
    env.context.add_connection(sso("c2")).await;
    let feature = FeatureId::new("codecatalyst");
    env.context.set_active_connection(feature.clone(), Some(ConnectionId::new("c1"))).unwrap();
    env.context.set_active_connection(feature.clone(), Some(ConnectionId::new("c2"))).unwrap();
    env.context.remove_connection(&ConnectionId::new("c2")).await.unwrap();

    assert!(env.context.unsubscribe(&subscription));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some("c1".to_string()), Some("c2".to_string()), None]
    );
}

#[tokio::test]
async fn test_thread_dispatcher_delivers_in_commit_order() {
    let dispatcher = Arc::new(ThreadDispatcher::new("test-events").unwrap());
    let backend = Arc::new(FakeBackend::new(vec![]));
    let context = Arc::new(AuthContext::new(
        AuthSettings::default(),
        backend,
        Arc::new(MemoryCredentialStore::new()),
        Arc::new(FakePrompt::new(Duration::ZERO)),
        dispatcher.clone(),
    ));

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _subscription = context.subscribe(Topic::ConnectionStateChanged, move |event| {
        if let Event::StateChanged(change) = event {
            sink.lock().unwrap().push(change.new.clone());
        }
    });

    let c1 = ConnectionId::new("c1");
    context.add_connection(sso("c1")).await;
    context.prompt_auth(&c1).await.unwrap();
    context.close_connection(&c1).await.unwrap();
    context.prompt_auth(&c1).await.unwrap();

    dispatcher.shutdown();
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            TokenState::Authorized,
            TokenState::NotAuthenticated,
            TokenState::Authorized
        ]
    );
}

#[tokio::test]
async fn test_oidc_refresh_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_body(mockito::Matcher::UrlEncoded(
            "refresh_token".into(),
            "r0".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accessToken":"oidc-access","refreshToken":"r1","expiresIn":3600}"#)
        .create_async()
        .await;

    let backend = SsoOidcBackend::new(reqwest::Client::new()).with_endpoint(format!("{}/token", server.url()));
    let credentials = Arc::new(MemoryCredentialStore::new());
    let context = Arc::new(AuthContext::new(
        AuthSettings {
            refresh_threshold: 300,
            retry: RetryPolicy::no_retry(),
        },
        Arc::new(backend),
        credentials.clone(),
        Arc::new(FakePrompt::new(Duration::ZERO)),
        Arc::new(ImmediateDispatcher),
    ));

    let c1 = ConnectionId::new("c1");
    credentials.put(&c1, &material("r0", false)).unwrap();
    context.add_connection(sso("c1")).await;

    let provider = context.registry().provider(&c1).unwrap();
    assert_eq!(provider.access_token().await.unwrap(), "oidc-access");
    assert_eq!(provider.state(), TokenState::Authorized);
    assert_eq!(credentials.get(&c1).unwrap().unwrap().refresh_token, "r1");
    mock.assert_async().await;
}
