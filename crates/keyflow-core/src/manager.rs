//! The session lifecycle orchestrator.
//!
//! [`SessionManager`] is the sole mutator of session state. It drives the
//! redirect flows for login/logout, validates token claims, persists the
//! result, and broadcasts lifecycle events to registered observers. The
//! initialization path races an opportunistic refresh against an optional
//! offline-fallback timer and reconciles whichever finishes second.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{BrowserPresenter, PresentError};
use crate::config::ProviderConfig;
use crate::error::SessionError;
use crate::events::{ObserverRegistry, SessionObserver};
use crate::oauth::{OidcClient, OidcError};
use crate::pkce::{random_state, PkcePair};
use crate::reachability::{ReachabilityEvent, ReachabilityMonitor};
use crate::redirect::{FlowError, LoginRedirectFlow, LogoutOutcome, LogoutRedirectFlow};
use crate::session::{Session, SessionStatus};
use crate::store::SessionStore;
use crate::validator::{TokenValidator, ValidationError};

/// Prompt values forwarded to the authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prompt {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Prompt::None => "none",
            Prompt::Login => "login",
            Prompt::Consent => "consent",
            Prompt::SelectAccount => "select_account",
        };
        write!(f, "{value}")
    }
}

/// Caller-supplied knobs for a login.
#[derive(Debug, Clone, Default)]
pub struct LoginOptions {
    pub extra_scopes: Vec<String>,
    pub acr_values: Vec<String>,
    pub prompt: Option<Prompt>,
}

/// Intermediate milestones of a login, reported for progress UI. Never a
/// substitute for the terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginProgress {
    ConfigurationLoaded,
    BrowserWillAppear,
    BrowserDidDisappear,
    TokenExchangeCompleted,
    IdTokenWillValidate,
}

enum RefreshOutcome {
    /// Token endpoint answered with fresh tokens.
    Refreshed(Session),
    /// Network-class failure; the previous session survives offline.
    OfflineRetained(Session),
    /// The refresh token was rejected; the session is gone.
    Discarded(OidcError),
}

/// Long-lived session lifecycle service. Construct one per application and
/// share it by cloning the handle.
pub struct SessionManager<S: SessionStore + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: SessionStore + 'static> Clone for SessionManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    oauth: OidcClient,
    store: S,
    validator: TokenValidator,
    observers: ObserverRegistry,
    reachability: Mutex<Option<Box<dyn ReachabilityMonitor>>>,
    state: Mutex<ManagerState>,
    /// Serializes overlapping refresh attempts; see DESIGN.md.
    refresh_gate: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct ManagerState {
    initialized: bool,
    current: Option<Session>,
    reachability_started: bool,
    pending_login: Option<Arc<LoginRedirectFlow>>,
    pending_logout: Option<Arc<LogoutRedirectFlow>>,
}

impl<S: SessionStore + 'static> SessionManager<S> {
    pub fn new(config: ProviderConfig, store: S) -> Result<Self, OidcError> {
        Ok(Self::with_client(OidcClient::new(config)?, store))
    }

    /// Build around an already-configured OIDC client.
    pub fn with_client(oauth: OidcClient, store: S) -> Self {
        let validator = TokenValidator::for_config(oauth.config());
        Self {
            inner: Arc::new(Inner {
                oauth,
                store,
                validator,
                observers: ObserverRegistry::new(),
                reachability: Mutex::new(None),
                state: Mutex::new(ManagerState::default()),
                refresh_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Attach the reachability collaborator; takes effect on `initialize`.
    pub fn set_reachability_monitor(&self, monitor: Box<dyn ReachabilityMonitor>) {
        *self.inner.reachability.lock().unwrap() = Some(monitor);
    }

    pub fn register_observer(&self, observer: &Arc<dyn SessionObserver>) {
        self.inner.observers.register(observer);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().unwrap().initialized
    }

    pub fn current_session(&self) -> Option<Session> {
        self.inner.state.lock().unwrap().current.clone()
    }

    /// Resolve the persisted session into a first usable state.
    ///
    /// A stored session is refreshed opportunistically even when it still
    /// looks valid, since local clock comparison says nothing about
    /// server-side revocation. When `offline_fallback_timeout` elapses before
    /// the refresh resolves, the stored session is delivered immediately in a
    /// forced-offline state and the late refresh result is reconciled via
    /// observer events only; the returned value never changes after delivery.
    pub async fn initialize(
        &self,
        offline_fallback_timeout: Option<StdDuration>,
    ) -> Result<Option<Session>, SessionError> {
        self.start_reachability();

        let stored = match self.inner.store.load() {
            Ok(stored) => stored,
            Err(err) => {
                warn!("failed to load persisted session: {err}");
                None
            }
        };

        let Some(stored) = stored else {
            return Ok(self.finish_initialize(None));
        };

        if stored.status() == SessionStatus::NoSession {
            warn!("persisted session has no decodable claims; treating as no session");
            return Ok(self.finish_initialize(None));
        }

        self.set_current(Some(stored.clone()));

        let Some(refresh_token) = stored.refresh_token.clone() else {
            warn!("persisted session has no refresh token; delivering it unrefreshed");
            return Ok(self.finish_initialize(Some(stored)));
        };

        let refresh_task: JoinHandle<RefreshOutcome> = {
            let manager = self.clone();
            let existing = stored.clone();
            tokio::spawn(async move {
                let _gate = manager.inner.refresh_gate.lock().await;
                manager.refresh_once(&existing, &refresh_token).await
            })
        };

        let Some(timeout) = offline_fallback_timeout else {
            let outcome = join_outcome(&stored, refresh_task.await);
            return self.finish_first_refresh(outcome);
        };

        let mut refresh_task = refresh_task;
        tokio::select! {
            result = &mut refresh_task => {
                self.finish_first_refresh(join_outcome(&stored, result))
            }
            _ = tokio::time::sleep(timeout) => {
                info!("offline fallback timer fired before refresh; delivering stored session offline");
                let fallback = stored.clone().with_online(false);
                self.set_current(Some(fallback.clone()));
                self.mark_initialized();
                self.inner.observers.notify_initialized(Some(&fallback));
                self.inner
                    .observers
                    .broadcast(|o| o.did_lose_network_connection(&fallback));

                let manager = self.clone();
                tokio::spawn(async move {
                    manager.reconcile_late_refresh(stored, refresh_task).await;
                });
                Ok(Some(fallback))
            }
        }
    }

    /// First-delivery path: the refresh resolved before any fallback timer.
    fn finish_first_refresh(
        &self,
        outcome: RefreshOutcome,
    ) -> Result<Option<Session>, SessionError> {
        let applied = self.apply_refresh_outcome(outcome);
        self.mark_initialized();
        let current = self.current_session();
        self.inner.observers.notify_initialized(current.as_ref());
        match applied {
            Ok(session) => Ok(Some(session)),
            // A network failure leaves a stale but offline-usable session.
            Err(SessionError::RefreshNetwork) => Ok(current),
            Err(err) => Err(err),
        }
    }

    fn finish_initialize(&self, session: Option<Session>) -> Option<Session> {
        self.set_current(session.clone());
        self.mark_initialized();
        self.inner.observers.notify_initialized(session.as_ref());
        session
    }

    /// A fallback was already delivered; fold the late refresh result into
    /// observer events without re-resolving the external completion.
    async fn reconcile_late_refresh(
        self,
        stored: Session,
        refresh_task: JoinHandle<RefreshOutcome>,
    ) {
        match join_outcome(&stored, refresh_task.await) {
            RefreshOutcome::Refreshed(session) => {
                self.set_current(Some(session.clone()));
                self.persist(Some(&session));
                self.inner
                    .observers
                    .broadcast(|o| o.did_refresh_session(&session));
                // The fallback was delivered offline; the late result brings
                // the session back online.
                self.inner
                    .observers
                    .broadcast(|o| o.did_regain_network_connection(&session));
            }
            RefreshOutcome::OfflineRetained(_) => {
                // The delivered fallback is already offline and authoritative;
                // announcing another offline state would flap.
                debug!("late refresh failed with a network error; keeping fallback session");
            }
            RefreshOutcome::Discarded(err) => {
                warn!("late refresh discarded the session: {err}");
                self.set_current(None);
                self.persist(None);
                self.inner.observers.broadcast(|o| o.did_lose_session());
            }
        }
    }

    /// Return the current session if usable, refreshing it when expired.
    pub async fn get_fresh_session(&self) -> Result<Session, SessionError> {
        let Some(current) = self.current_session() else {
            return Err(SessionError::NoSession);
        };
        match current.status() {
            SessionStatus::Valid => {
                self.inner
                    .observers
                    .broadcast(|o| o.did_resume_session(&current));
                Ok(current)
            }
            SessionStatus::Expired => self.refresh_session().await,
            SessionStatus::NoSession => {
                // A session is present but its claims are unresolvable; fatal
                // to the session, not the process.
                warn!("current session has undecodable claims; dropping it");
                self.set_current(None);
                if let Err(err) = self.inner.store.delete() {
                    warn!("failed to delete persisted session: {err}");
                }
                self.inner.observers.broadcast(|o| o.did_lose_session());
                Err(SessionError::Unknown)
            }
        }
    }

    /// Refresh the current session's tokens.
    ///
    /// Network-class failures keep the session in an offline state and
    /// return [`SessionError::RefreshNetwork`]; any other failure discards
    /// the session.
    pub async fn refresh_session(&self) -> Result<Session, SessionError> {
        let _gate = self.inner.refresh_gate.lock().await;
        let Some(existing) = self.current_session() else {
            return Err(SessionError::NoSessionToRefresh);
        };
        let Some(refresh_token) = existing.refresh_token.clone() else {
            return Err(SessionError::NoSessionToRefresh);
        };
        let outcome = self.refresh_once(&existing, &refresh_token).await;
        self.apply_refresh_outcome(outcome)
    }

    async fn refresh_once(&self, existing: &Session, refresh_token: &str) -> RefreshOutcome {
        match self.inner.oauth.refresh(refresh_token).await {
            Ok(tokens) => {
                // Providers may rotate neither token; carry forward what is
                // missing from the previous session.
                let id_token = tokens
                    .id_token
                    .unwrap_or_else(|| existing.id_token.clone());
                let refresh_token = tokens
                    .refresh_token
                    .unwrap_or_else(|| refresh_token.to_owned());
                RefreshOutcome::Refreshed(Session::new(
                    tokens.access_token,
                    Some(refresh_token),
                    id_token,
                ))
            }
            Err(err) if err.is_network() => {
                warn!("refresh failed with a network error: {err}");
                RefreshOutcome::OfflineRetained(existing.clone().with_online(false))
            }
            Err(err) => RefreshOutcome::Discarded(err),
        }
    }

    fn apply_refresh_outcome(&self, outcome: RefreshOutcome) -> Result<Session, SessionError> {
        match outcome {
            RefreshOutcome::Refreshed(session) => {
                let was_online = self.current_online();
                self.set_current(Some(session.clone()));
                if !was_online {
                    self.inner
                        .observers
                        .broadcast(|o| o.did_regain_network_connection(&session));
                }
                self.persist(Some(&session));
                self.inner
                    .observers
                    .broadcast(|o| o.did_refresh_session(&session));
                Ok(session)
            }
            RefreshOutcome::OfflineRetained(session) => {
                let was_online = self.current_online();
                self.set_current(Some(session.clone()));
                if was_online {
                    self.inner
                        .observers
                        .broadcast(|o| o.did_lose_network_connection(&session));
                }
                self.persist(Some(&session));
                // The session object is re-announced even though its tokens
                // are unchanged.
                self.inner
                    .observers
                    .broadcast(|o| o.did_refresh_session(&session));
                Err(SessionError::RefreshNetwork)
            }
            RefreshOutcome::Discarded(err) => {
                info!("refresh rejected; discarding session: {err}");
                self.set_current(None);
                self.persist(None);
                self.inner.observers.broadcast(|o| o.did_lose_session());
                Err(match err {
                    OidcError::Server { status, .. } => SessionError::RefreshServer(status),
                    OidcError::Oauth { error, description } => SessionError::RefreshOauth(
                        description.unwrap_or(error),
                    ),
                    _ => SessionError::RefreshOauth("refresh token likely expired".to_string()),
                })
            }
        }
    }

    /// Run a browser-delegated login and establish the resulting session.
    pub async fn present_login<F>(
        &self,
        presenter: Arc<dyn BrowserPresenter>,
        options: LoginOptions,
        on_progress: F,
    ) -> Result<Session, SessionError>
    where
        F: Fn(LoginProgress) + Send,
    {
        let metadata = self
            .inner
            .oauth
            .discover()
            .await
            .map_err(SessionError::ConfigLoad)?;
        on_progress(LoginProgress::ConfigurationLoaded);

        let mut extra_params: Vec<(&str, String)> = Vec::new();
        if !options.acr_values.is_empty() {
            extra_params.push(("acr_values", options.acr_values.join(" ")));
        }

        let mut prompt = options.prompt;
        if let Some(session) = self.current_session() {
            if let Some(acr) = session.acr() {
                let requested = options.acr_values.iter().any(|value| value == acr);
                if !requested && prompt != Some(Prompt::None) {
                    // Step-up: the provider must re-prompt for credentials
                    // instead of silently reusing the old method.
                    info!(
                        current_acr = acr,
                        "requested authentication context differs; forcing prompt=login"
                    );
                    prompt = Some(Prompt::Login);
                }
            }
        }
        if let Some(prompt) = prompt {
            extra_params.push(("prompt", prompt.to_string()));
        }

        let pkce = PkcePair::generate();
        let state = random_state(32);
        let auth_url = self.inner.oauth.authorization_url(
            &metadata,
            &pkce,
            &state,
            &options.extra_scopes,
            &extra_params,
        );

        let config = self.inner.oauth.config();
        let flow = Arc::new(LoginRedirectFlow::new(
            presenter,
            config.redirect_uri.clone(),
            config.secondary_resume_uri.clone(),
            state,
        ));
        let previous = self
            .inner
            .state
            .lock()
            .unwrap()
            .pending_login
            .replace(flow.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        on_progress(LoginProgress::BrowserWillAppear);
        let authorization = flow.authorize(&auth_url).await;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state
                .pending_login
                .as_ref()
                .is_some_and(|pending| Arc::ptr_eq(pending, &flow))
            {
                state.pending_login = None;
            }
        }
        on_progress(LoginProgress::BrowserDidDisappear);

        let authorization = authorization.map_err(|err| match err {
            FlowError::Present(PresentError::HostIntegration(message)) => {
                SessionError::InvalidHostIntegration(message)
            }
            other => SessionError::Flow(other),
        })?;

        let tokens = self
            .inner
            .oauth
            .exchange_code(&authorization.code, &pkce)
            .await
            .map_err(SessionError::TokenRequest)?;
        on_progress(LoginProgress::TokenExchangeCompleted);

        let id_token = tokens
            .id_token
            .ok_or(SessionError::IdTokenValidation(ValidationError::MissingIdToken))?;
        on_progress(LoginProgress::IdTokenWillValidate);
        self.inner
            .validator
            .validate(&id_token)
            .map_err(SessionError::IdTokenValidation)?;

        let session = Session::new(tokens.access_token, tokens.refresh_token, id_token);
        self.set_current(Some(session.clone()));
        self.persist(Some(&session));
        self.inner
            .observers
            .broadcast(|o| o.did_complete_login(&session));
        Ok(session)
    }

    /// End the session at the provider via the browser-delegated end-session
    /// flow, then locally.
    pub async fn logout(&self, presenter: Arc<dyn BrowserPresenter>) -> Result<(), SessionError> {
        // Probe refresh first: obtain a current ID token and verify the
        // session is actually meaningful before opening a browser.
        let session = match self.refresh_session().await {
            Ok(session) => session,
            Err(SessionError::NoSessionToRefresh) | Err(SessionError::NoSession) => {
                debug!("nothing to log out; clearing local state");
                self.clear_session_after_logout();
                return Ok(());
            }
            Err(err @ SessionError::RefreshOauth(_)) => return Err(err),
            Err(SessionError::RefreshNetwork) => return Err(SessionError::LogoutNetwork),
            Err(SessionError::RefreshServer(_)) => return Err(SessionError::LogoutServer),
            Err(_) => return Err(SessionError::Unknown),
        };

        let metadata = self
            .inner
            .oauth
            .discover()
            .await
            .map_err(SessionError::ConfigLoad)?;
        let Some(logout_url) = self.inner.oauth.end_session_url(&metadata, &session.id_token)
        else {
            return Err(SessionError::LogoutNoEndSessionUrl);
        };

        let config = self.inner.oauth.config();
        let flow = Arc::new(LogoutRedirectFlow::new(
            presenter,
            config.post_logout_redirect_uri.clone(),
        ));
        self.inner.state.lock().unwrap().pending_logout = Some(flow.clone());
        let outcome = flow.execute(&logout_url).await;
        {
            let mut state = self.inner.state.lock().unwrap();
            if state
                .pending_logout
                .as_ref()
                .is_some_and(|pending| Arc::ptr_eq(pending, &flow))
            {
                state.pending_logout = None;
            }
        }

        match outcome {
            LogoutOutcome::Success => {
                self.clear_session_after_logout();
                Ok(())
            }
            LogoutOutcome::UrlLoadError => Err(SessionError::LogoutNetwork),
            LogoutOutcome::Cancelled
            | LogoutOutcome::ManuallyDismissed
            | LogoutOutcome::FlowFailed(_) => {
                // Ambiguous resolution: probe the provider again. A refresh
                // that now fails with a rejection means the logout actually
                // went through server-side.
                debug!("logout resolution ambiguous; verifying via refresh");
                match self.refresh_session().await {
                    Err(SessionError::NoSessionToRefresh)
                    | Err(SessionError::RefreshOauth(_)) => {
                        self.clear_session_after_logout();
                        Ok(())
                    }
                    _ => Err(SessionError::LogoutServer),
                }
            }
        }
    }

    /// Clear all local session state. Idempotent; a persistence failure is
    /// logged, not raised.
    pub fn delete_all_data(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.current = None;
            state.initialized = false;
        }
        self.inner.observers.reset_initialized();
        if let Err(err) = self.inner.store.delete() {
            warn!("failed to delete persisted session: {err}");
        }
    }

    /// Host integration point: route an inbound redirect URL to whichever
    /// pending flow consumes it. Returns `false` when no flow claimed the
    /// URL so the host can route it elsewhere.
    pub fn resume_redirect(&self, url: &Url) -> bool {
        let (login, logout) = {
            let state = self.inner.state.lock().unwrap();
            (state.pending_login.clone(), state.pending_logout.clone())
        };
        if let Some(flow) = login {
            if flow.resume(url) {
                return true;
            }
        }
        if let Some(flow) = logout {
            if flow.resume(url) {
                return true;
            }
        }
        false
    }

    /// The host's presentation surface was closed by the user.
    pub fn surface_dismissed(&self) {
        let (login, logout) = {
            let state = self.inner.state.lock().unwrap();
            (state.pending_login.clone(), state.pending_logout.clone())
        };
        if let Some(flow) = login {
            flow.surface_dismissed();
        }
        if let Some(flow) = logout {
            flow.surface_dismissed();
        }
    }

    /// The presentation surface failed to load the logout page.
    pub fn logout_page_load_failed(&self) {
        let logout = self.inner.state.lock().unwrap().pending_logout.clone();
        if let Some(flow) = logout {
            flow.page_load_failed();
        }
    }

    fn clear_session_after_logout(&self) {
        self.set_current(None);
        if let Err(err) = self.inner.store.delete() {
            warn!("failed to delete persisted session: {err}");
        }
        self.inner.observers.broadcast(|o| o.did_logout());
    }

    fn start_reachability(&self) {
        {
            let state = self.inner.state.lock().unwrap();
            if state.reachability_started {
                return;
            }
        }
        let receiver = {
            let monitor = self.inner.reachability.lock().unwrap();
            let Some(monitor) = monitor.as_ref() else {
                return;
            };
            match monitor.start() {
                Ok(receiver) => receiver,
                Err(err) => {
                    warn!("failed to start reachability monitoring: {err}");
                    return;
                }
            }
        };
        self.inner.state.lock().unwrap().reachability_started = true;
        let manager = self.clone();
        tokio::spawn(async move {
            let mut receiver = receiver;
            while let Some(event) = receiver.recv().await {
                manager.handle_reachability(event);
            }
        });
    }

    fn handle_reachability(&self, event: ReachabilityEvent) {
        let transition = {
            let mut state = self.inner.state.lock().unwrap();
            match (&state.current, event) {
                (Some(session), ReachabilityEvent::Reachable) if !session.online => {
                    let session = session.clone().with_online(true);
                    state.current = Some(session.clone());
                    Some((session, true))
                }
                (Some(session), ReachabilityEvent::Unreachable) if session.online => {
                    let session = session.clone().with_online(false);
                    state.current = Some(session.clone());
                    Some((session, false))
                }
                _ => None,
            }
        };
        match transition {
            Some((session, true)) => {
                info!("network reachable; marking session online");
                self.inner
                    .observers
                    .broadcast(|o| o.did_regain_network_connection(&session));
            }
            Some((session, false)) => {
                info!("network unreachable; marking session offline");
                self.inner
                    .observers
                    .broadcast(|o| o.did_lose_network_connection(&session));
            }
            None => {}
        }
    }

    fn set_current(&self, session: Option<Session>) {
        self.inner.state.lock().unwrap().current = session;
    }

    fn current_online(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .current
            .as_ref()
            .is_some_and(|session| session.online)
    }

    fn mark_initialized(&self) {
        self.inner.state.lock().unwrap().initialized = true;
    }

    fn persist(&self, session: Option<&Session>) {
        if let Err(err) = self.inner.store.save(session) {
            warn!("failed to persist session: {err}");
        }
    }
}

fn join_outcome(stored: &Session, result: Result<RefreshOutcome, JoinError>) -> RefreshOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("refresh task failed to complete: {err}");
            RefreshOutcome::OfflineRetained(stored.clone().with_online(false))
        }
    }
}
