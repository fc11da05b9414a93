//! Correlation of inbound redirect URLs with pending login/logout flows.
//!
//! Both the browser surface's own callbacks and externally-delivered URL
//! events route through the same `resume` entry point; a flow reports
//! whether it consumed the URL so hosts can route unrelated events
//! elsewhere.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::browser::{BrowserPresenter, PresentError};

/// Errors terminating a login redirect flow.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("authorization server returned '{error}'{}", description.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Oauth {
        error: String,
        description: Option<String>,
    },
    #[error("authorization response state did not match the request")]
    StateMismatch,
    #[error("authorization response missing code parameter")]
    MissingCode,
    #[error("secondary resume URL missing or invalid return_url parameter")]
    InvalidResumeUrl,
    #[error("authorization flow cancelled")]
    Cancelled,
    #[error(transparent)]
    Present(#[from] PresentError),
}

/// A matched, state-checked authorization response.
#[derive(Debug, Clone)]
pub struct AuthorizationResponse {
    pub code: String,
    pub state: String,
}

/// Compare two URLs for flow-resolution purposes: scheme, username,
/// password, host, port, and path must be equal; query and fragment are
/// ignored.
pub fn redirect_target_matches(candidate: &Url, expected: &Url) -> bool {
    candidate.scheme() == expected.scheme()
        && candidate.username() == expected.username()
        && candidate.password() == expected.password()
        && candidate.host() == expected.host()
        && candidate.port() == expected.port()
        && candidate.path() == expected.path()
}

/// Pending login operation awaiting its redirect.
///
/// At most one login flow is pending at a time; the completion fires exactly
/// once. Supports the two-phase secondary-resume handoff where an external
/// app returns control mid-flow before the final redirect.
pub struct LoginRedirectFlow {
    presenter: Arc<dyn BrowserPresenter>,
    redirect_uri: Url,
    secondary_resume_uri: Option<Url>,
    state: String,
    inner: Mutex<LoginFlowInner>,
}

struct LoginFlowInner {
    completion: Option<oneshot::Sender<Result<AuthorizationResponse, FlowError>>>,
    /// Set only when a matched redirect resolved the flow; distinguishes a
    /// flow-driven dismissal from the user closing the surface.
    resolved_by_redirect: bool,
    secondary_active: bool,
}

impl LoginRedirectFlow {
    pub fn new(
        presenter: Arc<dyn BrowserPresenter>,
        redirect_uri: Url,
        secondary_resume_uri: Option<Url>,
        state: String,
    ) -> Self {
        Self {
            presenter,
            redirect_uri,
            secondary_resume_uri,
            state,
            inner: Mutex::new(LoginFlowInner {
                completion: None,
                resolved_by_redirect: false,
                secondary_active: false,
            }),
        }
    }

    /// Present the authorization URL and wait for the flow to resolve.
    pub async fn authorize(&self, auth_url: &Url) -> Result<AuthorizationResponse, FlowError> {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            inner.completion = Some(tx);
            rx
        };

        if let Err(err) = self.presenter.present(auth_url) {
            self.inner.lock().unwrap().completion = None;
            return Err(err.into());
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(FlowError::Cancelled),
        }
    }

    /// Try to consume an inbound redirect URL. Returns `false` when the URL
    /// belongs to neither the secondary-resume target nor the expected
    /// redirect URI.
    pub fn resume(&self, url: &Url) -> bool {
        if let Some(secondary) = &self.secondary_resume_uri {
            if redirect_target_matches(url, secondary) {
                self.resume_secondary(url);
                return true;
            }
        }

        if !redirect_target_matches(url, &self.redirect_uri) {
            return false;
        }

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut error_description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            self.fail(FlowError::Oauth {
                error,
                description: error_description,
            });
            return true;
        }

        // The anti-forgery check is mandatory even for otherwise well-formed
        // responses.
        if state.as_deref() != Some(self.state.as_str()) {
            self.fail(FlowError::StateMismatch);
            return true;
        }

        let Some(code) = code else {
            self.fail(FlowError::MissingCode);
            return true;
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.resolved_by_redirect = true;
            // A still-running secondary presentation is abandoned with the
            // primary dismissal below.
            inner.secondary_active = false;
        }
        self.presenter.dismiss();
        self.complete(Ok(AuthorizationResponse {
            code,
            state: self.state.clone(),
        }));
        true
    }

    /// Two-phase handoff: an external app returned control carrying the URL
    /// the flow must continue at.
    fn resume_secondary(&self, url: &Url) {
        let return_url = url
            .query_pairs()
            .find(|(key, _)| key == "return_url")
            .map(|(_, value)| value.into_owned());
        let Some(target) = return_url.and_then(|raw| Url::parse(&raw).ok()) else {
            self.fail(FlowError::InvalidResumeUrl);
            return;
        };

        debug!(%target, "continuing login via secondary resume");
        self.inner.lock().unwrap().secondary_active = true;
        if let Err(err) = self.presenter.present(&target) {
            self.fail(err.into());
        }
    }

    /// Explicit cancellation by the caller.
    pub fn cancel(&self) {
        self.presenter.dismiss();
        self.complete(Err(FlowError::Cancelled));
    }

    /// The user closed the presentation surface. Resolves the flow as
    /// cancelled unless a matched redirect already resolved it.
    pub fn surface_dismissed(&self) {
        let resolved = self.inner.lock().unwrap().resolved_by_redirect;
        if !resolved {
            self.complete(Err(FlowError::Cancelled));
        }
    }

    pub fn secondary_active(&self) -> bool {
        self.inner.lock().unwrap().secondary_active
    }

    fn fail(&self, error: FlowError) {
        self.presenter.dismiss();
        self.complete(Err(error));
    }

    fn complete(&self, result: Result<AuthorizationResponse, FlowError>) {
        let sender = self.inner.lock().unwrap().completion.take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

/// Terminal outcome of a logout redirect flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// The logout redirect arrived; the provider ended the session.
    Success,
    Cancelled,
    /// The user closed the surface before any redirect matched; whether the
    /// provider ended the session is unknown and must be re-verified.
    ManuallyDismissed,
    /// The logout page failed to load; session state is untouched.
    UrlLoadError,
    FlowFailed(String),
}

/// Pending logout operation awaiting the configured logout redirect.
pub struct LogoutRedirectFlow {
    presenter: Arc<dyn BrowserPresenter>,
    redirect_uri: Url,
    inner: Mutex<LogoutFlowInner>,
}

struct LogoutFlowInner {
    completion: Option<oneshot::Sender<LogoutOutcome>>,
    resolved_by_redirect: bool,
}

impl LogoutRedirectFlow {
    pub fn new(presenter: Arc<dyn BrowserPresenter>, redirect_uri: Url) -> Self {
        Self {
            presenter,
            redirect_uri,
            inner: Mutex::new(LogoutFlowInner {
                completion: None,
                resolved_by_redirect: false,
            }),
        }
    }

    /// Present the end-session URL and wait for the flow to resolve.
    pub async fn execute(&self, logout_url: &Url) -> LogoutOutcome {
        let receiver = {
            let mut inner = self.inner.lock().unwrap();
            let (tx, rx) = oneshot::channel();
            inner.completion = Some(tx);
            rx
        };

        if let Err(err) = self.presenter.present(logout_url) {
            self.inner.lock().unwrap().completion = None;
            return match err {
                PresentError::LoadFailed(_) => LogoutOutcome::UrlLoadError,
                other => LogoutOutcome::FlowFailed(other.to_string()),
            };
        }

        receiver.await.unwrap_or(LogoutOutcome::Cancelled)
    }

    pub fn resume(&self, url: &Url) -> bool {
        if !redirect_target_matches(url, &self.redirect_uri) {
            return false;
        }
        self.inner.lock().unwrap().resolved_by_redirect = true;
        self.presenter.dismiss();
        self.complete(LogoutOutcome::Success);
        true
    }

    pub fn surface_dismissed(&self) {
        let resolved = self.inner.lock().unwrap().resolved_by_redirect;
        if !resolved {
            self.complete(LogoutOutcome::ManuallyDismissed);
        }
    }

    /// The presentation surface reported the logout page failed to load.
    pub fn page_load_failed(&self) {
        self.presenter.dismiss();
        self.complete(LogoutOutcome::UrlLoadError);
    }

    /// Kept for host symmetry with the login flow; the lifecycle manager
    /// itself never cancels a logout.
    pub fn cancel(&self) {
        self.presenter.dismiss();
        self.complete(LogoutOutcome::Cancelled);
    }

    fn complete(&self, outcome: LogoutOutcome) {
        let sender = self.inner.lock().unwrap().completion.take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Presenter that records presented URLs and dismissals.
    #[derive(Default)]
    pub struct RecordingPresenter {
        pub presented: Mutex<Vec<Url>>,
        pub dismissed: Mutex<usize>,
        pub fail_with: Mutex<Option<PresentError>>,
    }

    impl RecordingPresenter {
        pub fn presented_urls(&self) -> Vec<Url> {
            self.presented.lock().unwrap().clone()
        }

        pub fn dismiss_count(&self) -> usize {
            *self.dismissed.lock().unwrap()
        }
    }

    impl BrowserPresenter for RecordingPresenter {
        fn present(&self, url: &Url) -> Result<(), PresentError> {
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            self.presented.lock().unwrap().push(url.clone());
            Ok(())
        }

        fn dismiss(&self) {
            *self.dismissed.lock().unwrap() += 1;
        }
    }
}
