use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

const REDIRECT_HTML: &str = r#"<html><body><h1>Authentication step complete</h1><p>You may close this window and return to the application.</p></body></html>"#;

/// Errors a presentation surface can report.
#[derive(Debug, Clone, Error)]
pub enum PresentError {
    /// The host application is missing the wiring required to route
    /// redirects back into the flow.
    #[error("host integration missing: {0}")]
    HostIntegration(String),
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("failed to load URL: {0}")]
    LoadFailed(String),
}

/// On-screen browser surface collaborator.
///
/// The lifecycle never renders anything itself; it asks the presenter to
/// show a URL and to dismiss the surface once a redirect resolved the flow.
/// Redirect URLs themselves arrive through the host's redirect wiring, not
/// through this trait.
pub trait BrowserPresenter: Send + Sync {
    fn present(&self, url: &Url) -> Result<(), PresentError>;
    fn dismiss(&self);
}

/// Presenter that opens URLs in the system default browser.
///
/// A system browser tab cannot be closed remotely, so `dismiss` is a no-op;
/// the redirect page tells the user to close the window.
pub struct SystemBrowser;

impl BrowserPresenter for SystemBrowser {
    fn present(&self, url: &Url) -> Result<(), PresentError> {
        open::that(url.as_str()).map_err(|err| PresentError::Launch(err.to_string()))
    }

    fn dismiss(&self) {}
}

/// Errors from the loopback redirect listener.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed redirect request: {0}")]
    Malformed(String),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// One-shot loopback HTTP listener that turns a browser redirect into a URL
/// event for [`crate::manager::SessionManager::resume_redirect`].
///
/// This is the terminal-host equivalent of an application's deep-link
/// wiring: hosts that register a custom URL scheme feed the manager
/// directly instead.
pub struct LoopbackRedirectListener {
    listener: TcpListener,
    port: u16,
}

impl LoopbackRedirectListener {
    /// Bind an ephemeral port on 127.0.0.1.
    pub async fn bind() -> Result<Self, ListenError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The redirect URI to register with the provider for this listener.
    pub fn redirect_uri(&self, path: &str) -> Result<Url, ListenError> {
        Ok(Url::parse(&format!("http://127.0.0.1:{}{path}", self.port))?)
    }

    /// Accept a single redirect request and return the full URL the browser
    /// was sent to. Replies with a small HTML page telling the user to
    /// return to the application.
    pub async fn accept_redirect(self) -> Result<Url, ListenError> {
        let (mut stream, _addr) = self.listener.accept().await?;
        let mut buffer = [0u8; 4096];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);
        let path = parse_request_path(&request)?;
        let url = Url::parse(&format!("http://127.0.0.1:{}{path}", self.port))?;
        respond(&mut stream, REDIRECT_HTML).await?;
        let _ = stream.shutdown().await;
        Ok(url)
    }
}

fn parse_request_path(request: &str) -> Result<&str, ListenError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| ListenError::Malformed("missing request line".into()))?;
    let mut parts = first_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| ListenError::Malformed("missing method".into()))?;
    let path = parts
        .next()
        .ok_or_else(|| ListenError::Malformed("missing path".into()))?;
    Ok(path)
}

async fn respond(stream: &mut TcpStream, body: &str) -> Result<(), ListenError> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
