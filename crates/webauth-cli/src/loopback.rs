use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use webauth_core::{AuthError, Navigator, SessionKey, SessionStore};

const SUCCESS_HTML: &str = r#"<html><body><h1>Signed in</h1><p>You can close this tab and return to the terminal.</p></body></html>"#;
const ERROR_HTML: &str = r#"<html><body><h1>Sign-in failed</h1><p>Return to the terminal for details.</p></body></html>"#;

/// Receives the authorization redirect on a loopback socket.
pub struct RedirectListener {
    listener: TcpListener,
    redirect_uri: Url,
}

/// Bind the loopback listener; port 0 picks a free one.
pub async fn bind(port: u16) -> Result<RedirectListener> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = Url::parse(&format!("http://127.0.0.1:{port}/callback"))?;
    Ok(RedirectListener {
        listener,
        redirect_uri,
    })
}

impl RedirectListener {
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Accept exactly one redirect request, validate the echoed state against
    /// the persisted one, and return the full callback URL.
    pub async fn accept_redirect(self, store: &dyn SessionStore) -> Result<Url> {
        let (mut stream, _addr) = self.listener.accept().await?;
        let mut buffer = [0u8; 4096];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);
        let path = request_path(&request)?;
        let callback = self.redirect_uri.join(path)?;

        let mut code: Option<String> = None;
        let mut state: Option<String> = None;
        let mut error: Option<String> = None;
        for (key, value) in callback.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(err) = error {
            respond(&mut stream, 400, ERROR_HTML).await?;
            bail!("authorization request denied ({err})");
        }
        if code.is_none() {
            respond(&mut stream, 400, ERROR_HTML).await?;
            bail!("authorization response carried no code parameter");
        }
        let expected = store.get(SessionKey::State);
        if state.as_deref() != expected.as_deref() {
            respond(&mut stream, 400, ERROR_HTML).await?;
            bail!("authorization state mismatch");
        }

        respond(&mut stream, 200, SUCCESS_HTML).await?;
        let _ = stream.shutdown().await;
        Ok(callback)
    }
}

fn request_path(request: &str) -> Result<&str> {
    let first_line = request.lines().next().context("empty redirect request")?;
    let mut parts = first_line.split_whitespace();
    parts.next().context("redirect request missing method")?;
    parts.next().context("redirect request missing path")
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Navigator for a terminal host: the "current location" is the callback URL
/// captured by the listener, and a redirect opens the system browser.
pub struct LoopbackNavigator {
    location: Mutex<Option<Url>>,
    open_browser: bool,
}

impl LoopbackNavigator {
    pub fn new(open_browser: bool) -> Self {
        Self {
            location: Mutex::new(None),
            open_browser,
        }
    }

    /// Adopt the callback URL captured by the redirect listener.
    pub fn set_location(&self, url: Url) {
        *self.location.lock().unwrap() = Some(url);
    }
}

impl Navigator for LoopbackNavigator {
    fn current_url(&self) -> Option<Url> {
        self.location.lock().unwrap().clone()
    }

    fn redirect(&self, url: &Url) -> Result<(), AuthError> {
        println!("Continue sign-in at:\n  {url}");
        if self.open_browser {
            open::that(url.as_str())?;
        }
        Ok(())
    }

    fn replace(&self, url: &Url) {
        *self.location.lock().unwrap() = Some(url.clone());
    }
}
