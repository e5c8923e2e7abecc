use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use rand::RngCore;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tiny_http::{Header, Method, Response, Server};
use url::Url;

static HTML_SUCCESS: Lazy<String> = Lazy::new(|| {
    r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>socialfeed sign-in complete</title>
    <style>
      body {
        margin: 0;
        min-height: 100vh;
        display: flex;
        align-items: center;
        justify-content: center;
        font-family: "Segoe UI", -apple-system, sans-serif;
        background: #f4f5f7;
        color: #1d2129;
      }
      .card {
        background: #fff;
        padding: 2rem 2.5rem;
        border-radius: 12px;
        box-shadow: 0 8px 24px rgba(0, 0, 0, 0.08);
        text-align: center;
      }
    </style>
  </head>
  <body>
    <main class="card">
      <h1>Signed in</h1>
      <p>You can close this tab and return to the terminal.</p>
    </main>
  </body>
</html>"#
        .to_string()
});

/// Google authorization-code flow with PKCE, redirected to a loopback listener.
#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    pub scope: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    /// How long to wait for the browser to come back.
    pub wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scope: vec!["openid".into(), "email".into(), "profile".into()],
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            redirect_uri: "http://127.0.0.1:0/socialfeed/callback".into(),
            wait_timeout: Duration::from_secs(300),
        }
    }
}

pub struct Flow {
    cfg: Config,
    client: Client,
}

pub struct AuthorizationRequest {
    pub browser_url: String,
    pub redirect_uri: String,
    verifier: String,
    rx: Receiver<AuthResult>,
    server: Arc<Server>,
    listener: Option<JoinHandle<()>>,
}

impl Drop for AuthorizationRequest {
    /// Wakes the listener thread and waits for it, releasing the port.
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

struct AuthResult {
    code: Option<String>,
    error: Option<anyhow::Error>,
}

/// Tokens returned by the Google token endpoint.
#[derive(Debug, Clone)]
pub struct GoogleTokens {
    pub id_token: String,
}

#[derive(Debug, thiserror::Error)]
#[error("oauth: no redirect received within {0:?}")]
pub struct WaitTimedOut(pub Duration);

impl Flow {
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.client_id.trim().is_empty() {
            bail!("oauth: client id is required");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("oauth: build http client")?;
        Ok(Self { cfg, client })
    }

    pub fn begin(&self) -> Result<AuthorizationRequest> {
        let verifier = random_string(64);
        let challenge = code_challenge(&verifier);
        let state = random_string(32);

        let redirect = Url::parse(&self.cfg.redirect_uri).context("oauth: parse redirect uri")?;
        let host = redirect.host_str().unwrap_or("127.0.0.1");
        let port = redirect.port().unwrap_or(0);
        let path = if redirect.path().is_empty() {
            "/"
        } else {
            redirect.path()
        };

        let server = Arc::new(
            Server::http(format!("{host}:{port}"))
                .map_err(|err| anyhow!("oauth: listen: {err}"))?,
        );
        let actual_redirect = Url::parse(&format!("http://{}{}", server.server_addr(), path))?;
        let browser_url = self.authorize_url(actual_redirect.as_str(), &state, &challenge)?;

        let (result_tx, result_rx) = bounded::<AuthResult>(1);

        let incoming = server.clone();
        let listener = thread::spawn(move || {
            for request in incoming.incoming_requests() {
                match handle_redirect(request, &state, &result_tx) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(err) => {
                        let _ = result_tx.send(AuthResult {
                            code: None,
                            error: Some(err),
                        });
                        break;
                    }
                }
            }
        });

        tracing::debug!(redirect = %actual_redirect, "listening for oauth redirect");
        Ok(AuthorizationRequest {
            browser_url,
            redirect_uri: actual_redirect.to_string(),
            verifier,
            rx: result_rx,
            server,
            listener: Some(listener),
        })
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str, challenge: &str) -> Result<String> {
        let mut auth = Url::parse(&self.cfg.auth_url).context("oauth: parse auth url")?;
        auth.query_pairs_mut()
            .append_pair("client_id", &self.cfg.client_id)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", &self.cfg.scope.join(" "))
            .append_pair("prompt", "select_account")
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(auth.to_string())
    }

    pub fn complete(&self, authz: AuthorizationRequest) -> Result<GoogleTokens> {
        let code = self.wait_for_code(&authz)?;
        self.exchange_code(&code, &authz)
    }

    fn wait_for_code(&self, authz: &AuthorizationRequest) -> Result<String> {
        match authz.rx.recv_timeout(self.cfg.wait_timeout) {
            Ok(AuthResult {
                code: Some(code), ..
            }) => Ok(code),
            Ok(AuthResult {
                error: Some(err), ..
            }) => Err(err),
            Ok(_) => Err(anyhow!("oauth: authorization cancelled")),
            Err(RecvTimeoutError::Timeout) => Err(WaitTimedOut(self.cfg.wait_timeout).into()),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("oauth: listener stopped")),
        }
    }

    fn exchange_code(&self, code: &str, authz: &AuthorizationRequest) -> Result<GoogleTokens> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", authz.redirect_uri.as_str()),
            ("code_verifier", authz.verifier.as_str()),
            ("client_id", self.cfg.client_id.as_str()),
        ];
        if !self.cfg.client_secret.is_empty() {
            form.push(("client_secret", self.cfg.client_secret.as_str()));
        }

        let resp = self
            .client
            .post(&self.cfg.token_url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&form)
            .send()
            .context("oauth: token request")?;
        if !resp.status().is_success() {
            let body = resp.text().unwrap_or_default();
            if let Ok(err) = serde_json::from_str::<TokenError>(&body) {
                bail!("oauth: token request failed: {err}");
            }
            bail!("oauth: token request failed: {body}");
        }

        let payload: TokenResponse = resp.json().context("oauth: decode token response")?;
        if payload.id_token.is_empty() {
            bail!("oauth: token response missing id_token (is the openid scope set?)");
        }
        Ok(GoogleTokens {
            id_token: payload.id_token,
        })
    }
}

fn random_string(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn fail(tx: &Sender<AuthResult>, err: anyhow::Error) -> Result<bool> {
    tx.send(AuthResult {
        code: None,
        error: Some(err),
    })
    .ok();
    Ok(true)
}

/// Returns `Ok(false)` for requests that are not the redirect (favicon and the like).
fn handle_redirect(req: tiny_http::Request, state: &str, tx: &Sender<AuthResult>) -> Result<bool> {
    if req.method() != &Method::Get {
        let _ = req.respond(Response::from_string("method not allowed").with_status_code(405));
        return Ok(false);
    }

    let url = Url::parse(&format!("http://loopback{}", req.url()))?;
    let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
    if params.is_empty() {
        let _ = req.respond(Response::from_string("not found").with_status_code(404));
        return Ok(false);
    }

    if params.get("state").map(String::as_str) != Some(state) {
        let _ = req.respond(Response::from_string("state mismatch").with_status_code(400));
        return fail(tx, anyhow!("oauth: authorization state mismatch"));
    }

    if let Some(error) = params.get("error") {
        let _ = req.respond(Response::from_string("authorization denied").with_status_code(401));
        let description = params.get("error_description").cloned().unwrap_or_default();
        return fail(tx, anyhow!("oauth: authorization error: {error} ({description})"));
    }

    let code = match params.get("code") {
        Some(code) if !code.is_empty() => code.clone(),
        _ => {
            let _ = req.respond(Response::from_string("code missing").with_status_code(400));
            return fail(tx, anyhow!("oauth: authorization code missing"));
        }
    };

    let mut response = Response::from_string(HTML_SUCCESS.as_str());
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
    {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
    tx.send(AuthResult {
        code: Some(code),
        error: None,
    })
    .ok();
    Ok(true)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "error_description")]
    description: String,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.error.is_empty(), self.description.is_empty()) {
            (true, true) => write!(f, "unknown token error"),
            (false, true) => write!(f, "{}", self.error),
            (true, false) => write!(f, "{}", self.description),
            (false, false) => write!(f, "{} ({})", self.error, self.description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;

    fn flow() -> Flow {
        Flow::new(Config {
            client_id: "client-123".into(),
            ..Config::default()
        })
        .unwrap()
    }

    fn get(redirect_uri: &str, query: &str) -> String {
        let url = Url::parse(redirect_uri).unwrap();
        let mut stream = TcpStream::connect((
            url.host_str().unwrap(),
            url.port().unwrap(),
        ))
        .unwrap();
        let request = format!(
            "GET {}?{} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            url.path(),
            query
        );
        std::io::Write::write_all(&mut stream, request.as_bytes()).unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        body
    }

    #[test]
    fn requires_client_id() {
        assert!(Flow::new(Config::default()).is_err());
    }

    #[test]
    fn challenge_is_sha256_of_verifier() {
        // RFC 7636 appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGkSMw-cM"
        );
    }

    #[test]
    fn authorize_url_carries_pkce_and_scope() {
        let flow = flow();
        let authz = flow.begin().unwrap();
        let url = Url::parse(&authz.browser_url).unwrap();
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client-123");
        assert_eq!(params["scope"], "openid email profile");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], code_challenge(&authz.verifier));
        assert_eq!(params["redirect_uri"], authz.redirect_uri);
        assert!(authz.redirect_uri.ends_with("/socialfeed/callback"));
    }

    #[test]
    fn redirect_with_code_is_delivered() {
        let flow = flow();
        let authz = flow.begin().unwrap();
        let state = Url::parse(&authz.browser_url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        let body = get(&authz.redirect_uri, &format!("state={state}&code=abc"));
        assert!(body.contains("Signed in"));
        assert_eq!(flow.wait_for_code(&authz).unwrap(), "abc");
    }

    #[test]
    fn state_mismatch_is_rejected() {
        let flow = flow();
        let authz = flow.begin().unwrap();
        let body = get(&authz.redirect_uri, "state=forged&code=abc");
        assert!(body.contains("400"));
        let err = flow.wait_for_code(&authz).unwrap_err();
        assert!(err.to_string().contains("state mismatch"));
    }

    #[test]
    fn waiting_gives_up() {
        let flow = Flow::new(Config {
            client_id: "client-123".into(),
            wait_timeout: Duration::from_millis(20),
            ..Config::default()
        })
        .unwrap();
        let authz = flow.begin().unwrap();
        let err = flow.wait_for_code(&authz).unwrap_err();
        assert!(err.downcast_ref::<WaitTimedOut>().is_some());
    }

    #[test]
    fn dropping_the_request_stops_the_listener() {
        let flow = flow();
        let authz = flow.begin().unwrap();
        let (done_tx, done_rx) = bounded(1);
        thread::spawn(move || {
            drop(authz);
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
