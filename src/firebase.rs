//! Firebase REST backend: Firestore documents, Cloud Storage blobs and
//! Identity Toolkit accounts.
//!
//! Firestore wraps every value in a typed envelope (`{"stringValue": ..}`,
//! `{"timestampValue": ..}` and so on). The codec at the top of this module
//! converts between those envelopes and plain JSON so the rest of the crate
//! only sees the shapes in [`crate::model`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::identity::{
    AuthError, AuthListener, IdentityProvider, ListenerId, Listeners, OAuthProvider,
};
use crate::model::{Post, User};
use crate::oauth;
use crate::storage::{Account, StateStore, Token};
use crate::store::{BlobStore, DocumentStore, PageQuery, StoreError};

const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const AUTO_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub identity: String,
    pub secure_token: String,
    pub firestore: String,
    pub storage: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            identity: "https://identitytoolkit.googleapis.com/v1".into(),
            secure_token: "https://securetoken.googleapis.com/v1".into(),
            firestore: "https://firestore.googleapis.com/v1".into(),
            storage: "https://firebasestorage.googleapis.com/v0".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    pub api_key: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub endpoints: Endpoints,
    pub request_timeout: Duration,
}

impl FirebaseConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("firebase: api key is required");
        }
        if self.project_id.trim().is_empty() {
            anyhow::bail!("firebase: project id is required");
        }
        Ok(())
    }

    fn client(&self) -> anyhow::Result<Client> {
        Client::builder()
            .timeout(self.request_timeout)
            .build()
            .context("firebase: build http client")
    }
}

// ---------------------------------------------------------------------------
// Value codec

pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(map: &Map<String, Value>) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), encode_value(value)))
            .collect(),
    )
}

pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let Some((kind, inner)) = value.as_object().and_then(|obj| obj.iter().next()) else {
        return Err(StoreError::decode("firestore value", value));
    };
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" | "doubleValue" => Ok(inner.clone()),
        "integerValue" => {
            let parsed = match inner {
                Value::String(raw) => raw
                    .parse::<i64>()
                    .map_err(|err| StoreError::decode("integerValue", err))?,
                Value::Number(n) => n
                    .as_i64()
                    .ok_or_else(|| StoreError::decode("integerValue", n))?,
                other => return Err(StoreError::decode("integerValue", other)),
            };
            Ok(Value::from(parsed))
        }
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => Ok(inner.clone()),
        "geoPointValue" => Ok(inner.clone()),
        "arrayValue" => {
            let values = match inner.get("values").and_then(Value::as_array) {
                Some(values) => values.iter().map(decode_value).collect::<Result<_, _>>()?,
                None => Vec::new(),
            };
            Ok(Value::Array(values))
        }
        "mapValue" => Ok(Value::Object(decode_fields(
            inner.get("fields").unwrap_or(&Value::Null),
        )?)),
        other => Err(StoreError::decode("firestore value", format!("unknown type {other}"))),
    }
}

pub fn decode_fields(fields: &Value) -> Result<Map<String, Value>, StoreError> {
    match fields {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| decode_value(value).map(|decoded| (key.clone(), decoded)))
            .collect(),
        other => Err(StoreError::decode("firestore fields", other)),
    }
}

fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn decode_document(doc: &Value) -> Result<(String, Map<String, Value>), StoreError> {
    let name = doc
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::decode("firestore document", "missing name"))?;
    let fields = decode_fields(doc.get("fields").unwrap_or(&Value::Null))?;
    Ok((document_id(name).to_string(), fields))
}

fn post_from_document(doc: &Value) -> Result<Post, StoreError> {
    let (id, fields) = decode_document(doc)?;
    let mut post: Post = serde_json::from_value(Value::Object(fields))
        .map_err(|err| StoreError::decode(format!("post {id}"), err))?;
    post.id = id;
    Ok(post)
}

fn auto_id() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| AUTO_ID_ALPHABET[rng.gen_range(0..AUTO_ID_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|envelope| envelope.error.message)
        .or_else(|_| {
            serde_json::from_str::<Vec<ErrorEnvelope>>(body).map(|mut list| {
                list.pop()
                    .map(|envelope| envelope.error.message)
                    .unwrap_or_default()
            })
        })
        .unwrap_or_else(|_| body.trim().to_string())
}

fn check(resp: Response, what: &str) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(StoreError::Unauthenticated),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound(what.to_string())),
        _ => {
            let body = resp.text().unwrap_or_default();
            Err(StoreError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            })
        }
    }
}

/// Attaches the caller's ID token. Anonymous requests go out bare and are
/// left to the backend's security rules.
fn authorize(
    req: RequestBuilder,
    identity: &dyn IdentityProvider,
) -> Result<RequestBuilder, StoreError> {
    match identity.id_token() {
        Ok(token) => Ok(req.header(AUTHORIZATION, format!("Bearer {token}"))),
        Err(AuthError::NotSignedIn) => Ok(req),
        Err(err) => {
            tracing::warn!(error = %err, "could not obtain id token");
            Err(StoreError::Unauthenticated)
        }
    }
}

// ---------------------------------------------------------------------------
// Firestore

pub struct FirestoreStore {
    client: Client,
    base: String,
    root: String,
    identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
struct RunQueryItem {
    #[serde(default)]
    document: Option<Value>,
}

impl FirestoreStore {
    pub fn new(cfg: &FirebaseConfig, identity: Arc<dyn IdentityProvider>) -> anyhow::Result<Self> {
        cfg.validate()?;
        Ok(Self {
            client: cfg.client()?,
            base: cfg.endpoints.firestore.trim_end_matches('/').to_string(),
            root: format!("projects/{}/databases/(default)/documents", cfg.project_id),
            identity,
        })
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.root,
            utf8_percent_encode(collection, SEGMENT),
            utf8_percent_encode(id, SEGMENT)
        )
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.base, self.document_name(collection, id))
    }

    fn run_query(&self, structured: Value) -> Result<Vec<Post>, StoreError> {
        let url = format!("{}/{}:runQuery", self.base, self.root);
        let req = self
            .client
            .post(url)
            .json(&json!({ "structuredQuery": structured }));
        let resp = check(authorize(req, self.identity.as_ref())?.send()?, "query")?;
        let items: Vec<RunQueryItem> = resp
            .json()
            .map_err(|err| StoreError::decode("runQuery response", err))?;
        items
            .iter()
            .filter_map(|item| item.document.as_ref())
            .map(post_from_document)
            .collect()
    }
}

fn timestamp_value(at: DateTime<Utc>) -> Value {
    json!({ "timestampValue": at.to_rfc3339_opts(SecondsFormat::AutoSi, true) })
}

impl DocumentStore for FirestoreStore {
    fn query_page(&self, query: &PageQuery) -> Result<Vec<Post>, StoreError> {
        let direction = if query.descending {
            "DESCENDING"
        } else {
            "ASCENDING"
        };
        let mut structured = json!({
            "from": [{ "collectionId": query.collection }],
            "orderBy": [
                { "field": { "fieldPath": query.order_by }, "direction": direction },
                { "field": { "fieldPath": "__name__" }, "direction": direction },
            ],
            "limit": query.page_size,
        });
        if let Some(cursor) = &query.after {
            structured["startAt"] = json!({
                "values": [
                    timestamp_value(cursor.created_at()),
                    { "referenceValue": self.document_name(&query.collection, cursor.document_id()) },
                ],
                "before": false,
            });
        }
        tracing::debug!(
            collection = %query.collection,
            limit = query.page_size,
            "firestore page query"
        );
        self.run_query(structured)
    }

    fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Post>, StoreError> {
        self.run_query(json!({
            "from": [{ "collectionId": collection }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": { "stringValue": value },
                }
            },
        }))
    }

    fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let req = self.client.get(self.document_url(collection, id));
        let resp = match check(authorize(req, self.identity.as_ref())?.send()?, id) {
            Ok(resp) => resp,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let doc: Value = resp
            .json()
            .map_err(|err| StoreError::decode("document", err))?;
        let (_, fields) = decode_document(&doc)?;
        Ok(Some(Value::Object(fields)))
    }

    fn add_document(
        &self,
        collection: &str,
        fields: Value,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        let Value::Object(fields) = fields else {
            return Err(StoreError::decode("document fields", "expected an object"));
        };
        let id = auto_id();
        let mut write = json!({
            "update": {
                "name": self.document_name(collection, &id),
                "fields": encode_fields(&fields),
            },
            "currentDocument": { "exists": false },
        });
        if let Some(field) = server_timestamp {
            write["updateTransforms"] =
                json!([{ "fieldPath": field, "setToServerValue": "REQUEST_TIME" }]);
        }
        let url = format!("{}/{}:commit", self.base, self.root);
        let req = self.client.post(url).json(&json!({ "writes": [write] }));
        check(authorize(req, self.identity.as_ref())?.send()?, collection)?;
        tracing::debug!(%collection, %id, "document created");
        Ok(id)
    }

    fn merge_document(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        let Value::Object(fields) = fields else {
            return Err(StoreError::decode("document fields", "expected an object"));
        };
        let mask: Vec<(&str, &str)> = fields
            .keys()
            .map(|key| ("updateMask.fieldPaths", key.as_str()))
            .collect();
        let req = self
            .client
            .patch(self.document_url(collection, id))
            .query(&mask)
            .json(&json!({ "fields": encode_fields(&fields) }));
        check(authorize(req, self.identity.as_ref())?.send()?, id)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cloud Storage

pub struct FirebaseBlobStore {
    client: Client,
    bucket_url: String,
    identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    name: String,
    #[serde(default)]
    download_tokens: Option<String>,
}

impl FirebaseBlobStore {
    pub fn new(cfg: &FirebaseConfig, identity: Arc<dyn IdentityProvider>) -> anyhow::Result<Self> {
        cfg.validate()?;
        if cfg.storage_bucket.trim().is_empty() {
            anyhow::bail!("firebase: storage bucket is required");
        }
        Ok(Self {
            client: cfg.client()?,
            bucket_url: format!(
                "{}/b/{}/o",
                cfg.endpoints.storage.trim_end_matches('/'),
                utf8_percent_encode(&cfg.storage_bucket, SEGMENT)
            ),
            identity,
        })
    }

    fn download_url(&self, name: &str, token: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}?alt=media",
            self.bucket_url,
            utf8_percent_encode(name, SEGMENT)
        );
        if let Some(token) = token.and_then(|t| t.split(',').next()) {
            url.push_str("&token=");
            url.push_str(&utf8_percent_encode(token, SEGMENT).to_string());
        }
        url
    }
}

impl BlobStore for FirebaseBlobStore {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let size = bytes.len();
        let req = self
            .client
            .post(&self.bucket_url)
            .query(&[("name", path), ("uploadType", "media")])
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        let resp = check(authorize(req, self.identity.as_ref())?.send()?, path)?;
        let uploaded: UploadResponse = resp
            .json()
            .map_err(|err| StoreError::decode("upload response", err))?;
        tracing::debug!(%path, size, "blob uploaded");
        Ok(self.download_url(&uploaded.name, uploaded.download_tokens.as_deref()))
    }
}

// ---------------------------------------------------------------------------
// Identity Toolkit

struct SignedIn {
    user: User,
    email: String,
    token: Token,
}

type OpenUrl = Box<dyn Fn(&str) + Send + Sync>;

pub struct FirebaseIdentity {
    cfg: FirebaseConfig,
    client: Client,
    state: Option<StateStore>,
    oauth: Option<(oauth::Config, OpenUrl)>,
    current: RwLock<Option<SignedIn>>,
    listeners: Listeners,
    refresh_skew: chrono::Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

fn expires_at(expires_in: Option<&str>) -> DateTime<Utc> {
    let secs = expires_in
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(3600);
    Utc::now() + chrono::Duration::seconds(secs)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Maps an Identity Toolkit failure to the error the caller sees.
fn identity_error(body: &str) -> AuthError {
    let message = error_message(body);
    let code = message
        .split(|c: char| c == ' ' || c == ':')
        .next()
        .unwrap_or_default();
    match code {
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" | "INVALID_EMAIL"
        | "MISSING_PASSWORD" | "USER_DISABLED" => AuthError::InvalidCredentials,
        _ => AuthError::Provider(message),
    }
}

impl FirebaseIdentity {
    pub fn new(cfg: FirebaseConfig, state: Option<StateStore>) -> anyhow::Result<Self> {
        cfg.validate()?;
        Ok(Self {
            client: cfg.client()?,
            cfg,
            state,
            oauth: None,
            current: RwLock::new(None),
            listeners: Listeners::default(),
            refresh_skew: chrono::Duration::seconds(60),
        })
    }

    /// Enables Google sign-in. `open_url` is handed the consent page URL.
    pub fn with_oauth(
        mut self,
        cfg: oauth::Config,
        open_url: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.oauth = Some((cfg, Box::new(open_url)));
        self
    }

    /// Restores the last signed-in account from local state without a
    /// network round trip. The ID token is refreshed on first use.
    pub fn resume(&self) -> anyhow::Result<Option<User>> {
        let Some(state) = &self.state else {
            return Ok(None);
        };
        let Some(account) = state.active_account()? else {
            return Ok(None);
        };
        let Some(token) = state.get_token(&account.uid)? else {
            return Ok(None);
        };
        let user = account.user();
        *self.current.write() = Some(SignedIn {
            user: user.clone(),
            email: account.email,
            token,
        });
        Ok(Some(user))
    }

    fn endpoint(&self, base: &str, method: &str) -> String {
        format!(
            "{}/{}?key={}",
            base.trim_end_matches('/'),
            method,
            utf8_percent_encode(&self.cfg.api_key, SEGMENT)
        )
    }

    fn post_identity<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
    ) -> Result<T, AuthError> {
        let resp = self
            .client
            .post(self.endpoint(&self.cfg.endpoints.identity, method))
            .json(&body)
            .send()?;
        if !resp.status().is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(identity_error(&body));
        }
        resp.json()
            .map_err(|err| AuthError::Provider(format!("decode {method}: {err}")))
    }

    fn lookup(&self, id_token: &str) -> Result<Option<LookupUser>, AuthError> {
        let resp: LookupResponse =
            self.post_identity("accounts:lookup", json!({ "idToken": id_token }))?;
        Ok(resp.users.into_iter().next())
    }

    fn establish(&self, signed: SignInResponse) -> Result<User, AuthError> {
        let mut display_name = non_empty(signed.display_name);
        let mut photo_url = non_empty(signed.photo_url);
        if display_name.is_none() || photo_url.is_none() {
            match self.lookup(&signed.id_token) {
                Ok(Some(profile)) => {
                    display_name = display_name.or(non_empty(profile.display_name));
                    photo_url = photo_url.or(non_empty(profile.photo_url));
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(error = %err, "account lookup failed"),
            }
        }
        let user = User {
            uid: signed.local_id,
            display_name,
            photo_url,
        };
        let token = Token {
            uid: user.uid.clone(),
            id_token: signed.id_token,
            refresh_token: signed.refresh_token,
            expires_at: expires_at(signed.expires_in.as_deref()),
        };
        self.persist(&user, &signed.email, &token)?;
        *self.current.write() = Some(SignedIn {
            user: user.clone(),
            email: signed.email,
            token,
        });
        tracing::info!(uid = %user.uid, "signed in");
        self.listeners.notify(Some(&user));
        Ok(user)
    }

    fn persist(&self, user: &User, email: &str, token: &Token) -> Result<(), AuthError> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        state
            .upsert_account(Account::new(user, email))
            .and_then(|_| state.upsert_token(token.clone()))
            .map_err(|err| AuthError::Storage(format!("{err:#}")))
    }

    fn refresh(&self, current: &Token) -> Result<Token, AuthError> {
        let resp = self
            .client
            .post(self.endpoint(&self.cfg.endpoints.secure_token, "token"))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
            ])
            .send()?;
        if !resp.status().is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(AuthError::Provider(format!(
                "token refresh failed: {}",
                error_message(&body)
            )));
        }
        let payload: RefreshResponse = resp
            .json()
            .map_err(|err| AuthError::Provider(format!("decode token refresh: {err}")))?;
        tracing::debug!(uid = %current.uid, "id token refreshed");
        Ok(Token {
            uid: current.uid.clone(),
            id_token: payload.id_token,
            refresh_token: payload.refresh_token,
            expires_at: expires_at(payload.expires_in.as_deref()),
        })
    }
}

impl IdentityProvider for FirebaseIdentity {
    fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let signed: SignInResponse = self.post_identity(
            "accounts:signInWithPassword",
            json!({
                "email": email.trim(),
                "password": password,
                "returnSecureToken": true,
            }),
        )?;
        self.establish(signed)
    }

    fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<User, AuthError> {
        let Some((cfg, open_url)) = &self.oauth else {
            return Err(AuthError::Unsupported(provider));
        };
        let flow = oauth::Flow::new(cfg.clone())
            .map_err(|err| AuthError::Provider(format!("{err:#}")))?;
        let authz = flow
            .begin()
            .map_err(|err| AuthError::Provider(format!("{err:#}")))?;
        open_url(&authz.browser_url);
        let tokens = flow.complete(authz).map_err(|err| {
            if err.downcast_ref::<oauth::WaitTimedOut>().is_some() {
                AuthError::Cancelled
            } else {
                AuthError::Provider(format!("{err:#}"))
            }
        })?;

        let post_body = format!(
            "id_token={}&providerId={}",
            utf8_percent_encode(&tokens.id_token, SEGMENT),
            provider.provider_id()
        );
        let signed: SignInResponse = self.post_identity(
            "accounts:signInWithIdp",
            json!({
                "postBody": post_body,
                "requestUri": "http://localhost",
                "returnIdpCredential": true,
                "returnSecureToken": true,
            }),
        )?;
        self.establish(signed)
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        let previous = self.current.write().take();
        let forgotten = match (&self.state, &previous) {
            (Some(state), Some(signed)) => state
                .delete_token(&signed.user.uid)
                .map(|_| ())
                .map_err(|err| AuthError::Storage(format!("{err:#}"))),
            _ => Ok(()),
        };
        if previous.is_some() {
            tracing::info!("signed out");
        }
        // Listeners follow the in-memory state even when the stored token
        // could not be removed.
        self.listeners.notify(None);
        forgotten
    }

    fn current_user(&self) -> Option<User> {
        self.current.read().as_ref().map(|signed| signed.user.clone())
    }

    fn id_token(&self) -> Result<String, AuthError> {
        let (user, email, token) = {
            let guard = self.current.read();
            let signed = guard.as_ref().ok_or(AuthError::NotSignedIn)?;
            (signed.user.clone(), signed.email.clone(), signed.token.clone())
        };
        if !token.is_expired(Utc::now(), self.refresh_skew) {
            return Ok(token.id_token);
        }
        let fresh = self.refresh(&token)?;
        self.persist(&user, &email, &fresh)?;
        let id_token = fresh.id_token.clone();
        if let Some(signed) = self.current.write().as_mut() {
            if signed.user.uid == user.uid {
                signed.token = fresh;
            }
        }
        Ok(id_token)
    }

    fn add_listener(&self, listener: AuthListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}
