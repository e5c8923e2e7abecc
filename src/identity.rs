use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::model::User;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth: invalid credentials")]
    InvalidCredentials,
    #[error("auth: provider error: {0}")]
    Provider(String),
    #[error("auth: sign-in cancelled")]
    Cancelled,
    #[error("auth: not signed in")]
    NotSignedIn,
    #[error("auth: session storage: {0}")]
    Storage(String),
    #[error("auth: {0} sign-in is not configured")]
    Unsupported(OAuthProvider),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Provider(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn provider_id(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google.com",
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OAuthProvider::Google => write!(f, "Google"),
        }
    }
}

impl FromStr for OAuthProvider {
    type Err = AuthError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "google" | "google.com" => Ok(OAuthProvider::Google),
            other => Err(AuthError::Provider(format!("unknown provider {other:?}"))),
        }
    }
}

pub type AuthListener = Box<dyn Fn(Option<&User>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub trait IdentityProvider: Send + Sync {
    fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError>;
    fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<User, AuthError>;
    fn sign_out(&self) -> Result<(), AuthError>;
    fn current_user(&self) -> Option<User>;
    /// Bearer token for backend calls on behalf of the current user.
    fn id_token(&self) -> Result<String, AuthError>;
    /// Registers a callback for every sign-in and sign-out.
    fn add_listener(&self, listener: AuthListener) -> ListenerId;
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Auth-state listener list shared by provider implementations.
#[derive(Default)]
pub struct Listeners {
    entries: Mutex<Vec<(ListenerId, AuthListener)>>,
    next_id: AtomicU64,
}

impl Listeners {
    pub fn add(&self, listener: AuthListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.entries.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, user: Option<&User>) {
        for (_, listener) in self.entries.lock().iter() {
            listener(user);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct LocalAccount {
    password: String,
    user: User,
}

/// In-process identity provider for the offline backend.
#[derive(Default)]
pub struct LocalIdentity {
    accounts: RwLock<HashMap<String, LocalAccount>>,
    current: RwLock<Option<User>>,
    listeners: Listeners,
}

impl LocalIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, email: &str, password: &str, user: User) {
        self.accounts.write().insert(
            email.trim().to_ascii_lowercase(),
            LocalAccount {
                password: password.to_string(),
                user,
            },
        );
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl IdentityProvider for LocalIdentity {
    fn sign_in(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = {
            let accounts = self.accounts.read();
            let account = accounts
                .get(&email.trim().to_ascii_lowercase())
                .ok_or(AuthError::InvalidCredentials)?;
            if account.password != password {
                return Err(AuthError::InvalidCredentials);
            }
            account.user.clone()
        };
        *self.current.write() = Some(user.clone());
        self.listeners.notify(Some(&user));
        Ok(user)
    }

    fn sign_in_with_oauth(&self, provider: OAuthProvider) -> Result<User, AuthError> {
        Err(AuthError::Unsupported(provider))
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        *self.current.write() = None;
        self.listeners.notify(None);
        Ok(())
    }

    fn current_user(&self) -> Option<User> {
        self.current.read().clone()
    }

    fn id_token(&self) -> Result<String, AuthError> {
        self.current
            .read()
            .as_ref()
            .map(|user| format!("local:{}", user.uid))
            .ok_or(AuthError::NotSignedIn)
    }

    fn add_listener(&self, listener: AuthListener) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ada() -> User {
        User {
            uid: "u-ada".into(),
            display_name: Some("Ada".into()),
            photo_url: None,
        }
    }

    #[test]
    fn local_sign_in_checks_password() {
        let identity = LocalIdentity::new();
        identity.register("Ada@Example.com", "secret", ada());
        assert!(matches!(
            identity.sign_in("ada@example.com", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        let user = identity.sign_in("ada@example.com", "secret").unwrap();
        assert_eq!(user.uid, "u-ada");
        assert_eq!(identity.id_token().unwrap(), "local:u-ada");
    }

    #[test]
    fn listeners_see_sign_in_and_out() {
        let identity = LocalIdentity::new();
        identity.register("ada@example.com", "secret", ada());
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
        let sink = seen.clone();
        let id = identity.add_listener(Box::new(move |user| {
            sink.lock().push(user.map(|u| u.uid.clone()));
        }));

        identity.sign_in("ada@example.com", "secret").unwrap();
        identity.sign_out().unwrap();
        assert!(identity.remove_listener(id));
        assert!(!identity.remove_listener(id));
        identity.sign_in("ada@example.com", "secret").unwrap();

        assert_eq!(*seen.lock(), vec![Some("u-ada".to_string()), None]);
    }

    #[test]
    fn parses_provider_names() {
        assert_eq!("google".parse::<OAuthProvider>().unwrap(), OAuthProvider::Google);
        assert!("myspace".parse::<OAuthProvider>().is_err());
        assert!(matches!(
            LocalIdentity::new().sign_in_with_oauth(OAuthProvider::Google),
            Err(AuthError::Unsupported(OAuthProvider::Google))
        ));
    }
}
