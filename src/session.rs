use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::identity::{AuthError, IdentityProvider, ListenerId, OAuthProvider};
use crate::model::User;

/// Signed-in state for the whole process. Created once at startup with
/// [`Session::init`] and torn down with [`Session::close`]; everything that
/// needs the current user gets the session passed in.
pub struct Session {
    provider: Arc<dyn IdentityProvider>,
    current: Arc<RwLock<Option<User>>>,
    listener: Mutex<Option<ListenerId>>,
}

impl Session {
    pub fn init(provider: Arc<dyn IdentityProvider>) -> Self {
        let current = Arc::new(RwLock::new(provider.current_user()));
        let sink = current.clone();
        let listener = provider.add_listener(Box::new(move |user| {
            *sink.write() = user.cloned();
        }));
        if let Some(user) = current.read().as_ref() {
            tracing::info!(uid = %user.uid, "resumed session");
        }
        Self {
            provider,
            current,
            listener: Mutex::new(Some(listener)),
        }
    }

    pub fn current_user(&self) -> Option<User> {
        self.current.read().clone()
    }

    pub fn require_user(&self) -> Result<User, AuthError> {
        self.current_user().ok_or(AuthError::NotSignedIn)
    }

    pub fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        self.provider.sign_in(email, password).inspect_err(|err| {
            tracing::warn!(error = %err, "password sign-in failed");
        })
    }

    pub fn login_with(&self, provider: OAuthProvider) -> Result<User, AuthError> {
        self.provider
            .sign_in_with_oauth(provider)
            .inspect_err(|err| {
                tracing::warn!(error = %err, %provider, "oauth sign-in failed");
            })
    }

    pub fn logout(&self) -> Result<(), AuthError> {
        self.provider.sign_out().inspect_err(|err| {
            tracing::warn!(error = %err, "sign-out failed");
        })
    }

    /// Unsubscribes from the provider. Safe to call more than once.
    pub fn close(&self) {
        if let Some(id) = self.listener.lock().take() {
            self.provider.remove_listener(id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Message shown to the user for a failed sign-in. Failure causes are not
/// distinguished.
pub fn login_failure_message(provider: Option<OAuthProvider>) -> String {
    match provider {
        Some(provider) => format!("Failed to log in with {provider}"),
        None => "Failed to log in".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;

    fn identity() -> Arc<LocalIdentity> {
        let identity = Arc::new(LocalIdentity::new());
        identity.register(
            "grace@example.com",
            "cobol",
            User {
                uid: "u-grace".into(),
                display_name: Some("Grace".into()),
                photo_url: None,
            },
        );
        identity
    }

    #[test]
    fn tracks_provider_changes() {
        let identity = identity();
        let session = Session::init(identity.clone());
        assert!(session.current_user().is_none());
        assert!(matches!(session.require_user(), Err(AuthError::NotSignedIn)));

        session.login("grace@example.com", "cobol").unwrap();
        assert_eq!(session.require_user().unwrap().uid, "u-grace");

        // Changes made directly on the provider are observed too.
        identity.sign_out().unwrap();
        assert!(session.current_user().is_none());
    }

    #[test]
    fn close_unsubscribes_once() {
        let identity = identity();
        let session = Session::init(identity.clone());
        assert_eq!(identity.listener_count(), 1);
        session.close();
        session.close();
        assert_eq!(identity.listener_count(), 0);
        drop(session);
        assert_eq!(identity.listener_count(), 0);
    }

    #[test]
    fn failure_messages_are_generic() {
        let session = Session::init(identity());
        let err = session.login("grace@example.com", "fortran").unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(login_failure_message(None), "Failed to log in");
        assert_eq!(
            login_failure_message(Some(OAuthProvider::Google)),
            "Failed to log in with Google"
        );
    }
}
