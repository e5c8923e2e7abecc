use std::sync::Arc;

use serde_json::{json, Value};

use crate::model::{Post, Profile, User, POSTS_COLLECTION, USERS_COLLECTION, USER_ID_FIELD};
use crate::store::{DocumentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile: only the owner can edit this profile")]
    NotOwner,
    #[error("profile: sign in to edit your profile")]
    NotSignedIn,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ProfilePage {
    pub uid: String,
    pub profile: Profile,
    /// Newest first.
    pub posts: Vec<Post>,
}

impl ProfilePage {
    pub fn can_edit(&self, viewer: Option<&User>) -> bool {
        viewer.is_some_and(|user| user.uid == self.uid)
    }
}

pub struct Profiles {
    documents: Arc<dyn DocumentStore>,
}

impl Profiles {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub fn load(&self, uid: &str) -> Result<ProfilePage, ProfileError> {
        let profile = match self.documents.get_document(USERS_COLLECTION, uid)? {
            Some(doc) => serde_json::from_value(doc)
                .map_err(|err| StoreError::decode(format!("profile {uid}"), err))?,
            None => Profile::default(),
        };
        let mut posts = self
            .documents
            .query_by_field(POSTS_COLLECTION, USER_ID_FIELD, uid)?;
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        tracing::debug!(%uid, posts = posts.len(), "profile loaded");
        Ok(ProfilePage {
            uid: uid.to_string(),
            profile,
            posts,
        })
    }

    pub fn update_bio(
        &self,
        viewer: Option<&User>,
        uid: &str,
        bio: &str,
    ) -> Result<(), ProfileError> {
        let viewer = viewer.ok_or(ProfileError::NotSignedIn)?;
        if viewer.uid != uid {
            return Err(ProfileError::NotOwner);
        }
        self.documents
            .merge_document(USERS_COLLECTION, uid, json!({ "bio": bio.trim() }))?;
        Ok(())
    }

    /// Creates or refreshes the viewer's `users/{uid}` document from their
    /// account details. Existing fields not named here are left alone.
    pub fn ensure(&self, user: &User) -> Result<(), ProfileError> {
        let mut fields = serde_json::Map::new();
        if let Some(name) = &user.display_name {
            fields.insert("displayName".into(), Value::String(name.clone()));
        }
        if let Some(photo) = &user.photo_url {
            fields.insert("photoURL".into(), Value::String(photo.clone()));
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.documents
            .merge_document(USERS_COLLECTION, &user.uid, Value::Object(fields))?;
        Ok(())
    }
}
