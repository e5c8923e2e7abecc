use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use image::ImageFormat;

use crate::model::{Media, MediaKind, NewPost, User, CREATED_AT_FIELD, POSTS_COLLECTION};
use crate::store::{BlobStore, DocumentStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("compose: a post needs text or at least one file")]
    Empty,
    #[error("compose: sign in to post")]
    NotSignedIn,
    #[error("compose: upload {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("compose: save post: {0}")]
    Store(#[source] StoreError),
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("compose: read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self { name, bytes })
    }

    pub fn mime(&self) -> String {
        detect_mime(&self.bytes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl Draft {
    /// Only a draft with no text at all and no files is empty; whitespace
    /// counts as text.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }
}

pub struct PostComposer {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
}

impl PostComposer {
    pub fn new(documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { documents, blobs }
    }

    pub fn create_post(&self, author: Option<&User>, draft: Draft) -> Result<String, ComposeError> {
        self.create_post_with(author, draft, &mut |_| {})
    }

    /// Uploads the attachments in order, then writes the post document.
    /// `on_upload` is called with each blob path before it is sent.
    ///
    /// An upload failure stops the whole post. Blobs uploaded before the
    /// failure stay in the blob store.
    pub fn create_post_with(
        &self,
        author: Option<&User>,
        draft: Draft,
        on_upload: &mut dyn FnMut(&str),
    ) -> Result<String, ComposeError> {
        if draft.is_empty() {
            return Err(ComposeError::Empty);
        }
        let author = author.ok_or(ComposeError::NotSignedIn)?;

        let mut media = Vec::with_capacity(draft.attachments.len());
        let mut uploaded: Vec<String> = Vec::new();
        for attachment in draft.attachments {
            let path = blob_path(&attachment.name);
            let mime = attachment.mime();
            on_upload(&path);
            match self.blobs.upload(&path, attachment.bytes, &mime) {
                Ok(url) => {
                    media.push(Media {
                        url,
                        kind: MediaKind::from_mime(&mime),
                    });
                    uploaded.push(path);
                }
                Err(source) => {
                    if !uploaded.is_empty() {
                        tracing::warn!(orphaned = ?uploaded, "post aborted after partial upload");
                    }
                    return Err(ComposeError::Upload { path, source });
                }
            }
        }

        let post = NewPost {
            text: draft.text,
            media,
            user_id: author.uid.clone(),
            user_name: author.display_label().to_string(),
            user_avatar: author.photo_url.clone().unwrap_or_default(),
        };
        let fields = serde_json::to_value(&post)
            .map_err(|err| ComposeError::Store(StoreError::decode("new post", err)))?;
        let id = self
            .documents
            .add_document(POSTS_COLLECTION, fields, Some(CREATED_AT_FIELD))
            .map_err(ComposeError::Store)?;
        tracing::info!(%id, uid = %author.uid, media = post.media.len(), "post created");
        Ok(id)
    }
}

fn blob_path(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("upload");
    format!("posts/{}_{}", Utc::now().timestamp_millis(), base)
}

fn detect_mime(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg".into(),
        Ok(ImageFormat::Png) => "image/png".into(),
        Ok(ImageFormat::Gif) => "image/gif".into(),
        Ok(ImageFormat::WebP) => "image/webp".into(),
        _ => {
            let mut buffer = [0u8; 512];
            let mut cursor = std::io::Cursor::new(bytes);
            let read = cursor.read(&mut buffer).unwrap_or(0);
            tree_magic_mini::from_u8(&buffer[..read]).to_string()
        }
    }
}
