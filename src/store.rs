use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::model::{Post, CREATED_AT_FIELD};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store: transport error: {0}")]
    Transport(String),
    #[error("store: request failed with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("store: decode {what}: {message}")]
    Decode { what: String, message: String },
    #[error("store: {0} not found")]
    NotFound(String),
    #[error("store: not signed in")]
    Unauthenticated,
}

impl StoreError {
    pub fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Decode {
            what: what.into(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

/// Position after a fetched document. Only the pager and store
/// implementations look inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    document_id: String,
    created_at: DateTime<Utc>,
}

impl Cursor {
    pub fn after(post: &Post) -> Self {
        Self {
            document_id: post.id.clone(),
            created_at: post.created_at,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub collection: String,
    pub order_by: String,
    pub descending: bool,
    pub page_size: usize,
    pub after: Option<Cursor>,
}

impl PageQuery {
    /// Newest-first page of `posts`.
    pub fn posts(page_size: usize, after: Option<Cursor>) -> Self {
        Self {
            collection: crate::model::POSTS_COLLECTION.to_string(),
            order_by: CREATED_AT_FIELD.to_string(),
            descending: true,
            page_size,
            after,
        }
    }
}

pub trait DocumentStore: Send + Sync {
    /// Ordered page of posts starting strictly after `query.after`.
    fn query_page(&self, query: &PageQuery) -> Result<Vec<Post>, StoreError>;

    /// Every post whose `field` equals `value`. No ordering guarantee.
    fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Post>, StoreError>;

    fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Creates a document with a store-assigned id. When `server_timestamp`
    /// names a field, the store sets it to its own clock.
    fn add_document(
        &self,
        collection: &str,
        fields: Value,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError>;

    /// Merges `fields` into the document, creating it if missing.
    fn merge_document(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError>;
}

pub trait BlobStore: Send + Sync {
    /// Stores `bytes` at `path` and returns a URL that serves them.
    fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredDocument {
    id: String,
    fields: Map<String, Value>,
}

#[derive(Default)]
struct MemoryInner {
    collections: HashMap<String, Vec<StoredDocument>>,
    blobs: HashMap<String, (String, Vec<u8>)>,
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Process-local document and blob store. Backs the offline demo and tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a handful of posts so the feed has something to page through.
    pub fn demo(count: usize) -> Self {
        let store = Self::new();
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 9, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let authors = [("ada", "Ada"), ("linus", "Linus"), ("grace", "Grace")];
        for idx in 0..count {
            let (uid, name) = authors[idx % authors.len()];
            let media = if idx % 5 == 4 {
                vec![crate::model::Media {
                    url: format!("memory://posts/demo_{idx}.mp4"),
                    kind: crate::model::MediaKind::Video,
                }]
            } else {
                Vec::new()
            };
            store.insert_post(Post {
                id: format!("demo-{idx:04}"),
                text: format!("Demo post #{idx} from {name}"),
                media,
                user_id: uid.to_string(),
                user_name: name.to_string(),
                user_avatar: String::new(),
                created_at: base + Duration::minutes(idx as i64),
            });
        }
        store
    }

    /// Inserts a post with its own id and timestamp.
    pub fn insert_post(&self, post: Post) {
        let fields = match serde_json::to_value(&post) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let mut inner = self.inner.lock();
        inner
            .collections
            .entry(crate::model::POSTS_COLLECTION.to_string())
            .or_default()
            .push(StoredDocument {
                id: post.id,
                fields,
            });
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn blob(&self, path: &str) -> Option<(String, Vec<u8>)> {
        self.inner.lock().blobs.get(path).cloned()
    }

    pub fn blob_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.lock().blobs.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn sorted_posts(inner: &MemoryInner, collection: &str) -> Result<Vec<Post>, StoreError> {
        let mut posts = inner
            .collections
            .get(collection)
            .map(|docs| docs.iter().map(decode_post).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        posts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(posts)
    }

    fn server_now(inner: &mut MemoryInner) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = inner.last_timestamp {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        inner.last_timestamp = Some(now);
        now
    }
}

fn decode_post(doc: &StoredDocument) -> Result<Post, StoreError> {
    let mut post: Post = serde_json::from_value(Value::Object(doc.fields.clone()))
        .map_err(|err| StoreError::decode(format!("post {}", doc.id), err))?;
    post.id = doc.id.clone();
    Ok(post)
}

impl DocumentStore for MemoryStore {
    fn query_page(&self, query: &PageQuery) -> Result<Vec<Post>, StoreError> {
        let inner = self.inner.lock();
        let mut posts = Self::sorted_posts(&inner, &query.collection)?;
        if !query.descending {
            posts.reverse();
        }
        let start = match &query.after {
            Some(cursor) => posts
                .iter()
                .position(|post| {
                    let key = (post.created_at, post.id.as_str());
                    let at = (cursor.created_at(), cursor.document_id());
                    if query.descending {
                        key < at
                    } else {
                        key > at
                    }
                })
                .unwrap_or(posts.len()),
            None => 0,
        };
        Ok(posts
            .into_iter()
            .skip(start)
            .take(query.page_size)
            .collect())
    }

    fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<Post>, StoreError> {
        let inner = self.inner.lock();
        inner
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| doc.fields.get(field).and_then(Value::as_str) == Some(value))
                    .map(decode_post)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .map(Option::unwrap_or_default)
    }

    fn get_document(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.collections.get(collection).and_then(|docs| {
            docs.iter()
                .find(|doc| doc.id == id)
                .map(|doc| Value::Object(doc.fields.clone()))
        }))
    }

    fn add_document(
        &self,
        collection: &str,
        fields: Value,
        server_timestamp: Option<&str>,
    ) -> Result<String, StoreError> {
        let Value::Object(mut fields) = fields else {
            return Err(StoreError::decode("document fields", "expected an object"));
        };
        let mut inner = self.inner.lock();
        if let Some(field) = server_timestamp {
            let now = Self::server_now(&mut inner);
            fields.insert(field.to_string(), Value::String(now.to_rfc3339()));
        }
        inner.next_id += 1;
        let id = format!("doc-{:06}", inner.next_id);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(StoredDocument {
                id: id.clone(),
                fields,
            });
        Ok(id)
    }

    fn merge_document(&self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError> {
        let Value::Object(fields) = fields else {
            return Err(StoreError::decode("document fields", "expected an object"));
        };
        let mut inner = self.inner.lock();
        let docs = inner.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|doc| doc.id == id) {
            Some(doc) => doc.fields.extend(fields),
            None => docs.push(StoredDocument {
                id: id.to_string(),
                fields,
            }),
        }
        Ok(())
    }
}

impl BlobStore for MemoryStore {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StoreError> {
        if path.trim().is_empty() {
            return Err(StoreError::decode("blob path", "path required"));
        }
        self.inner
            .lock()
            .blobs
            .insert(path.to_string(), (content_type.to_string(), bytes));
        Ok(format!("memory://{path}"))
    }
}
