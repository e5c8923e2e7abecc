use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const POSTS_COLLECTION: &str = "posts";
pub const USERS_COLLECTION: &str = "users";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const USER_ID_FIELD: &str = "userId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Anything that is not an image is treated as video.
    pub fn from_mime(mime: &str) -> Self {
        if mime.trim().to_ascii_lowercase().starts_with("image/") {
            MediaKind::Image
        } else {
            MediaKind::Video
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Vec<Media>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_avatar: String,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn has_video(&self) -> bool {
        self.media.iter().any(|media| media.kind == MediaKind::Video)
    }

    pub fn first_video(&self) -> Option<&Media> {
        self.media.iter().find(|media| media.kind == MediaKind::Video)
    }
}

/// Document body written when a post is created. `created_at` is filled in
/// by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub text: String,
    pub media: Vec<Media>,
    pub user_id: String,
    pub user_name: String,
    pub user_avatar: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
}

impl User {
    pub fn display_label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "photoURL")]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl Profile {
    pub fn bio_or_default(&self) -> &str {
        self.bio
            .as_deref()
            .filter(|bio| !bio.trim().is_empty())
            .unwrap_or("No bio yet")
    }
}

/// Renders `at` relative to `now`, e.g. "5 minutes ago".
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(at);
    let future = delta.num_seconds() < 0;
    let secs = delta.num_seconds().unsigned_abs();

    let (value, unit) = if secs < 45 {
        return "less than a minute ago".to_string();
    } else if secs < 90 * 60 {
        (secs.div_ceil(60).max(1), "minute")
    } else if secs < 24 * 60 * 60 {
        ((secs + 1800) / 3600, "hour")
    } else if secs < 30 * 24 * 60 * 60 {
        ((secs + 43_200) / 86_400, "day")
    } else if secs < 365 * 24 * 60 * 60 {
        ((secs + 15 * 86_400) / (30 * 86_400), "month")
    } else {
        (secs / (365 * 86_400), "year")
    };

    let plural = if value == 1 { "" } else { "s" };
    if future {
        format!("in {value} {unit}{plural}")
    } else {
        format!("{value} {unit}{plural} ago")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn media_kind_from_mime() {
        assert_eq!(MediaKind::from_mime("image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mime("video/mp4"), MediaKind::Video);
        assert_eq!(
            MediaKind::from_mime("application/octet-stream"),
            MediaKind::Video
        );
    }

    #[test]
    fn decodes_post_document() {
        let raw = serde_json::json!({
            "text": "hello",
            "media": [{"url": "https://cdn.test/a.mp4", "type": "video"}],
            "userId": "u1",
            "userName": "Ada",
            "userAvatar": "https://cdn.test/ada.png",
            "createdAt": "2024-05-01T10:00:00Z"
        });
        let post: Post = serde_json::from_value(raw).unwrap();
        assert_eq!(post.user_name, "Ada");
        assert!(post.has_video());
        assert_eq!(post.first_video().unwrap().url, "https://cdn.test/a.mp4");
    }

    #[test]
    fn relative_time_buckets() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(relative_time(now, now), "less than a minute ago");
        assert_eq!(relative_time(now - Duration::minutes(5), now), "5 minutes ago");
        assert_eq!(relative_time(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(relative_time(now - Duration::days(1), now), "1 day ago");
    }

    #[test]
    fn profile_defaults() {
        let profile = Profile::default();
        assert_eq!(profile.bio_or_default(), "No bio yet");
    }
}
