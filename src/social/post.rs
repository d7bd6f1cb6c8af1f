use serde::{Deserialize, Serialize};

use crate::ids::PostId;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageData {
    pub uri: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A post as shared by an actor.
///
/// `created_at` is wall-clock milliseconds and is only used for display
/// ordering; log ordering uses command timestamps.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub text: String,
    pub images: Vec<ImageData>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub link: Option<String>,
}

impl Post {
    pub fn new(id: PostId, text: impl Into<String>, created_at: i64) -> Self {
        Post {
            id,
            text: text.into(),
            images: Vec::new(),
            created_at,
            updated_at: None,
            link: None,
        }
    }

    /// New post with a random id, created now.
    pub fn with_text(text: impl Into<String>) -> Self {
        Post::new(PostId::random(), text, chrono::Utc::now().timestamp_millis())
    }

    /// Body carried by a Remove command: id and creation time survive,
    /// content is cleared.
    pub fn tombstone(&self) -> Post {
        Post {
            id: self.id.clone(),
            text: String::new(),
            images: Vec::new(),
            created_at: self.created_at,
            updated_at: None,
            link: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.text.is_empty() && self.images.is_empty() && self.link.is_none()
    }
}
