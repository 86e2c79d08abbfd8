use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a session's messages arrive from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Web,
    ChatPlatform,
    Other,
}

impl SessionOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionOrigin::Web => "web",
            SessionOrigin::ChatPlatform => "chat_platform",
            SessionOrigin::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(SessionOrigin::Web),
            "chat_platform" => Some(SessionOrigin::ChatPlatform),
            "other" => Some(SessionOrigin::Other),
            _ => None,
        }
    }
}

/// External thread coordinates for chat-platform sessions
/// (e.g. channel + thread timestamp). Unique per (workspace, origin).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadCoords {
    pub channel: Option<String>,
    pub thread: Option<String>,
}

impl ThreadCoords {
    pub fn is_empty(&self) -> bool {
        self.channel.is_none() && self.thread.is_none()
    }
}

/// A conversation. Owns its turns; deleting a session cascades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub workspace_id: String,
    pub origin: SessionOrigin,
    pub user_id: Option<String>,
    #[serde(default)]
    pub thread: ThreadCoords,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session titles default to a prefix of the first message.
pub fn default_title(first_message: &str) -> String {
    const MAX: usize = 80;
    let trimmed = first_message.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_round_trip() {
        for o in [SessionOrigin::Web, SessionOrigin::ChatPlatform, SessionOrigin::Other] {
            assert_eq!(SessionOrigin::parse(o.as_str()), Some(o));
        }
        assert_eq!(SessionOrigin::parse("irc"), None);
    }

    #[test]
    fn title_truncates_long_messages() {
        let long = "why is the checkout service timing out ".repeat(10);
        let title = default_title(&long);
        assert!(title.chars().count() <= 81);
        assert!(title.ends_with('…'));
    }

    #[test]
    fn title_keeps_short_messages() {
        assert_eq!(default_title("  why is api-gw slow?  "), "why is api-gw slow?");
    }
}
