use std::collections::HashMap;
use std::path::PathBuf;
use async_trait::async_trait;
use serde::Deserialize;
use shared::types::Friend;
use crate::error::{Error, Result};

/// Supplies an owner's friend list from the social graph.
///
/// An outage must surface as `FriendSourceUnavailable`; returning an empty
/// list would tell the owner they have no friends.
#[async_trait]
pub trait FriendSource: Send + Sync {
    async fn friends_of(&self, owner_id: &str) -> Result<Vec<Friend>>;
}

/// Layout of the friend-graph export:
///
/// ```toml
/// [[friends."100001"]]
/// friend_id = "100002"
/// name = "Alice"
/// ```
#[derive(Debug, Default, Deserialize)]
struct FriendGraph {
    #[serde(default)]
    friends: HashMap<String, Vec<Friend>>,
}

/// Reads a friend-graph export maintained by the social-graph sync. The file
/// is re-read on every lookup so updates apply without a restart.
pub struct FileFriendSource {
    path: PathBuf,
}

impl FileFriendSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FriendSource for FileFriendSource {
    async fn friends_of(&self, owner_id: &str) -> Result<Vec<Friend>> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::friend_source(format!("failed to read {}: {}", self.path.display(), e))
        })?;

        let mut graph: FriendGraph = toml::from_str(&contents).map_err(|e| {
            Error::friend_source(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        Ok(graph.friends.remove(owner_id).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_owner_friends_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [[friends."owner"]]
            friend_id = "B"
            name = "Bob"

            [[friends."owner"]]
            friend_id = "A"
            name = "Alice"
            picture_url = "https://example.org/a.png"
            "#
        )
        .unwrap();

        let source = FileFriendSource::new(file.path());
        let friends = source.friends_of("owner").await.unwrap();

        assert_eq!(friends.len(), 2);
        assert_eq!(friends[0].friend_id, "B");
        assert_eq!(friends[1].picture_url.as_deref(), Some("https://example.org/a.png"));
        assert!(source.friends_of("stranger").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let source = FileFriendSource::new("/nonexistent/friends.toml");

        assert!(matches!(
            source.friends_of("owner").await,
            Err(Error::FriendSourceUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_unavailable() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "friends = [[[").unwrap();

        let source = FileFriendSource::new(file.path());
        assert!(matches!(
            source.friends_of("owner").await,
            Err(Error::FriendSourceUnavailable(_))
        ));
    }
}
