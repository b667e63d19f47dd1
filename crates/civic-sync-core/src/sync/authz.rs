//! Authorization seam
//!
//! Who may see or write which entity types is decided outside the engine.
//! The engine only asks.

use std::collections::BTreeSet;

use async_trait::async_trait;

/// Entity types a user may download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    All,
    EntityTypes(BTreeSet<String>),
}

impl Visibility {
    pub fn allows(&self, entity_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::EntityTypes(types) => types.contains(entity_type),
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn visibility(&self, user_id: &str) -> Visibility;

    async fn can_write(&self, user_id: &str, entity_type: &str) -> bool;
}

/// Grants every user full access
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn visibility(&self, _user_id: &str) -> Visibility {
        Visibility::All
    }

    async fn can_write(&self, _user_id: &str, _entity_type: &str) -> bool {
        true
    }
}

/// Static per-deployment allow-lists; `None` means unrestricted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTypeAllowList {
    readable: Option<BTreeSet<String>>,
    writable: Option<BTreeSet<String>>,
}

impl EntityTypeAllowList {
    pub const fn new(
        readable: Option<BTreeSet<String>>,
        writable: Option<BTreeSet<String>>,
    ) -> Self {
        Self { readable, writable }
    }
}

#[async_trait]
impl Authorizer for EntityTypeAllowList {
    async fn visibility(&self, _user_id: &str) -> Visibility {
        self.readable
            .clone()
            .map_or(Visibility::All, Visibility::EntityTypes)
    }

    async fn can_write(&self, _user_id: &str, entity_type: &str) -> bool {
        self.writable
            .as_ref()
            .is_none_or(|types| types.contains(entity_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_allow_list_restricts_writes() {
        let authz = EntityTypeAllowList::new(None, Some(set(&["report"])));
        assert!(authz.can_write("u", "report").await);
        assert!(!authz.can_write("u", "comment").await);
        assert_eq!(authz.visibility("u").await, Visibility::All);
    }

    #[tokio::test]
    async fn test_allow_list_restricts_visibility() {
        let authz = EntityTypeAllowList::new(Some(set(&["report", "comment"])), None);
        let visibility = authz.visibility("u").await;
        assert!(visibility.allows("comment"));
        assert!(!visibility.allows("internal_note"));
        assert!(authz.can_write("u", "anything").await);
    }
}
