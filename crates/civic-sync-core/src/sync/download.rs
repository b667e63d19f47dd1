//! Incremental download paging

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use super::Visibility;
use crate::error::{Error, Result};
use crate::models::Change;
use crate::store::EntityStore;

const TOKEN_PREFIX: &str = "v1:";

/// Opaque continuation token: the last version delivered on the previous page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageToken {
    pub after_version: i64,
}

impl PageToken {
    pub fn encode(self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{TOKEN_PREFIX}{}", self.after_version))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let invalid = || Error::InvalidPageToken(token.to_string());

        let bytes = URL_SAFE_NO_PAD.decode(token.trim()).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let after_version = text
            .strip_prefix(TOKEN_PREFIX)
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|version| *version >= 0)
            .ok_or_else(invalid)?;

        Ok(Self { after_version })
    }
}

/// One page of changes, ordered by version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadPage {
    pub changes: Vec<Change>,
    pub next_page_token: Option<String>,
    /// Device cursor after this page
    pub cursor_version: i64,
}

/// Fetch up to `page_size` changes after `after_version`
///
/// Returns the changes and whether more remain beyond them.
pub(crate) async fn fetch_page(
    store: &dyn EntityStore,
    after_version: i64,
    visibility: &Visibility,
    page_size: usize,
) -> Result<(Vec<Change>, bool)> {
    let mut changes = store
        .changes_since(after_version, visibility, page_size + 1)
        .await?;
    let has_more = changes.len() > page_size;
    changes.truncate(page_size);
    Ok((changes, has_more))
}
