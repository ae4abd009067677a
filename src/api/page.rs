use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const DEFAULT_PAGE_LIMIT: u16 = 100;
pub const MAX_PAGE_LIMIT: u16 = 100;

/// Opaque cursor into a listing: which page, and how many items per page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub page: u32,
    pub limit: u16,
}

impl Default for PageToken {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageToken {
    pub fn new(page: u32, limit: u16) -> Self {
        Self { page, limit }
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            limit: self.limit,
        }
    }

    pub fn encode(&self) -> String {
        // A two-field struct always serializes.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = URL_SAFE
            .decode(raw)
            .map_err(|e| FleetError::InvalidPageToken(format!("bad encoding: {}", e)))?;
        let token: PageToken = serde_json::from_slice(&bytes)
            .map_err(|e| FleetError::InvalidPageToken(format!("bad contents: {}", e)))?;
        token.validate()?;
        Ok(token)
    }

    fn validate(&self) -> Result<()> {
        if self.page == 0 {
            return Err(FleetError::InvalidPageToken("page must be at least 1".into()));
        }
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(FleetError::InvalidPageToken(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }
        Ok(())
    }
}

/// Cut one page out of `all`. The returned token points at the following
/// page and is only present when items remain after this one.
pub fn paginate<T>(mut all: Vec<T>, token: PageToken) -> (Vec<T>, Option<PageToken>) {
    let total = all.len();
    let limit = token.limit as usize;
    let start = (token.page as usize).saturating_sub(1).saturating_mul(limit);
    if start >= total {
        return (Vec::new(), None);
    }
    let stop = start.saturating_add(limit).min(total);
    let next = (stop < total).then(|| token.next());

    all.truncate(stop);
    (all.split_off(start), next)
}
