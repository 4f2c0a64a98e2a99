//! Hostname resolution against the registry.

use std::sync::Arc;

use crate::error::DiscoveryError;
use crate::registry::Registry;
use crate::service::ServiceRecord;

/// A registered service matching a query name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The owning service.
    pub record: Arc<ServiceRecord>,
    /// The registered hostname that matched (unqualified).
    pub matched_hostname: String,
}

/// Find the service that owns a fully-qualified query name.
///
/// Matching is exact and case-sensitive against `<hostname>.`; callers pass
/// the name as it arrived on the wire (hickory lowercases it).
pub fn resolve(registry: &Registry, query_name: &str) -> Result<Option<Resolution>, DiscoveryError> {
    if !query_name.ends_with('.') {
        return Err(DiscoveryError::InvalidQueryName(query_name.to_string()));
    }
    // The root has no hostname to match.
    if query_name == "." {
        return Ok(None);
    }

    let Some(record) = registry.owner_of(query_name) else {
        return Ok(None);
    };

    let matched_hostname = query_name[..query_name.len() - 1].to_string();
    Ok(Some(Resolution {
        record,
        matched_hostname,
    }))
}
