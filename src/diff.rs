//! Smart diff: the set of catalog items not yet recorded as delivered.

use crate::model::CatalogItem;
use std::collections::HashSet;

/// Order-preserving set difference between a catalog and the delivered-hash
/// ledger. Items are matched by content hash, never by position, so origin
/// reordering or insertion cannot cause re-delivery or accidental skips.
pub fn compute_delta(catalog: &[CatalogItem], delivered: &HashSet<String>) -> Vec<CatalogItem> {
    catalog
        .iter()
        .filter(|item| !delivered.contains(&item.content_hash()))
        .cloned()
        .collect()
}
