//! Uniform list envelope shared by every list endpoint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub const DEFAULT_LIMIT: u64 = 50;
pub const MAX_LIMIT: u64 = 200;

/// Pagination parameters accepted by list routes.
///
/// `page`/`per_page` take precedence over `offset`/`limit` when supplied.
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams)]
pub struct ListQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

/// Resolved window over a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u64,
    pub offset: u64,
}

impl ListQuery {
    pub fn page(&self) -> Page {
        let limit = self
            .per_page
            .or(self.limit)
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);
        let offset = match self.page {
            Some(page) => page.saturating_sub(1).saturating_mul(limit),
            None => self.offset.unwrap_or(0),
        };
        Page { limit, offset }
    }
}

/// `{ items, total, limit, offset, page, per_page, has_more, has_next, next_offset, filter_applied }`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListEnvelope<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
    pub page: u64,
    pub per_page: u64,
    pub has_more: bool,
    pub has_next: bool,
    pub next_offset: u64,
    pub filter_applied: BTreeMap<String, String>,
}

impl<T> ListEnvelope<T> {
    pub fn new(items: Vec<T>, total: u64, page: Page, filters: BTreeMap<String, String>) -> Self {
        let next_offset = page.offset + items.len() as u64;
        let has_more = next_offset < total;
        Self {
            total,
            limit: page.limit,
            offset: page.offset,
            page: page.offset / page.limit + 1,
            per_page: page.limit,
            has_more,
            has_next: has_more,
            next_offset,
            filter_applied: filters,
            items,
        }
    }

    /// Slice an already materialized collection.
    pub fn from_vec(all: Vec<T>, page: Page, filters: BTreeMap<String, String>) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Self::new(items, total, page, filters)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> ListEnvelope<U> {
        ListEnvelope {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            limit: self.limit,
            offset: self.offset,
            page: self.page,
            per_page: self.per_page,
            has_more: self.has_more,
            has_next: self.has_next,
            next_offset: self.next_offset,
            filter_applied: self.filter_applied,
        }
    }
}

/// Drop unset or blank filters, trimming the rest.
pub fn compact_filters<'a, I>(filters: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, Option<&'a String>)>,
{
    filters
        .into_iter()
        .filter_map(|(key, value)| {
            let value = value?.trim();
            (!value.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_parameters_override_offset() {
        let query = ListQuery {
            limit: Some(10),
            offset: Some(3),
            page: Some(3),
            per_page: Some(20),
        };
        assert_eq!(query.page(), Page { limit: 20, offset: 40 });

        let defaults = ListQuery::default().page();
        assert_eq!(defaults, Page { limit: DEFAULT_LIMIT, offset: 0 });

        let clamped = ListQuery {
            limit: Some(10_000),
            ..ListQuery::default()
        };
        assert_eq!(clamped.page().limit, MAX_LIMIT);
    }

    #[test]
    fn envelope_flags_follow_totals() {
        let envelope = ListEnvelope::from_vec(
            (0..5).collect::<Vec<_>>(),
            Page { limit: 2, offset: 2 },
            BTreeMap::new(),
        );
        assert_eq!(envelope.items, vec![2, 3]);
        assert_eq!(envelope.total, 5);
        assert_eq!(envelope.page, 2);
        assert!(envelope.has_more && envelope.has_next);
        assert_eq!(envelope.next_offset, 4);

        let last = ListEnvelope::from_vec(
            (0..5).collect::<Vec<_>>(),
            Page { limit: 2, offset: 4 },
            BTreeMap::new(),
        );
        assert!(!last.has_more && !last.has_next);
        assert_eq!(last.next_offset, 5);
    }

    #[test]
    fn empty_lists_are_not_errors() {
        let envelope: ListEnvelope<u32> =
            ListEnvelope::from_vec(Vec::new(), ListQuery::default().page(), BTreeMap::new());
        assert!(envelope.items.is_empty());
        assert_eq!(envelope.total, 0);
        assert!(!envelope.has_more);
    }

    #[test]
    fn compact_filters_drops_blanks() {
        let provider = "github".to_string();
        let blank = "  ".to_string();
        let filters = compact_filters([
            ("provider_id", Some(&provider)),
            ("status", Some(&blank)),
            ("scope_id", None),
        ]);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters["provider_id"], "github");
    }
}
