//! Catalog search, sorting, pagination and lookup.

use super::GalleryElement;
use nucleo_matcher::pattern::{AtomKind, CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Config, Matcher, Utf32Str};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sortable column of a catalog listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    Name,
    Repository,
    License,
    Installed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl std::str::FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" => Ok(Self::Name),
            "repository" | "gallery" => Ok(Self::Repository),
            "license" => Ok(Self::License),
            "installed" | "status" => Ok(Self::Installed),
            other => Err(format!("unknown sort field: {}", other)),
        }
    }
}

impl std::str::FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort order: {}", other)),
        }
    }
}

/// Entries matching `term`, in catalog order.
///
/// An entry matches when the term fuzzy-matches, or is a case-insensitive
/// substring of, its name, gallery name, description or one of its tags.
/// An empty term matches everything.
pub fn search<T: GalleryElement>(elements: &[T], term: &str) -> Vec<T> {
    let term = term.trim();
    if term.is_empty() {
        return elements.to_vec();
    }

    let needle = term.to_lowercase();
    let pattern = Pattern::new(
        term,
        CaseMatching::Ignore,
        Normalization::Smart,
        AtomKind::Fuzzy,
    );
    let mut matcher = Matcher::new(Config::DEFAULT);
    let mut buf = Vec::new();

    elements
        .iter()
        .filter(|element| {
            let meta = element.metadata();
            let fields = std::iter::once(meta.name.as_str())
                .chain(std::iter::once(meta.gallery.name.as_str()))
                .chain(std::iter::once(meta.description.as_str()))
                .chain(meta.tags.iter().map(String::as_str));

            fields.into_iter().any(|field| {
                if field.is_empty() {
                    return false;
                }
                if field.to_lowercase().contains(&needle) {
                    return true;
                }
                pattern
                    .score(Utf32Str::new(field, &mut buf), &mut matcher)
                    .is_some()
            })
        })
        .cloned()
        .collect()
}

/// Page `page` (1-based) of `items_per_page` entries; out-of-range pages are empty.
pub fn paginate<T: Clone>(items: &[T], page: usize, items_per_page: usize) -> Vec<T> {
    if page == 0 || items_per_page == 0 {
        return Vec::new();
    }
    let start = (page - 1).saturating_mul(items_per_page);
    if start >= items.len() {
        return Vec::new();
    }
    let end = (start + items_per_page).min(items.len());
    items[start..end].to_vec()
}

/// Stable in-place sort.
pub fn sort_elements<T: GalleryElement>(elements: &mut [T], field: SortField, order: SortOrder) {
    elements.sort_by(|a, b| {
        let (a, b) = (a.metadata(), b.metadata());
        let ordering = match field {
            SortField::Name => compare_ci(&a.name, &b.name),
            SortField::Repository => compare_ci(&a.gallery.name, &b.gallery.name)
                .then_with(|| compare_ci(&a.name, &b.name)),
            SortField::License => match (a.license.is_empty(), b.license.is_empty()) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => compare_ci(&a.license, &b.license),
            },
            SortField::Installed => b.installed.cmp(&a.installed),
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

fn compare_ci(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

/// Look up an entry by `name` or `gallery@name`, case-insensitively.
///
/// Path separators in `name` are treated as `__`, the form names take once
/// written to disk.
pub fn find_element<'a, T: GalleryElement>(elements: &'a [T], name: &str) -> Option<&'a T> {
    let wanted = name.replace('/', "__").to_lowercase();
    elements.iter().find(|element| {
        let meta = element.metadata();
        meta.name.to_lowercase() == wanted || meta.id().to_lowercase() == wanted
    })
}
