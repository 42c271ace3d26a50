use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use crate::catalog::PatchCatalogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterField {
    BaseRom,
    System,
    Status,
    Difficulty,
    Tags,
    Fakemons,
    Graphics,
    Story,
    Mechanics,
    Rating,
}

impl FilterField {
    pub const ALL: [FilterField; 10] = [
        FilterField::BaseRom,
        FilterField::System,
        FilterField::Status,
        FilterField::Difficulty,
        FilterField::Tags,
        FilterField::Fakemons,
        FilterField::Graphics,
        FilterField::Story,
        FilterField::Mechanics,
        FilterField::Rating,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            FilterField::BaseRom => "Base ROM",
            FilterField::System => "System",
            FilterField::Status => "Status",
            FilterField::Difficulty => "Difficulty",
            FilterField::Tags => "Tags",
            FilterField::Fakemons => "Fakemons",
            FilterField::Graphics => "Graphics",
            FilterField::Story => "Story",
            FilterField::Mechanics => "Mechanics",
            FilterField::Rating => "Rating",
        }
    }

    /// Values of this field carried by an entry. Ratings are bucketed to whole stars.
    fn values<'a>(&self, entry: &'a PatchCatalogEntry) -> Vec<Cow<'a, str>> {
        let meta = &entry.meta;
        let single = |v: Option<&'a str>| v.map(Cow::Borrowed).into_iter().collect::<Vec<_>>();
        let many = |v: &'a [String]| -> Vec<Cow<'a, str>> {
            v.iter().map(|s| Cow::Borrowed(s.as_str())).collect()
        };
        match self {
            FilterField::BaseRom => single(entry.base_rom()),
            FilterField::System => single(meta.system.as_deref()),
            FilterField::Status => single(meta.status.as_deref()),
            FilterField::Difficulty => single(meta.difficulty.as_deref()),
            FilterField::Tags => many(&meta.tags),
            FilterField::Fakemons => single(meta.fakemons.as_deref()),
            FilterField::Graphics => single(meta.graphics.as_deref()),
            FilterField::Story => single(meta.story.as_deref()),
            FilterField::Mechanics => many(&meta.mechanics),
            FilterField::Rating => meta.rating_bucket().map(Cow::Owned).into_iter().collect(),
        }
    }
}

/// Canonical, order-independent identity of a [`FilterSet`].
pub type FilterKey = Vec<(FilterField, Vec<String>)>;

/// Active filter selections. Fields combine with AND, values within a field with OR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    active: BTreeMap<FilterField, BTreeSet<String>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field: FilterField, value: &str, on: bool) {
        if on {
            self.active.entry(field).or_default().insert(value.to_string());
        } else if let Some(values) = self.active.get_mut(&field) {
            values.remove(value);
            if values.is_empty() {
                self.active.remove(&field);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn matches(&self, entry: &PatchCatalogEntry) -> bool {
        self.active.iter().all(|(field, accepted)| {
            field
                .values(entry)
                .iter()
                .any(|v| accepted.contains(v.as_ref()))
        })
    }

    pub fn cache_key(&self) -> FilterKey {
        self.active
            .iter()
            .map(|(field, values)| (*field, values.iter().cloned().collect()))
            .collect()
    }
}

/// Distinct values and their occurrence counts, per field.
pub fn filter_options(
    entries: &[PatchCatalogEntry],
) -> BTreeMap<FilterField, BTreeMap<String, usize>> {
    let mut options: BTreeMap<FilterField, BTreeMap<String, usize>> = BTreeMap::new();
    for entry in entries {
        for field in FilterField::ALL {
            for value in field.values(entry) {
                *options
                    .entry(field)
                    .or_default()
                    .entry(value.into_owned())
                    .or_insert(0) += 1;
            }
        }
    }
    options
}

/// Case-insensitive substring match over title, tags, author and base ROM.
/// `needle` must already be lowercased; an empty needle matches everything.
pub fn matches_query(needle: &str, entry: &PatchCatalogEntry) -> bool {
    if needle.is_empty() {
        return true;
    }
    let contains = |s: &str| s.to_lowercase().contains(needle);
    contains(&entry.title)
        || entry.meta.tags.iter().any(|t| contains(t))
        || entry.meta.author.as_deref().is_some_and(contains)
        || entry.base_rom().is_some_and(contains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PatchType;

    fn entry(id: &str, system: &str, base: &str, tags: &[&str]) -> PatchCatalogEntry {
        let mut e = PatchCatalogEntry::new(id, id, &format!("{}.ips", id), PatchType::Ips);
        e.meta.system = Some(system.to_string());
        e.meta.base_rom = Some(base.to_string());
        e.meta.tags = tags.iter().map(|t| t.to_string()).collect();
        e
    }

    fn sample() -> Vec<PatchCatalogEntry> {
        let mut entries = vec![
            entry("crystal-clear", "GBC", "Crystal", &["Open World"]),
            entry("radical-red", "GBA", "FireRed", &["Difficulty", "QoL"]),
            entry("unbound", "GBA", "FireRed", &["New Region"]),
        ];
        entries[1].meta.rating = Some(4.8);
        entries[1].meta.mechanics = vec!["Fairy Type".into(), "PSS".into()];
        entries[2].meta.rating = Some(4.2);
        entries[2].meta.mechanics = vec!["PSS".into()];
        entries[2].meta.fakemons = Some("No".into());
        entries
    }

    fn ids(filters: &FilterSet, entries: &[PatchCatalogEntry]) -> Vec<String> {
        entries
            .iter()
            .filter(|e| filters.matches(e))
            .map(|e| e.id.clone())
            .collect()
    }

    fn search(query: &str, entries: &[PatchCatalogEntry]) -> Vec<String> {
        let needle = query.trim().to_lowercase();
        entries
            .iter()
            .filter(|e| matches_query(&needle, e))
            .map(|e| e.id.clone())
            .collect()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let entries = sample();
        assert_eq!(ids(&FilterSet::new(), &entries).len(), 3);
    }

    #[test]
    fn test_or_within_field_and_across_fields() {
        let entries = sample();
        let mut filters = FilterSet::new();
        filters.set(FilterField::System, "GBA", true);
        filters.set(FilterField::System, "GBC", true);
        assert_eq!(ids(&filters, &entries).len(), 3);

        filters.set(FilterField::Tags, "QoL", true);
        assert_eq!(ids(&filters, &entries), vec!["radical-red"]);
    }

    #[test]
    fn test_missing_value_fails_active_field() {
        let mut entries = sample();
        entries[0].meta.status = None;
        let mut filters = FilterSet::new();
        filters.set(FilterField::Status, "Complete", true);
        assert!(ids(&filters, &entries).is_empty());
    }

    #[test]
    fn test_unset_removes_field() {
        let mut filters = FilterSet::new();
        filters.set(FilterField::System, "GBA", true);
        assert!(!filters.is_empty());
        filters.set(FilterField::System, "GBA", false);
        assert!(filters.is_empty());
    }

    #[test]
    fn test_cache_key_order_independent() {
        let mut a = FilterSet::new();
        a.set(FilterField::Tags, "QoL", true);
        a.set(FilterField::System, "GBA", true);
        a.set(FilterField::Tags, "Difficulty", true);

        let mut b = FilterSet::new();
        b.set(FilterField::System, "GBA", true);
        b.set(FilterField::Tags, "Difficulty", true);
        b.set(FilterField::Tags, "QoL", true);

        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_filter_options_counts() {
        let options = filter_options(&sample());
        assert_eq!(options[&FilterField::System]["GBA"], 2);
        assert_eq!(options[&FilterField::BaseRom]["FireRed"], 2);
        assert_eq!(options[&FilterField::Tags]["QoL"], 1);
        assert_eq!(options[&FilterField::Mechanics]["PSS"], 2);
        assert_eq!(options[&FilterField::Rating]["4 Stars"], 2);
        assert_eq!(options[&FilterField::Fakemons]["No"], 1);
        assert!(!options.contains_key(&FilterField::Difficulty));
        assert!(!options.contains_key(&FilterField::Story));
    }

    #[test]
    fn test_mechanics_and_rating_filters() {
        let entries = sample();
        let mut filters = FilterSet::new();
        filters.set(FilterField::Mechanics, "Fairy Type", true);
        assert_eq!(ids(&filters, &entries), vec!["radical-red"]);

        let mut filters = FilterSet::new();
        filters.set(FilterField::Rating, "4 Stars", true);
        assert_eq!(ids(&filters, &entries), vec!["radical-red", "unbound"]);

        filters.set(FilterField::Fakemons, "No", true);
        assert_eq!(ids(&filters, &entries), vec!["unbound"]);
    }

    #[test]
    fn test_search() {
        let entries = sample();
        assert_eq!(search("  ", &entries).len(), 3);
        assert_eq!(search("firered", &entries).len(), 2);
        assert_eq!(search("REGION", &entries), vec!["unbound"]);
    }
}
