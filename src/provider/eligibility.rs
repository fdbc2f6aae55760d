//! Placement eligibility filtering.
//!
//! A [`ZoneFilter`] narrows a discovered collection to the items whose
//! availability zone satisfies the placement policy. Filtering is pure and
//! order preserving: the result is the input order restricted to the keep
//! set. An empty result is a fatal placement error, raised before any
//! dependent creation attempt.

use std::collections::HashSet;

use crate::catalog::{Catalog, PlacementPolicyKind};
use crate::error::PlacementError;

use super::api::DiscoveredItem;

/// A placement policy over availability zones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneFilter {
    /// Keep items whose zone is a member of the allow-list.
    Allow(HashSet<String>),
    /// Keep items whose zone is NOT in the provider-reported unsupported
    /// set. Items without a zone label pass this variant.
    Exclude(HashSet<String>),
}

/// How the engine obtains the zone filter for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementPolicy {
    /// A caller-supplied static filter, fixed at load time.
    Static(ZoneFilter),
    /// Exclusion set queried from the provider once per run.
    DynamicExclusion,
}

impl PlacementPolicy {
    /// Selects the policy variant from catalog configuration.
    #[must_use]
    pub fn from_catalog(catalog: &Catalog) -> Self {
        match catalog.placement.policy {
            PlacementPolicyKind::AllowZones => Self::Static(ZoneFilter::Allow(
                catalog.placement.zones.iter().cloned().collect(),
            )),
            PlacementPolicyKind::ExcludeUnsupported => Self::DynamicExclusion,
        }
    }
}

impl ZoneFilter {
    /// Filters the items, preserving input order.
    ///
    /// # Errors
    ///
    /// Returns [`PlacementError::NoEligibleTargets`] if no item survives;
    /// an empty placement set must never silently proceed downstream.
    pub fn filter(
        &self,
        items: &[DiscoveredItem],
    ) -> Result<Vec<DiscoveredItem>, PlacementError> {
        let eligible: Vec<DiscoveredItem> = items
            .iter()
            .filter(|item| self.keeps(item.zone.as_deref()))
            .cloned()
            .collect();

        if eligible.is_empty() {
            return Err(PlacementError::NoEligibleTargets {
                policy: self.to_string(),
            });
        }

        Ok(eligible)
    }

    /// Returns whether an item with the given zone label is kept.
    fn keeps(&self, zone: Option<&str>) -> bool {
        match self {
            Self::Allow(allowed) => zone.is_some_and(|z| allowed.contains(z)),
            Self::Exclude(unsupported) => zone.is_none_or(|z| !unsupported.contains(z)),
        }
    }
}

impl std::fmt::Display for ZoneFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (label, zones) = match self {
            Self::Allow(zones) => ("allow-list", zones),
            Self::Exclude(zones) => ("exclusion set", zones),
        };
        let mut sorted: Vec<&str> = zones.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        write!(f, "zone {label} [{}]", sorted.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnets(zones: &[&str]) -> Vec<DiscoveredItem> {
        zones
            .iter()
            .enumerate()
            .map(|(i, zone)| DiscoveredItem::new(format!("subnet-{i}"), *zone))
            .collect()
    }

    fn zone_labels(items: &[DiscoveredItem]) -> Vec<&str> {
        items.iter().filter_map(|i| i.zone.as_deref()).collect()
    }

    #[test]
    fn test_allow_list_preserves_order() {
        let items = subnets(&["a", "b", "c", "e"]);
        let filter = ZoneFilter::Allow(["a", "b", "c"].map(String::from).into());

        let eligible = filter.filter(&items).unwrap();
        assert_eq!(zone_labels(&eligible), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_exclusion_drops_unsupported_zone() {
        let items = subnets(&["a", "e"]);
        let filter = ZoneFilter::Exclude(["e"].map(String::from).into());

        let eligible = filter.filter(&items).unwrap();
        assert_eq!(zone_labels(&eligible), vec!["a"]);
    }

    #[test]
    fn test_all_excluded_is_error_not_empty_success() {
        let items = subnets(&["e"]);
        let filter = ZoneFilter::Exclude(["e"].map(String::from).into());

        let err = filter.filter(&items).unwrap_err();
        assert!(matches!(err, PlacementError::NoEligibleTargets { .. }));
    }

    #[test]
    fn test_empty_input_is_error() {
        let filter = ZoneFilter::Allow(["a"].map(String::from).into());
        assert!(filter.filter(&[]).is_err());
    }

    #[test]
    fn test_filter_is_idempotent() {
        let items = subnets(&["a", "b", "c", "e"]);
        let filter = ZoneFilter::Allow(["a", "c"].map(String::from).into());

        let once = filter.filter(&items).unwrap();
        let twice = filter.filter(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_exclusion_keeps_unlabeled_items() {
        let mut items = subnets(&["a"]);
        items.push(DiscoveredItem {
            id: String::from("subnet-x"),
            zone: None,
            attributes: crate::provider::api::ResourceAttrs::new(),
        });
        let filter = ZoneFilter::Exclude(["a"].map(String::from).into());

        let eligible = filter.filter(&items).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "subnet-x");
    }
}
