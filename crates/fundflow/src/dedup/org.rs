//! Canonical organization resolution.
//!
//! Strategies 1, 5, 6 and 7 only fire once the candidate's organization
//! name resolves to a canonical organization already present in the recent
//! corpus. Resolution is a fuzzy match over normalized names with the
//! candidate's country as tie-break; an unresolvable name simply disables
//! those strategies rather than failing the engine.

use std::collections::HashMap;

use super::similarity::token_sort_ratio;
use crate::record::OpportunityRecord;

/// Legal suffixes dropped before comparing organization names.
const LEGAL_SUFFIXES: [&str; 10] = [
    "ltd",
    "limited",
    "inc",
    "incorporated",
    "llc",
    "plc",
    "corp",
    "corporation",
    "co",
    "holdings",
];

/// Normalize an organization name for comparison: lowercase, strip
/// punctuation, drop trailing legal suffixes.
#[must_use]
pub fn normalize_org_name(name: &str) -> String {
    let normalized = super::similarity::normalize(name);
    let mut tokens: Vec<&str> = normalized.split_whitespace().collect();
    while let Some(last) = tokens.last() {
        if tokens.len() > 1 && LEGAL_SUFFIXES.contains(last) {
            tokens.pop();
        } else {
            break;
        }
    }
    tokens.join(" ")
}

/// A canonical organization found in the corpus.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOrg {
    /// Canonical organization id
    pub id: String,
    /// Name as published
    pub name: String,
    /// Match similarity in [0, 1]
    pub similarity: f64,
}

/// Resolve `name` against the organizations appearing in `corpus`.
///
/// Returns the best normalized-name match at or above `threshold`; when
/// two candidates land within 0.02 of each other, one whose geography
/// includes `country` wins the tie.
#[must_use]
pub fn resolve(
    name: &str,
    country: Option<&str>,
    corpus: &[OpportunityRecord],
    threshold: f64,
) -> Option<ResolvedOrg> {
    let needle = normalize_org_name(name);
    if needle.is_empty() {
        return None;
    }

    // One entry per canonical org id; remember its geography for tie-breaks.
    let mut orgs: HashMap<&str, (&str, Vec<&str>)> = HashMap::new();
    for record in corpus {
        let org_name = match record.fields.primary_organization() {
            Some(n) => n,
            None => continue,
        };
        let entry = orgs
            .entry(record.organization_id.as_str())
            .or_insert((org_name, Vec::new()));
        for geo in &record.fields.geography {
            entry.1.push(geo.as_str());
        }
    }

    let country_lower = country.map(str::to_lowercase);
    let mut best: Option<ResolvedOrg> = None;
    let mut best_has_country = false;
    for (id, (org_name, geos)) in orgs {
        let similarity = token_sort_ratio(&needle, &normalize_org_name(org_name));
        if similarity < threshold {
            continue;
        }
        let has_country = country_lower.as_deref().is_some_and(|c| {
            geos.iter().any(|geo| geo.to_lowercase() == c)
        });
        let better = match &best {
            None => true,
            Some(current) => {
                if (similarity - current.similarity).abs() <= 0.02 {
                    // Within the tie window the country match decides.
                    has_country && !best_has_country
                } else {
                    similarity > current.similarity
                }
            }
        };
        if better {
            best_has_country = has_country;
            best = Some(ResolvedOrg {
                id: id.to_string(),
                name: org_name.to_string(),
                similarity,
            });
        }
    }
    best
}
