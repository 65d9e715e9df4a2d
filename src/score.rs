//! Turns per-claim verdicts into a scorecard of overall and per-category
//! rates, with categories weighted by severity.

use crate::extract::{Category, Severity};
use crate::verify::{Tier, Verification};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Integer tallies. `found` includes `found_deep`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Counts {
    pub total: u32,
    pub found: u32,
    pub found_deep: u32,
    pub missing: u32,
    pub mismatched: u32,
}

impl Counts {
    fn add(&mut self, tier: Tier) {
        self.total += 1;
        match tier {
            Tier::Found => self.found += 1,
            Tier::FoundDeep => {
                self.found += 1;
                self.found_deep += 1;
            }
            Tier::Missing => self.missing += 1,
            Tier::Mismatch => self.mismatched += 1,
        }
    }

    /// found / total; an empty tally is vacuously accurate.
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            f64::from(self.found) / f64::from(self.total)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryScore {
    pub category: Category,
    pub severity: Severity,
    pub weight: u32,
    #[serde(flatten)]
    pub counts: Counts,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Scorecard {
    #[serde(flatten)]
    pub counts: Counts,
    pub raw_rate: f64,
    pub weighted_rate: f64,
    /// Mean of per-category rates over categories that had claims.
    pub category_mean: f64,
    /// Every category, including empty ones.
    pub categories: Vec<CategoryScore>,
}

impl Scorecard {
    pub fn category(&self, category: Category) -> Option<&CategoryScore> {
        self.categories.iter().find(|c| c.category == category)
    }
}

/// Mean rate over categories that had at least one claim.
pub fn category_mean(categories: &[CategoryScore]) -> f64 {
    let non_empty: Vec<f64> = categories
        .iter()
        .filter(|c| c.counts.total > 0)
        .map(|c| c.rate)
        .collect();
    if non_empty.is_empty() {
        1.0
    } else {
        non_empty.iter().sum::<f64>() / non_empty.len() as f64
    }
}

pub fn score(results: &[Verification]) -> Scorecard {
    let mut counts = Counts::default();
    let mut weighted_found = 0u64;
    let mut weighted_total = 0u64;
    let mut categories: Vec<CategoryScore> = Category::ALL
        .iter()
        .map(|&category| CategoryScore {
            category,
            severity: category.severity(),
            weight: category.weight(),
            counts: Counts::default(),
            rate: 1.0,
        })
        .collect();

    for v in results {
        counts.add(v.tier);
        let w = u64::from(v.claim.category.weight());
        weighted_total += w;
        if v.tier.is_found() {
            weighted_found += w;
        }
        if let Some(cat) = categories.iter_mut().find(|c| c.category == v.claim.category) {
            cat.counts.add(v.tier);
        }
    }

    for cat in &mut categories {
        cat.rate = cat.counts.rate();
    }

    let category_mean = category_mean(&categories);
    Scorecard {
        raw_rate: counts.rate(),
        weighted_rate: if weighted_total == 0 {
            1.0
        } else {
            weighted_found as f64 / weighted_total as f64
        },
        counts,
        category_mean,
        categories,
    }
}

/// Rate as a percentage with one decimal, for display only.
pub fn pct(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}
