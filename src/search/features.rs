//! Structured business features: skill overlap, seniority proximity and geographic fit
//! between the query profile and one retrieved entity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::types::{
    EntityClass, Seniority, StructuredAttributes, StructuredFeatures, normalize_skill,
};

/// Score used when either side lacks the information a feature needs.
pub const UNKNOWN_MATCH: f32 = 0.5;
pub const SAME_CITY_MATCH: f32 = 0.8;
pub const DIFFERENT_LOCATION_MATCH: f32 = 0.3;

/// The entity being matched against: a posting's requirements when ranking candidates,
/// or a candidate's profile when ranking postings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchProfile {
    pub skills: BTreeSet<String>,
    pub seniority: Option<Seniority>,
    pub years_experience: Option<f32>,
    pub location: Option<String>,
    pub remote: bool,
}

impl MatchProfile {
    pub fn from_attributes(attrs: &StructuredAttributes) -> Self {
        Self {
            skills: attrs.skills.clone(),
            seniority: attrs.seniority,
            years_experience: attrs.years_experience,
            location: attrs.location.clone(),
            remote: attrs.remote,
        }
    }

    fn as_attributes(&self) -> StructuredAttributes {
        StructuredAttributes {
            skills: self.skills.iter().map(|s| normalize_skill(s)).collect(),
            location: self.location.clone(),
            seniority: self.seniority,
            years_experience: self.years_experience,
            remote: self.remote,
            ..Default::default()
        }
    }
}

/// Compute features for one result of class `target` against `profile`.
///
/// The candidate side supplies skills and experience; the posting side supplies the
/// required skills, required seniority and the remote flag.
pub fn compute_features(
    profile: &MatchProfile,
    target: EntityClass,
    result: &StructuredAttributes,
) -> StructuredFeatures {
    let profile = profile.as_attributes();
    let (candidate, posting) = match target {
        EntityClass::Candidate => (result, &profile),
        EntityClass::Posting => (&profile, result),
    };
    StructuredFeatures {
        skill_overlap: Some(skill_overlap(&candidate.skills, &posting.skills)),
        seniority_match: Some(seniority_match(
            candidate.effective_seniority(),
            posting.seniority,
        )),
        geo_match: Some(geo_match(
            candidate.location.as_deref(),
            posting.location.as_deref(),
            posting.remote,
        )),
    }
}

/// |have ∩ required| / max(|required|, 1).
pub fn skill_overlap(have: &BTreeSet<String>, required: &BTreeSet<String>) -> f32 {
    let shared = required.intersection(have).count();
    shared as f32 / required.len().max(1) as f32
}

/// `1 - |level gap| / 4`, or [`UNKNOWN_MATCH`] when either level is unknown.
pub fn seniority_match(candidate: Option<Seniority>, required: Option<Seniority>) -> f32 {
    match (candidate, required) {
        (Some(have), Some(want)) => {
            let gap = (i16::from(have.level()) - i16::from(want.level())).abs();
            (1.0 - f32::from(gap) / 4.0).max(0.0)
        }
        _ => UNKNOWN_MATCH,
    }
}

pub fn geo_match(candidate: Option<&str>, posting: Option<&str>, remote_allowed: bool) -> f32 {
    if remote_allowed {
        return 1.0;
    }
    let (Some(a), Some(b)) = (candidate, posting) else {
        return UNKNOWN_MATCH;
    };
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return UNKNOWN_MATCH;
    }
    if a == b {
        return 1.0;
    }
    if city(&a) == city(&b) {
        return SAME_CITY_MATCH;
    }
    DIFFERENT_LOCATION_MATCH
}

fn city(location: &str) -> &str {
    location.split(',').next().unwrap_or(location).trim()
}
