//! Entity, write-record and match-result types shared by the indexer and search layers.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two entity classes the engine indexes. Each class has its own vector index,
/// text index and configured embedding dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityClass {
    Candidate,
    Posting,
}

impl EntityClass {
    pub const ALL: [EntityClass; 2] = [EntityClass::Candidate, EntityClass::Posting];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityClass::Candidate => "candidate",
            EntityClass::Posting => "posting",
        }
    }
}

impl fmt::Display for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candidate" | "candidates" => Ok(EntityClass::Candidate),
            "posting" | "postings" | "job" | "job_offer" => Ok(EntityClass::Posting),
            other => Err(format!("unknown entity class: {other}")),
        }
    }
}

/// One value per entity class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassMap<T> {
    pub candidate: T,
    pub posting: T,
}

impl<T> ClassMap<T> {
    pub fn from_fn(mut f: impl FnMut(EntityClass) -> T) -> Self {
        Self {
            candidate: f(EntityClass::Candidate),
            posting: f(EntityClass::Posting),
        }
    }

    pub fn get(&self, class: EntityClass) -> &T {
        match class {
            EntityClass::Candidate => &self.candidate,
            EntityClass::Posting => &self.posting,
        }
    }

    pub fn get_mut(&mut self, class: EntityClass) -> &mut T {
        match class {
            EntityClass::Candidate => &mut self.candidate,
            EntityClass::Posting => &mut self.posting,
        }
    }

    pub fn try_map<U, E>(
        self,
        mut f: impl FnMut(EntityClass, T) -> Result<U, E>,
    ) -> Result<ClassMap<U>, E> {
        Ok(ClassMap {
            candidate: f(EntityClass::Candidate, self.candidate)?,
            posting: f(EntityClass::Posting, self.posting)?,
        })
    }
}

/// Seniority ladder used by postings (required level) and candidates (declared level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Intern,
    Junior,
    Mid,
    Senior,
    Lead,
}

impl Seniority {
    /// Numeric level, intern = 1 through lead = 5.
    pub fn level(self) -> u8 {
        match self {
            Seniority::Intern => 1,
            Seniority::Junior => 2,
            Seniority::Mid => 3,
            Seniority::Senior => 4,
            Seniority::Lead => 5,
        }
    }

    /// Estimate a level from years of experience when none is declared.
    pub fn from_years(years: f32) -> Self {
        if years < 1.0 {
            Seniority::Intern
        } else if years < 3.0 {
            Seniority::Junior
        } else if years < 5.0 {
            Seniority::Mid
        } else if years < 8.0 {
            Seniority::Senior
        } else {
            Seniority::Lead
        }
    }
}

impl FromStr for Seniority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "intern" => Ok(Seniority::Intern),
            "junior" => Ok(Seniority::Junior),
            "mid" | "intermediate" => Ok(Seniority::Mid),
            "senior" => Ok(Seniority::Senior),
            "lead" | "principal" => Ok(Seniority::Lead),
            other => Err(format!("unknown seniority: {other}")),
        }
    }
}

/// Schema-fixed filterable attributes of an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredAttributes {
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub seniority: Option<Seniority>,
    #[serde(default)]
    pub years_experience: Option<f32>,
    /// Posting allows remote work / candidate accepts remote work.
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StructuredAttributes {
    /// Lower-case and trim skills and location so that filters and overlap
    /// computations compare like with like.
    pub fn normalized(mut self) -> Self {
        self.skills = self
            .skills
            .iter()
            .map(|s| normalize_skill(s))
            .filter(|s| !s.is_empty())
            .collect();
        self.location = self
            .location
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty());
        self
    }

    /// Declared seniority, or one estimated from years of experience.
    pub fn effective_seniority(&self) -> Option<Seniority> {
        self.seniority
            .or_else(|| self.years_experience.map(Seniority::from_years))
    }
}

pub fn normalize_skill(skill: &str) -> String {
    skill.trim().to_lowercase()
}

/// Free text scored by the text index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDocument {
    #[serde(default)]
    pub headline: String,
    #[serde(default)]
    pub body: String,
}

impl TextDocument {
    pub fn new(headline: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            headline: headline.into(),
            body: body.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.headline.trim().is_empty() && self.body.trim().is_empty()
    }
}

/// A candidate profile or job posting as handed over by the canonical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub class: EntityClass,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub attributes: StructuredAttributes,
    #[serde(default)]
    pub text: TextDocument,
    pub version: u64,
}

impl Entity {
    pub fn into_write_record(self) -> IndexWriteRecord {
        IndexWriteRecord {
            id: self.id,
            class: self.class,
            version: self.version,
            operation: WriteOperation::Upsert {
                vector: self.vector,
                document: self.text,
                attributes: self.attributes,
            },
        }
    }
}

/// What a write record does to both indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WriteOperation {
    Upsert {
        vector: Vec<f32>,
        #[serde(default)]
        document: TextDocument,
        #[serde(default)]
        attributes: StructuredAttributes,
    },
    Delete,
}

/// A single mutation routed through the coordinator. Consumed by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexWriteRecord {
    pub id: String,
    pub class: EntityClass,
    pub version: u64,
    pub operation: WriteOperation,
}

impl IndexWriteRecord {
    pub fn upsert(
        class: EntityClass,
        id: impl Into<String>,
        version: u64,
        vector: Vec<f32>,
        document: TextDocument,
        attributes: StructuredAttributes,
    ) -> Self {
        Self {
            id: id.into(),
            class,
            version,
            operation: WriteOperation::Upsert {
                vector,
                document,
                attributes,
            },
        }
    }

    pub fn delete(class: EntityClass, id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            class,
            version,
            operation: WriteOperation::Delete,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self.operation {
            WriteOperation::Upsert { .. } => "upsert",
            WriteOperation::Delete => "delete",
        }
    }
}

/// Structured business features computed for one result against the query profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFeatures {
    pub skill_overlap: Option<f32>,
    pub seniority_match: Option<f32>,
    pub geo_match: Option<f32>,
}

/// Weighted contribution of each signal to the fused score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBreakdown {
    pub vector: f32,
    pub text: f32,
    pub skill: f32,
    pub seniority: f32,
    pub geo: f32,
}

impl SignalBreakdown {
    pub fn total(&self) -> f32 {
        self.vector + self.text + self.skill + self.seniority + self.geo
    }
}

/// One ranked query result. Produced fresh per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: String,
    pub vector_distance: Option<f32>,
    pub text_score: Option<f32>,
    pub structured_features: StructuredFeatures,
    pub fused_score: f32,
    /// 1-based position in the final ranking.
    pub rank: usize,
    pub version: u64,
    pub signals: SignalBreakdown,
}
