use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::SpeakerFilter;
use crate::error::AnalysisError;

const BUILTIN_CATALOG: &str = include_str!("../../catalog/default.json");

/// Per-engine weights used by fusion
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub rule: f64,
    pub vector: f64,
    pub llm: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            rule: 0.5,
            vector: 0.2,
            llm: 0.3,
        }
    }
}

/// A single yes/no question asked of a transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionPointConfig {
    pub id: String,
    /// Filled from the enclosing category when loading a catalog
    #[serde(default)]
    pub category: String,
    /// Plain-language definition, used in LLM prompts
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub speaker_filter: SpeakerFilter,
    /// Case-sensitive literal phrases (strongest rule tier)
    #[serde(default)]
    pub exact_phrases: Vec<String>,
    /// Case-insensitive literal keywords
    #[serde(default)]
    pub keyword_patterns: Vec<String>,
    /// Regular expressions, matched case-insensitively
    #[serde(default)]
    pub regex_patterns: Vec<String>,
    /// Reference phrasings for the semantic matcher
    #[serde(default)]
    pub exemplar_phrases: Vec<String>,
    #[serde(default)]
    pub weights: FusionWeights,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_hit_threshold")]
    pub hit_threshold: f64,
}

fn default_similarity_threshold() -> f64 {
    0.6
}

fn default_hit_threshold() -> f64 {
    0.5
}

impl DetectionPointConfig {
    pub fn new(id: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            description: String::new(),
            speaker_filter: SpeakerFilter::default(),
            exact_phrases: Vec::new(),
            keyword_patterns: Vec::new(),
            regex_patterns: Vec::new(),
            exemplar_phrases: Vec::new(),
            weights: FusionWeights::default(),
            similarity_threshold: default_similarity_threshold(),
            hit_threshold: default_hit_threshold(),
        }
    }

    /// Unique key across categories
    pub fn key(&self) -> String {
        format!("{}/{}", self.category, self.id)
    }

    /// Check the numeric parts of the configuration
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let weights = [
            ("rule", self.weights.rule),
            ("vector", self.weights.vector),
            ("llm", self.weights.llm),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AnalysisError::malformed_point(
                    self.key(),
                    format!("{} weight must be a non-negative number, got {}", name, weight),
                ));
            }
        }

        for (name, value) in [
            ("hit_threshold", self.hit_threshold),
            ("similarity_threshold", self.similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalysisError::malformed_point(
                    self.key(),
                    format!("{} must be within [0, 1], got {}", name, value),
                ));
            }
        }

        Ok(())
    }
}

/// A named group of detection points analyzed as one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    /// Pass earlier categories' findings into this category's LLM prompts
    #[serde(default)]
    pub include_prior_findings: bool,
    #[serde(default)]
    pub points: Vec<DetectionPointConfig>,
}

impl CategoryConfig {
    /// Structural checks that decide whether the stage can run at all
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.points.is_empty() {
            return Err(AnalysisError::category_failure(
                &self.name,
                "category declares no detection points",
            ));
        }

        let mut seen = HashSet::new();
        for point in &self.points {
            if !seen.insert(point.id.as_str()) {
                return Err(AnalysisError::category_failure(
                    &self.name,
                    format!("duplicate detection point id {}", point.id),
                ));
            }
        }

        Ok(())
    }
}

/// Immutable set of categories, in execution order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionCatalog {
    pub categories: Vec<CategoryConfig>,
}

impl DetectionCatalog {
    /// Parse a catalog from JSON
    pub fn from_json(json: &str) -> Result<Self, AnalysisError> {
        let mut catalog: DetectionCatalog = serde_json::from_str(json)
            .map_err(|e| AnalysisError::Config(format!("invalid catalog JSON: {}", e)))?;

        let mut names = HashSet::new();
        for category in &mut catalog.categories {
            if !names.insert(category.name.clone()) {
                return Err(AnalysisError::Config(format!(
                    "category {} declared twice",
                    category.name
                )));
            }
            for point in &mut category.points {
                point.category = category.name.clone();
            }
        }

        Ok(catalog)
    }

    /// Load a catalog file from disk
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog: {:?}", path))?;
        let catalog = Self::from_json(&content)
            .with_context(|| format!("Failed to load catalog: {:?}", path))?;
        Ok(catalog)
    }

    /// The catalog shipped with the crate
    pub fn builtin() -> Result<Self, AnalysisError> {
        Self::from_json(BUILTIN_CATALOG)
    }

    pub fn points(&self) -> impl Iterator<Item = &DetectionPointConfig> {
        self.categories.iter().flat_map(|c| c.points.iter())
    }

    pub fn point_count(&self) -> usize {
        self.categories.iter().map(|c| c.points.len()).sum()
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = DetectionCatalog::builtin().unwrap();

        let names: Vec<&str> = catalog.categories.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["icebreak", "deduction", "pain_point", "customer_probing"]
        );

        let background = catalog
            .category("icebreak")
            .unwrap()
            .points
            .iter()
            .find(|p| p.id == "company_background")
            .unwrap();
        assert_eq!(background.category, "icebreak");
        assert!(background.exact_phrases.contains(&"腾讯投资".to_string()));

        let pain = catalog.category("pain_point").unwrap();
        let ids: Vec<&str> = pain.points.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["loss", "miss_opportunity", "chase_high", "panic_sell"]);
        assert!(
            pain.points
                .iter()
                .all(|p| p.speaker_filter == SpeakerFilter::Customer)
        );
        assert!(!pain.include_prior_findings);

        let probing = catalog.category("customer_probing").unwrap();
        assert!(probing.include_prior_findings);
        assert_eq!(probing.points[0].speaker_filter, SpeakerFilter::Agent);
        assert_eq!(probing.points[0].category, "customer_probing");

        for category in &catalog.categories {
            category.validate().unwrap();
            for point in &category.points {
                point.validate().unwrap();
            }
        }
    }

    #[test]
    fn test_point_defaults_from_json() {
        let catalog = DetectionCatalog::from_json(
            r#"{"categories": [{"name": "opening", "points": [{"id": "greeting"}]}]}"#,
        )
        .unwrap();

        let point = &catalog.categories[0].points[0];
        assert_eq!(point.category, "opening");
        assert_eq!(point.speaker_filter, SpeakerFilter::Agent);
        assert_eq!(point.similarity_threshold, 0.6);
        assert_eq!(point.hit_threshold, 0.5);
        assert_eq!(point.weights, FusionWeights::default());
        assert!(!catalog.categories[0].include_prior_findings);
    }

    #[test]
    fn test_duplicate_category_rejected() {
        let err = DetectionCatalog::from_json(
            r#"{"categories": [{"name": "a", "points": []}, {"name": "a", "points": []}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));
    }

    #[test]
    fn test_point_validation() {
        let mut point = DetectionPointConfig::new("p", "c");
        point.validate().unwrap();

        point.weights.vector = -0.1;
        assert!(matches!(
            point.validate(),
            Err(AnalysisError::MalformedPoint { .. })
        ));

        point.weights.vector = 0.2;
        point.hit_threshold = 1.5;
        assert!(point.validate().is_err());
    }

    #[test]
    fn test_category_validation() {
        let mut category = CategoryConfig {
            name: "opening".to_string(),
            include_prior_findings: false,
            points: vec![],
        };
        assert!(matches!(
            category.validate(),
            Err(AnalysisError::CategoryFailure { .. })
        ));

        category.points = vec![
            DetectionPointConfig::new("greeting", "opening"),
            DetectionPointConfig::new("greeting", "opening"),
        ];
        assert!(category.validate().is_err());
    }
}
