use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const RULE_ENGINE_SOURCE: &str = "rule_engine";
pub const MANUAL_SOURCE: &str = "manual_override";

/// How a tag's current classification was produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassificationSource {
    RuleEngine,
    /// Named LLM model identifier.
    Llm(String),
    Manual,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &str {
        match self {
            ClassificationSource::RuleEngine => RULE_ENGINE_SOURCE,
            ClassificationSource::Llm(model) => model,
            ClassificationSource::Manual => MANUAL_SOURCE,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            RULE_ENGINE_SOURCE => ClassificationSource::RuleEngine,
            MANUAL_SOURCE => ClassificationSource::Manual,
            other => ClassificationSource::Llm(other.to_string()),
        }
    }

    pub fn is_llm(&self) -> bool {
        matches!(self, ClassificationSource::Llm(_))
    }
}

impl fmt::Display for ClassificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("confidence {0} is outside [0, 1]")]
pub struct ConfidenceError(pub f64);

/// Classification confidence, always finite and within [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Confidence(f64);

impl Confidence {
    pub const FULL: Confidence = Confidence(1.0);

    pub fn new(value: f64) -> Result<Self, ConfidenceError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ConfidenceError(value))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// A tag as delivered by the upstream source dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTag {
    pub name: String,
    #[serde(default, alias = "category")]
    pub native_category: Option<i64>,
    #[serde(default, alias = "post_count")]
    pub usage_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_bounds() {
        assert!(Confidence::new(0.0).is_ok());
        assert!(Confidence::new(1.0).is_ok());
        assert_eq!(Confidence::new(1.2), Err(ConfidenceError(1.2)));
        assert!(Confidence::new(-0.1).is_err());
        assert!(Confidence::new(f64::NAN).is_err());
    }

    #[test]
    fn source_round_trips_through_text() {
        for source in [
            ClassificationSource::RuleEngine,
            ClassificationSource::Manual,
            ClassificationSource::Llm("qwen/qwen3-next-80b-a3b-thinking".into()),
        ] {
            assert_eq!(ClassificationSource::parse(source.as_str()), source);
        }
        assert!(ClassificationSource::parse("gpt-4o-mini").is_llm());
    }

    #[test]
    fn source_tag_accepts_upstream_field_names() {
        let tag: SourceTag =
            serde_json::from_str(r#"{"name": "hatsune_miku", "category": 4, "post_count": 90000}"#)
                .unwrap();
        assert_eq!(tag.native_category, Some(4));
        assert_eq!(tag.usage_count, 90000);
    }
}
