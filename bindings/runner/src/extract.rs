use std::collections::BTreeMap;

use regex::Regex;

/// Why a value could not be extracted from a response body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionError {
    #[error("Pattern [{pattern}] did not match the response body")]
    NoMatch { pattern: String },
    #[error("Capture [{capture}] of pattern [{pattern}] is missing or empty")]
    EmptyCapture { pattern: String, capture: String },
}

/// The named captures of one successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pattern: String,
    values: BTreeMap<String, String>,
}

impl Extracted {
    /// A required, non-empty capture.
    pub fn require(&self, capture: &str) -> Result<&str, ExtractionError> {
        self.values
            .get(capture)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ExtractionError::EmptyCapture {
                pattern: self.pattern.clone(),
                capture: capture.to_string(),
            })
    }

    pub fn get(&self, capture: &str) -> Option<&str> {
        self.values.get(capture).map(String::as_str)
    }
}

/// A value that can be built from the captures of a [PatternExtractor].
pub trait FromExtracted: Sized {
    fn from_extracted(extracted: &Extracted) -> Result<Self, ExtractionError>;
}

/// A declarative rule for pulling values out of a response body.
///
/// The rule is a regular expression with named capture groups. Each match is turned into a typed
/// value through [FromExtracted], so changes to the markup that a provider returns surface as an
/// [ExtractionError] from one place rather than as a confusing failure several requests later.
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    pattern: Regex,
}

impl PatternExtractor {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Match against `haystack` and return every named capture of the first match.
    pub fn extract(&self, haystack: &str) -> Result<Extracted, ExtractionError> {
        let caps = self
            .pattern
            .captures(haystack)
            .ok_or_else(|| ExtractionError::NoMatch {
                pattern: self.pattern.as_str().to_string(),
            })?;

        let values = self
            .pattern
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();

        Ok(Extracted {
            pattern: self.pattern.as_str().to_string(),
            values,
        })
    }

    /// Match and convert in one step.
    pub fn extract_as<T: FromExtracted>(&self, haystack: &str) -> Result<T, ExtractionError> {
        T::from_extracted(&self.extract(haystack)?)
    }
}
