//! Defect type catalog.
//!
//! Maps the integer `defect_type` a client sends to the prompt handed to the
//! synthesizer. The set of codes is closed: anything not in the catalog is
//! rejected before the upload is read.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Closed mapping from defect code to prompt text.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>")]
pub struct DefectCatalog {
    prompts: BTreeMap<i64, String>,
}

impl DefectCatalog {
    pub fn new(prompts: BTreeMap<i64, String>) -> Self {
        Self { prompts }
    }

    /// Prompt for `code`, or `None` if the code is not part of the catalog.
    pub fn prompt(&self, code: i64) -> Option<&str> {
        self.prompts.get(&code).map(String::as_str)
    }

    pub fn contains(&self, code: i64) -> bool {
        self.prompts.contains_key(&code)
    }

    pub(crate) fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub(crate) fn prompts(&self) -> impl Iterator<Item = (i64, &str)> {
        self.prompts.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl Default for DefectCatalog {
    fn default() -> Self {
        let prompts = [
            (0, "photo of equipment with damage"),
            (1, "photo of equipment on fire"),
            (2, "photo of equipment leaking oil"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
        Self { prompts }
    }
}

// TOML table keys are always strings, so `[defects]` arrives as `"0" = "..."`.
impl TryFrom<BTreeMap<String, String>> for DefectCatalog {
    type Error = String;

    fn try_from(raw: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        let mut prompts = BTreeMap::new();
        for (key, prompt) in raw {
            let code: i64 = key
                .trim()
                .parse()
                .map_err(|_| format!("defect code must be an integer, got '{}'", key))?;
            prompts.insert(code, prompt);
        }
        Ok(Self { prompts })
    }
}
