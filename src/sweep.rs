//! Parameter sweeps
//!
//! A sweep maps each parameter to its candidate values; [`expand`] produces
//! the cross product. [`SweepFile`] pairs a grid with a base configuration so
//! each combination becomes a complete [`ExperimentConfig`].

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ExperimentConfig;
use crate::{Error, Result};

/// Expand parameter candidates into every combination.
///
/// Parameters are processed in iteration order and candidates in list order,
/// so the output order is deterministic. The accumulator is seeded with one
/// empty combination: zero parameters yield exactly one (empty) combination,
/// and a parameter with no candidates yields none.
///
/// # Example
///
/// ```rust
/// use prunelab::sweep::expand;
///
/// let combos = expand([("a", vec![1, 2, 3]), ("b", vec![10, 20])]);
/// assert_eq!(combos.len(), 6);
/// assert_eq!(combos[0]["a"], 1);
/// assert_eq!(combos[0]["b"], 10);
/// ```
pub fn expand<K, V, I>(params: I) -> Vec<BTreeMap<K, V>>
where
    K: Ord + Clone,
    V: Clone,
    I: IntoIterator<Item = (K, Vec<V>)>,
{
    let mut combinations = vec![BTreeMap::new()];
    for (name, candidates) in params {
        let mut next = Vec::with_capacity(combinations.len() * candidates.len());
        for partial in &combinations {
            for value in &candidates {
                let mut combination = partial.clone();
                combination.insert(name.clone(), value.clone());
                next.push(combination);
            }
        }
        combinations = next;
    }
    combinations
}

/// A sweep description: shared fields plus a grid of candidate values.
///
/// ```toml
/// [base]
/// experiment_number = 0
/// dataset = "CIFAR10"
/// finetune_epochs = 40
///
/// [grid]
/// model_type = ["VGG", "ResNet20"]
/// prune_method = ["RandomPruning", "GlobalMagWeight"]
/// prune_compression = [2, 4, 8]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepFile {
    /// Fields shared by every combination.
    pub base: Map<String, Value>,
    /// Candidate values per field.
    pub grid: BTreeMap<String, Vec<Value>>,
}

impl SweepFile {
    /// Load a sweep from a TOML or JSON file (chosen by extension).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Settings`] if the file cannot be parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = if path.extension().is_some_and(|ext| ext == "json") {
            Figment::from(Json::file(path))
        } else {
            Figment::from(Toml::file(path))
        };
        figment.extract().map_err(|e| Error::Settings(Box::new(e)))
    }

    /// Number of combinations the grid expands to.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grid.values().map(Vec::len).product()
    }

    /// True when the grid expands to no combinations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One configuration per grid combination, grid values overriding `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a combination is not a valid configuration.
    pub fn configs(&self) -> Result<Vec<ExperimentConfig>> {
        expand(self.grid.clone())
            .into_iter()
            .enumerate()
            .map(|(index, combination)| {
                let mut fields = self.base.clone();
                fields.extend(combination);
                let config: ExperimentConfig = serde_json::from_value(Value::Object(fields))
                    .map_err(|e| {
                        Error::configuration("sweep", format!("combination {index}: {e}"))
                    })?;
                config.validate_request()?;
                Ok(config)
            })
            .collect()
    }
}
