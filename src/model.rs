// SPDX-License-Identifier: BSD-3-Clause
//! Client-provided configuration: the entry point, how undefined calls are
//! treated, which external functions allocate, and write summaries for
//! modeled library routines.

use std::collections::HashMap;

use regex::RegexSet;

/// Allocation-family classification of an external function.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocKind {
    Malloc,
    Calloc,
    Alloca,
    Realloc,
}

/// A model offset: a literal byte count, or a reference to a call operand
/// whose constant value supplies the count.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelOffset {
    Offset(u64),
    Operand(usize),
}

/// The byte range `[from, to)` a modeled function may write through a
/// pointer parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ByteRange {
    pub from: ModelOffset,
    pub to: ModelOffset,
}

/// A library-function summary: per parameter index, the range it defines.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FunctionModel {
    pub name: String,
    pub defines: Vec<Option<ByteRange>>,
}

impl FunctionModel {
    pub fn defines(&self, operand: usize) -> Option<&ByteRange> {
        self.defines.get(operand).and_then(|d| d.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid model name pattern: {0}")]
    Regex(#[from] regex::Error),
    #[error("malformed model description: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registry of function models, keyed by name patterns.
#[derive(Debug)]
pub struct Models {
    models: Vec<FunctionModel>,
    set: RegexSet,
}

impl Default for Models {
    fn default() -> Self {
        Models {
            models: Vec::new(),
            set: RegexSet::new::<[String; 0], _>([]).unwrap(),
        }
    }
}

impl Models {
    pub fn new(models: Vec<FunctionModel>) -> Result<Self, ModelError> {
        let set = RegexSet::new(models.iter().map(|m| &m.name))?;
        Ok(Models { models, set })
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Models::new(serde_json::from_str(json)?)
    }

    /// The first model whose name pattern matches `func`.
    pub fn model_for(&self, func: &str) -> Option<&FunctionModel> {
        self.set
            .matches(func)
            .into_iter()
            .next()
            .map(|i| &self.models[i])
    }
}

/// Builder configuration.
#[derive(Debug)]
pub struct Options {
    /// Name of the function the graph is rooted in.
    pub entry_function: String,
    /// Treat undefined external calls as side-effect free.
    pub undefined_are_pure: bool,
    /// Track uses (loads) in addition to definitions.
    pub track_uses: bool,
    /// Thread-primitive names, matched exactly.
    pub thread_create: String,
    pub thread_join: String,
    allocation_functions: HashMap<String, AllocKind>,
    pub models: Models,
}

impl Default for Options {
    fn default() -> Self {
        let mut allocation_functions = HashMap::new();
        allocation_functions.insert("malloc".to_string(), AllocKind::Malloc);
        allocation_functions.insert("calloc".to_string(), AllocKind::Calloc);
        allocation_functions.insert("alloca".to_string(), AllocKind::Alloca);
        allocation_functions.insert("realloc".to_string(), AllocKind::Realloc);
        Options {
            entry_function: "main".to_string(),
            undefined_are_pure: false,
            track_uses: true,
            thread_create: "pthread_create".to_string(),
            thread_join: "pthread_join".to_string(),
            allocation_functions,
            models: Models::default(),
        }
    }
}

impl Options {
    pub fn allocation_function(&self, name: &str) -> Option<AllocKind> {
        self.allocation_functions.get(name).copied()
    }

    pub fn register_allocation_function(&mut self, name: &str, kind: AllocKind) {
        self.allocation_functions.insert(name.to_string(), kind);
    }

    pub fn function_model(&self, name: &str) -> Option<&FunctionModel> {
        self.models.model_for(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{ModelOffset, Models, Options};

    #[test]
    fn empty_registry() {
        let models = Models::new(Vec::new()).unwrap();
        assert!(models.model_for("f").is_none());
    }

    #[test]
    fn models_from_json() {
        let models = Models::from_json(
            r#"[{
                "name": "memset_s",
                "defines": [
                    {"from": {"offset": 0}, "to": {"operand": 3}},
                    null
                ]
            }]"#,
        )
        .unwrap();
        let m = models.model_for("memset_s").unwrap();
        assert_eq!(m.defines(0).unwrap().to, ModelOffset::Operand(3));
        assert!(m.defines(1).is_none());
        assert!(m.defines(7).is_none());
    }

    #[test]
    fn default_allocation_functions() {
        let opts = Options::default();
        assert!(opts.allocation_function("malloc").is_some());
        assert!(opts.allocation_function("free").is_none());
    }
}
