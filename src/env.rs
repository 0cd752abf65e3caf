//! `CodeCell` and `NotebookEnv` — the core's input data model (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CellLanguage {
    Js,
    Ts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeCell {
    pub id: String,
    pub language: CellLanguage,
    #[serde(default)]
    pub metadata: CellMetadata,
}

/// Packages + variables available to a notebook's workspace (spec §3
/// `NotebookEnv`). `packages` is canonicalized on construction: names are
/// trimmed, empty entries removed, and a missing version defaults to
/// `"latest"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotebookEnv {
    pub packages: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
}

impl NotebookEnv {
    pub fn new(
        packages: impl IntoIterator<Item = (String, String)>,
        variables: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        NotebookEnv {
            packages: canonicalize_packages(packages),
            variables: variables.into_iter().collect(),
        }
    }

    /// A stable fingerprint of `packages`: the JSON of sorted `[name,
    /// version]` pairs. `BTreeMap` already iterates in key order, so this
    /// is just a serialization of the canonical map.
    pub fn packages_fingerprint(&self) -> String {
        let pairs: Vec<(&String, &String)> = self.packages.iter().collect();
        serde_json::to_string(&pairs).expect("package pairs are always serializable")
    }

    /// The per-cell `process.env` view: variable names trimmed, empty
    /// dropped, with `FORCE_COLOR=1` injected unless already present
    /// (spec §4.3 "process proxy").
    pub fn exposed_variables(&self) -> BTreeMap<String, String> {
        let mut exposed: BTreeMap<String, String> = self
            .variables
            .iter()
            .filter_map(|(name, value)| {
                let name = name.trim();
                if name.is_empty() {
                    None
                } else {
                    Some((name.to_string(), value.clone()))
                }
            })
            .collect();

        exposed
            .entry("FORCE_COLOR".to_string())
            .or_insert_with(|| "1".to_string());

        exposed
    }
}

fn canonicalize_packages(
    packages: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    packages
        .into_iter()
        .filter_map(|(name, version)| {
            let name = name.trim().to_string();
            if name.is_empty() {
                return None;
            }
            let version = version.trim();
            let version = if version.is_empty() {
                "latest".to_string()
            } else {
                version.to_string()
            };
            Some((name, version))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_packages() {
        let env = NotebookEnv::new(
            vec![
                (" lodash ".to_string(), "".to_string()),
                ("".to_string(), "1.0.0".to_string()),
                ("axios".to_string(), " 1.6.0 ".to_string()),
            ],
            vec![],
        );
        assert_eq!(env.packages.get("lodash").map(String::as_str), Some("latest"));
        assert_eq!(env.packages.get("axios").map(String::as_str), Some("1.6.0"));
        assert_eq!(env.packages.len(), 2);
    }

    #[test]
    fn fingerprint_is_stable_regardless_of_insertion_order() {
        let a = NotebookEnv::new(
            vec![("b".into(), "1".into()), ("a".into(), "2".into())],
            vec![],
        );
        let b = NotebookEnv::new(
            vec![("a".into(), "2".into()), ("b".into(), "1".into())],
            vec![],
        );
        assert_eq!(a.packages_fingerprint(), b.packages_fingerprint());
    }

    #[test]
    fn exposed_variables_trims_and_drops_empty_names() {
        let env = NotebookEnv::new(
            vec![],
            vec![
                (" API_KEY ".to_string(), "secret".to_string()),
                ("  ".to_string(), "dropped".to_string()),
            ],
        );
        let exposed = env.exposed_variables();
        assert_eq!(exposed.get("API_KEY").map(String::as_str), Some("secret"));
        assert_eq!(exposed.get("FORCE_COLOR").map(String::as_str), Some("1"));
        assert_eq!(exposed.len(), 2);
    }

    #[test]
    fn exposed_variables_respects_explicit_force_color() {
        let env = NotebookEnv::new(vec![], vec![("FORCE_COLOR".to_string(), "0".to_string())]);
        assert_eq!(env.exposed_variables().get("FORCE_COLOR").map(String::as_str), Some("0"));
    }
}
