//! The JSON document a scan step returns.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// A module the scanned source can reach, with what defines it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDecl {
    /// Module name.
    pub name: String,
    /// Files whose content defines the module (module map, umbrella header, ...).
    #[serde(default)]
    pub defining_inputs: Vec<PathBuf>,
    /// Arguments the module must be built with.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Names of modules this module imports directly.
    #[serde(default)]
    pub imports: Vec<String>,
}

/// Everything one scan discovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutput {
    /// Non-module files the source includes.
    #[serde(default)]
    pub file_dependencies: Vec<PathBuf>,
    /// Module declarations reachable from the source.
    #[serde(default)]
    pub modules: Vec<ModuleDecl>,
    /// Modules the source imports directly.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Imports the scan step could not locate.
    #[serde(default)]
    pub unresolved: Vec<String>,
}

impl ScanOutput {
    /// Parses the scan step's JSON for the task described by `task`.
    pub fn from_json(task: &str, text: &str) -> Result<Self, ScanError> {
        serde_json::from_str(text).map_err(|e| ScanError::MalformedOutput {
            task: task.to_string(),
            reason: e.to_string(),
        })
    }

    /// Returns the declaration of a module by name.
    pub fn module(&self, name: &str) -> Option<&ModuleDecl> {
        self.modules.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let text = r#"{
            "file_dependencies": ["/src/a.h"],
            "modules": [
                {"name": "A", "defining_inputs": ["/src/A/module.modulemap"], "arguments": ["-DA"], "imports": ["B"]},
                {"name": "B"}
            ],
            "imports": ["A"],
            "unresolved": []
        }"#;
        let out = ScanOutput::from_json("Compile main.c", text).unwrap();
        assert_eq!(out.file_dependencies, vec![PathBuf::from("/src/a.h")]);
        assert_eq!(out.module("A").unwrap().imports, vec!["B".to_string()]);
        assert!(out.module("B").unwrap().defining_inputs.is_empty());
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let out = ScanOutput::from_json("t", "{}").unwrap();
        assert_eq!(out, ScanOutput::default());
    }

    #[test]
    fn malformed_output_names_task() {
        let err = ScanOutput::from_json("Compile main.c", "{not json").unwrap_err();
        assert!(matches!(err, ScanError::MalformedOutput { ref task, .. } if task == "Compile main.c"));
    }
}
