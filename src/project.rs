//! The project file driving a build.
//!
//! A small TOML document naming the stage payloads and the directories
//! whose contents become the embedded filesystem. Relative paths are
//! resolved against the project file's directory.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULT_PROJECT_FILE: &str = "WahDocument.toml";

/// The merged tool configuration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Project {
    pub document: Document,
    pub machine: Machine,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Document {
    /// Directories copied into the embedded filesystem.
    #[serde(default)]
    pub root: Vec<PathBuf>,
    /// Where the artifact goes; `--out` overrides.
    pub out: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Machine {
    /// The kernel module run by the sandbox.
    pub kernel: PathBuf,
    pub stage0_script: PathBuf,
    pub stage1: PathBuf,
    pub stage1_html: Option<PathBuf>,
    pub stage2: PathBuf,
    pub wasm_bindgen: Option<PathBuf>,
    /// Arguments the standard configuration program passes to init.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

impl Project {
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let base = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECT_FILE));

        let contents = std::fs::read_to_string(&base)?;
        let mut project: Project = toml::from_str(&contents)?;

        let dir = base
            .parent()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        project.absolute_paths(dir);

        Ok(project)
    }

    fn absolute_paths(&mut self, base: &Path) {
        for root in &mut self.document.root {
            *root = base.join(&root);
        }
        if let Some(out) = &mut self.document.out {
            *out = base.join(&out);
        }

        let machine = &mut self.machine;
        machine.kernel = base.join(&machine.kernel);
        machine.stage0_script = base.join(&machine.stage0_script);
        machine.stage1 = base.join(&machine.stage1);
        machine.stage2 = base.join(&machine.stage2);
        if let Some(html) = &mut machine.stage1_html {
            *html = base.join(&html);
        }
        if let Some(bindgen) = &mut machine.wasm_bindgen {
            *bindgen = base.join(&bindgen);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_project() {
        let text = r#"
            [Document]
            root = ["fs"]

            [Machine]
            kernel = "kernel.wasm"
            stage0-script = "stage0.js"
            stage1 = "stage1.js"
            stage2 = "stage2.js"
            args = ["init"]
        "#;

        let project: Project = toml::from_str(text).unwrap();
        assert_eq!(project.document.root, vec![PathBuf::from("fs")]);
        assert_eq!(project.machine.args, vec!["init"]);
        assert!(project.machine.stage1_html.is_none());
    }

    #[test]
    fn unknown_keys_are_refused() {
        let text = r#"
            [Document]
            unexpected = true

            [Machine]
            kernel = "kernel.wasm"
            stage0-script = "s0.js"
            stage1 = "s1.js"
            stage2 = "s2.js"
        "#;

        assert!(toml::from_str::<Project>(text).is_err());
    }
}
