//! Tier/Subtest Resolver (C3).
//!
//! Enumerates subtests per tier from a fixture directory and assembles the
//! per-run agent prompt from shared building blocks. A subtest declares
//! the resources it needs either by bare name or by a category/level pair
//! that expands against a shared resource library directory, so `Resource`
//! is an enum over both forms rather than a single flat representation.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{SubtestId, TierId};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Resource {
    Named(String),
    Category { category: String, level: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSet {
    #[serde(default)]
    pub skills: Vec<Resource>,
    #[serde(default)]
    pub agents: Vec<Resource>,
    #[serde(default)]
    pub mcp_servers: Vec<Resource>,
    #[serde(default)]
    pub tools: Vec<Resource>,
}

impl ResourceSet {
    fn is_empty(&self) -> bool {
        self.skills.is_empty()
            && self.agents.is_empty()
            && self.mcp_servers.is_empty()
            && self.tools.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubtestConfig {
    pub id: SubtestId,
    #[serde(default)]
    pub system_prompt_overlay: Option<String>,
    #[serde(default)]
    pub resources: ResourceSet,
    #[serde(skip)]
    pub dir: PathBuf,
}

/// Discovers subtests for each tier and composes per-run agent prompts
/// from the fixture's shared building blocks.
pub struct Resolver {
    fixture_dir: PathBuf,
    library_dir: PathBuf,
}

impl Resolver {
    pub fn new(fixture_dir: PathBuf) -> Self {
        let library_dir = fixture_dir.join("library");
        Self {
            fixture_dir,
            library_dir,
        }
    }

    /// Enumerate subtests under `<fixture_dir>/<tier_id>/`, sorted
    /// lexicographically. Directory names whose first two characters are
    /// not ASCII digits are ignored.
    pub fn list_subtests(&self, tier_id: &TierId) -> Result<Vec<SubtestConfig>> {
        let tier_dir = self.fixture_dir.join(&tier_id.0);
        let mut ids = Vec::new();
        if tier_dir.is_dir() {
            for entry in fs::read_dir(&tier_dir)
                .with_context(|| format!("reading tier dir {}", tier_dir.display()))?
            {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if starts_with_two_digits(&name) {
                    ids.push(name);
                }
            }
        }
        ids.sort();

        let mut configs = Vec::new();
        for id in ids {
            let subtest_dir = tier_dir.join(&id);
            let config_path = subtest_dir.join("config.yaml");
            let mut config: SubtestConfig = if config_path.is_file() {
                let content = fs::read_to_string(&config_path)
                    .with_context(|| format!("reading {}", config_path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("parsing {}", config_path.display()))?
            } else {
                SubtestConfig {
                    id: SubtestId(id.clone()),
                    system_prompt_overlay: None,
                    resources: ResourceSet::default(),
                    dir: PathBuf::new(),
                }
            };
            config.id = SubtestId(id);
            config.dir = subtest_dir;
            configs.push(config);
        }
        Ok(configs)
    }

    /// Resolve each declared resource into a concrete name list by
    /// reading the shared library directory, returning a map from
    /// category name (`skills`, `agents`, `mcp_servers`, `tools`) to the
    /// resolved list of names.
    pub fn resolve_resources(&self, resources: &ResourceSet) -> BTreeMap<&'static str, Vec<String>> {
        let mut resolved = BTreeMap::new();
        resolved.insert("skills", self.resolve_one(&resources.skills, "skills"));
        resolved.insert("agents", self.resolve_one(&resources.agents, "agents"));
        resolved.insert(
            "mcp_servers",
            self.resolve_one(&resources.mcp_servers, "mcp_servers"),
        );
        resolved.insert("tools", self.resolve_one(&resources.tools, "tools"));
        resolved
    }

    fn resolve_one(&self, items: &[Resource], category_dir: &str) -> Vec<String> {
        let mut names = Vec::new();
        for item in items {
            match item {
                Resource::Named(name) => names.push(name.clone()),
                Resource::Category { category, level } => {
                    let dir = self.library_dir.join(category_dir).join(category).join(level);
                    if let Ok(entries) = fs::read_dir(&dir) {
                        for entry in entries.flatten() {
                            if let Some(stem) = entry.path().file_stem() {
                                names.push(stem.to_string_lossy().into_owned());
                            }
                        }
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Compose the final per-run prompt: `task_prompt` with a resource
    /// suffix appended. Absence of resources yields a fixed generic hint
    /// rather than an empty suffix, per the resolver's contract.
    pub fn compose_prompt(&self, subtest: &SubtestConfig, task_prompt: &str) -> String {
        let mut prompt = task_prompt.to_string();
        if let Some(overlay) = &subtest.system_prompt_overlay {
            prompt.push_str("\n\n");
            prompt.push_str(overlay);
        }

        prompt.push_str("\n\n## Available resources\n\n");
        if subtest.resources.is_empty() {
            prompt.push_str(
                "No additional skills, agents, MCP servers, or tools are configured for \
                 this subtest beyond the agent's built-in capabilities.\n",
            );
            return prompt;
        }

        let resolved = self.resolve_resources(&subtest.resources);
        for (category, names) in resolved {
            if names.is_empty() {
                continue;
            }
            writeln!(prompt, "### {}", category).ok();
            for name in names {
                writeln!(prompt, "- {}", name).ok();
            }
            prompt.push('\n');
        }
        prompt
    }

    /// Enumerate tier directories directly under the fixture root, sorted
    /// lexicographically, for callers (the `run` CLI) that weren't given an
    /// explicit `--tiers` list. Uses the same two-ASCII-digit-prefix
    /// convention as `list_subtests`; `library` and dotfiles are excluded
    /// because they aren't tier directories.
    pub fn discover_tiers(&self) -> Result<Vec<TierId>> {
        let mut ids = Vec::new();
        if self.fixture_dir.is_dir() {
            for entry in fs::read_dir(&self.fixture_dir)
                .with_context(|| format!("reading fixture dir {}", self.fixture_dir.display()))?
            {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if starts_with_two_digits(&name) || name.starts_with('T') {
                    ids.push(TierId(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn fixture_dir(&self) -> &Path {
        &self.fixture_dir
    }
}

fn starts_with_two_digits(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_digit())
        && matches!(chars.next(), Some(c) if c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn list_subtests_sorts_and_filters_non_numeric_dirs() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path();
        fs::create_dir_all(fixture.join("T0").join("01-foo")).unwrap();
        fs::create_dir_all(fixture.join("T0").join("00-bar")).unwrap();
        fs::create_dir_all(fixture.join("T0").join("library")).unwrap();

        let resolver = Resolver::new(fixture.to_path_buf());
        let subtests = resolver.list_subtests(&TierId("T0".into())).unwrap();
        let ids: Vec<_> = subtests.iter().map(|s| s.id.0.clone()).collect();
        assert_eq!(ids, vec!["00-bar".to_string(), "01-foo".to_string()]);
    }

    #[test]
    fn compose_prompt_never_empty_suffix() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(dir.path().to_path_buf());
        let subtest = SubtestConfig {
            id: SubtestId("00-empty".into()),
            system_prompt_overlay: None,
            resources: ResourceSet::default(),
            dir: dir.path().to_path_buf(),
        };
        let composed = resolver.compose_prompt(&subtest, "Do the task.");
        assert!(composed.contains("Do the task."));
        assert!(composed.contains("No additional skills"));
    }

    #[test]
    fn compose_prompt_lists_named_resources() {
        let dir = TempDir::new().unwrap();
        let resolver = Resolver::new(dir.path().to_path_buf());
        let subtest = SubtestConfig {
            id: SubtestId("00-empty".into()),
            system_prompt_overlay: None,
            resources: ResourceSet {
                skills: vec![Resource::Named("refactoring".into())],
                ..Default::default()
            },
            dir: dir.path().to_path_buf(),
        };
        let composed = resolver.compose_prompt(&subtest, "Do the task.");
        assert!(composed.contains("refactoring"));
    }
}
