pub mod defaults;
pub mod delegation;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::OrchardError;

pub use defaults::DEFAULT_ROLE;
pub use delegation::{DelegationConfig, DelegationRule};

/// Top-level `profiles.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub loops: Vec<LoopDef>,
    #[serde(default)]
    pub roles: Vec<RoleDef>,
    #[serde(default)]
    pub prompt_rules: Vec<PromptRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushover: Option<PushoverConfig>,
    /// Agent family overrides and additions, keyed by family id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub families: BTreeMap<String, FamilyConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Profile {
    pub name: String,
    /// Agent family id (claude, codex, gemini, opencode, generic, or a configured family).
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "reasoning")]
    pub reasoning_effort: Option<String>,
    /// Role used when a step leaves its role empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Informational rating, 1-10.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intelligence: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Live instance cap; 0 or absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instances: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Speed>,
}

impl Profile {
    pub fn new(name: &str, agent: &str) -> Self {
        Self {
            name: name.to_string(),
            agent: agent.to_string(),
            model: None,
            reasoning_effort: None,
            role: None,
            intelligence: None,
            description: None,
            max_instances: None,
            speed: None,
        }
    }

    /// Instance cap, `None` when unlimited.
    pub fn instance_cap(&self) -> Option<u32> {
        self.max_instances.filter(|&n| n > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleDef {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub can_write_code: bool,
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PromptRule {
    pub id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoopDef {
    pub name: String,
    /// Number of cycles; 0 runs until a step with stop permission stops the loop.
    #[serde(default)]
    pub max_cycles: u32,
    pub steps: Vec<LoopStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoopStep {
    pub profile: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default = "default_turns")]
    pub turns: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub can_stop: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub can_message: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub can_pushover: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationConfig>,
}

impl LoopStep {
    pub fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            role: String::new(),
            turns: 1,
            instructions: None,
            can_stop: false,
            can_message: false,
            can_pushover: false,
            timeout_secs: None,
            delegation: None,
        }
    }

    /// Turn count with non-positive values coerced to 1.
    pub fn effective_turns(&self) -> u32 {
        u32::try_from(self.turns.max(1)).unwrap_or(u32::MAX)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PushoverConfig {
    #[serde(default)]
    pub user_key: String,
    #[serde(default)]
    pub app_token: String,
}

impl PushoverConfig {
    pub fn is_configured(&self) -> bool {
        !self.user_key.is_empty() && !self.app_token.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningStyle {
    /// `<reasoning_flag> <level>`
    #[default]
    Flag,
    /// `<reasoning_flag> model_reasoning_effort=<level>` (codex-style config override)
    Config,
    /// Family has no reasoning control; the level is ignored.
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PromptDelivery {
    #[default]
    Stdin,
    Arg,
}

/// Launch table entry for one agent family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FamilyConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_flag: Option<String>,
    #[serde(default)]
    pub reasoning_style: ReasoningStyle,
    #[serde(default)]
    pub prompt: PromptDelivery,
    /// Flag preceding the prompt when delivered as an argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_flag: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeConfig {
    #[serde(default = "default_grace")]
    pub grace_period_secs: u64,
    /// Failed turns in a row that are retried; one more ends the loop.
    #[serde(default = "default_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_spawn_queue")]
    pub spawn_queue_secs: u64,
    /// Per-turn deadline; 0 disables it.
    #[serde(default)]
    pub turn_timeout_secs: u64,
    #[serde(default = "default_ring")]
    pub ring_capacity: usize,
    #[serde(default)]
    pub keep_worktrees: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace(),
            max_consecutive_failures: default_failures(),
            spawn_queue_secs: default_spawn_queue(),
            turn_timeout_secs: 0,
            ring_capacity: default_ring(),
            keep_worktrees: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_turns() -> i64 { 1 }
fn default_grace() -> u64 { 5 }
fn default_failures() -> u32 { 3 }
fn default_spawn_queue() -> u64 { 30 }
fn default_ring() -> usize { 1024 }

/// A loop step with its profile, role, and rules looked up.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub step: LoopStep,
    pub profile: Profile,
    pub role: RoleDef,
    pub rules: Vec<PromptRule>,
}

/// A loop ready to run: every reference checked.
#[derive(Debug, Clone)]
pub struct ResolvedLoop {
    pub name: String,
    pub max_cycles: u32,
    pub steps: Vec<ResolvedStep>,
}

impl Config {
    /// Load config from a file (YAML, TOML, or JSON, auto-detected by extension).
    /// A missing file yields the empty default config.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Self::parse_yaml(&contents),
        }
    }

    pub fn parse_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| OrchardError::Config(format!("invalid profiles.yaml: {e}")))?;
        config.finish()
    }

    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| OrchardError::Config(format!("invalid profiles.toml: {e}")))?;
        config.finish()
    }

    pub fn parse_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OrchardError::Config(format!("invalid profiles.json: {e}")))?;
        config.finish()
    }

    fn finish(mut self) -> anyhow::Result<Self> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Fill defaulted delegation roles with the configured default role.
    pub fn normalize(&mut self) {
        let default_role = self.effective_default_role();
        for def in &mut self.loops {
            for step in &mut def.steps {
                if let Some(tree) = step.delegation.as_mut() {
                    tree.apply_default_role(&default_role);
                }
            }
        }
    }

    /// Check load-time invariants: unique names, known rule ids, known roles
    /// and delegation profiles, and acyclic delegation trees.
    pub fn validate(&self) -> anyhow::Result<()> {
        check_unique("profile", self.profiles.iter().map(|p| p.name.as_str()))?;
        check_unique("loop", self.loops.iter().map(|l| l.name.as_str()))?;
        check_unique("role", self.roles.iter().map(|r| r.name.as_str()))?;
        check_unique("prompt rule", self.prompt_rules.iter().map(|r| r.id.as_str()))?;

        for profile in &self.profiles {
            if profile.name.trim().is_empty() {
                return Err(OrchardError::Config("profile with empty name".into()).into());
            }
            if let Some(score) = profile.intelligence
                && !(1..=10).contains(&score)
            {
                return Err(OrchardError::Config(format!(
                    "profile {}: intelligence must be 1-10, got {score}",
                    profile.name
                ))
                .into());
            }
            if let Some(role) = profile.role.as_deref().filter(|r| !r.trim().is_empty()) {
                self.known_role(role, &format!("profile {}", profile.name))?;
            }
        }

        for role in self.all_roles() {
            for id in &role.rule_ids {
                if self.find_rule(id).is_none() {
                    return Err(OrchardError::Config(format!(
                        "role {} references unknown prompt rule {id}",
                        role.name
                    ))
                    .into());
                }
            }
        }

        if let Some(name) = &self.default_role {
            self.find_role(name)?;
        }

        for def in &self.loops {
            if def.steps.is_empty() {
                return Err(
                    OrchardError::Config(format!("loop {} has no steps", def.name)).into(),
                );
            }
            for (idx, step) in def.steps.iter().enumerate() {
                if !step.role.trim().is_empty() {
                    self.known_role(step.role.trim(), &format!("loop {} step {idx}", def.name))?;
                }
                if let Some(tree) = &step.delegation {
                    self.validate_tree(&def.name, idx, tree)?;
                }
            }
        }
        Ok(())
    }

    fn known_role(&self, role: &str, used_by: &str) -> anyhow::Result<()> {
        if self.find_role(role).is_err() {
            return Err(OrchardError::RoleNotFound(format!("{role} (used by {used_by})")).into());
        }
        Ok(())
    }

    fn validate_tree(&self, loop_name: &str, step: usize, tree: &DelegationConfig) -> anyhow::Result<()> {
        for name in tree.profile_names() {
            if self.find_profile(name).is_err() {
                return Err(OrchardError::Config(format!(
                    "loop {loop_name} step {step}: delegation names unknown profile {name}"
                ))
                .into());
            }
        }
        for role in tree.role_names() {
            self.known_role(role, &format!("loop {loop_name} step {step} delegation"))?;
        }
        if let Some(dup) = tree.duplicate_at_level() {
            return Err(OrchardError::Config(format!(
                "loop {loop_name} step {step}: profile {dup} listed twice at one delegation level"
            ))
            .into());
        }
        if let Some(path) = tree.find_cycle(&mut Vec::new()) {
            return Err(OrchardError::Config(format!(
                "loop {loop_name} step {step}: delegation cycle {}",
                path.join(" -> ")
            ))
            .into());
        }
        Ok(())
    }

    pub fn effective_default_role(&self) -> String {
        self.default_role
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_ROLE.to_string())
    }

    pub fn find_profile(&self, name: &str) -> anyhow::Result<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| OrchardError::ProfileNotFound(name.to_string()).into())
    }

    pub fn find_loop(&self, name: &str) -> anyhow::Result<&LoopDef> {
        self.loops
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| OrchardError::LoopNotFound(name.to_string()).into())
    }

    /// Configured roles, or the built-in set when none are configured.
    pub fn all_roles(&self) -> Vec<RoleDef> {
        if self.roles.is_empty() {
            defaults::builtin_roles()
        } else {
            self.roles.clone()
        }
    }

    pub fn find_role(&self, name: &str) -> anyhow::Result<RoleDef> {
        self.all_roles()
            .into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| OrchardError::RoleNotFound(name.to_string()).into())
    }

    pub fn find_rule(&self, id: &str) -> Option<PromptRule> {
        self.prompt_rules
            .iter()
            .find(|r| r.id.eq_ignore_ascii_case(id))
            .cloned()
            .or_else(|| {
                defaults::builtin_rules()
                    .into_iter()
                    .find(|r| r.id.eq_ignore_ascii_case(id))
            })
    }

    /// Rules included by `role`, in the role's order.
    pub fn rules_for(&self, role: &RoleDef) -> Vec<PromptRule> {
        role.rule_ids.iter().filter_map(|id| self.find_rule(id)).collect()
    }

    /// Role for a step: the step's role, else the profile's default, else the
    /// config-wide default role.
    pub fn role_for_step(&self, step: &LoopStep, profile: &Profile) -> anyhow::Result<RoleDef> {
        let name = if !step.role.trim().is_empty() {
            step.role.trim().to_string()
        } else if let Some(role) = profile.role.as_ref().filter(|r| !r.is_empty()) {
            role.clone()
        } else {
            self.effective_default_role()
        };
        self.find_role(&name)
    }

    /// Resolve a `run` target: a loop name, else a profile wrapped in a
    /// single-step, single-cycle loop.
    pub fn resolve_target(&self, target: &str, turns: i64) -> anyhow::Result<LoopDef> {
        if let Ok(def) = self.find_loop(target) {
            return Ok(def.clone());
        }
        match self.find_profile(target) {
            Ok(profile) => {
                let mut step = LoopStep::new(&profile.name);
                step.turns = turns;
                Ok(LoopDef {
                    name: profile.name.clone(),
                    max_cycles: 1,
                    steps: vec![step],
                })
            }
            Err(_) => Err(OrchardError::LoopNotFound(format!(
                "{target} (no loop or profile by that name)"
            ))
            .into()),
        }
    }

    /// Check every reference in `def`. Fails before anything is launched.
    pub fn resolve_loop(&self, def: &LoopDef) -> anyhow::Result<ResolvedLoop> {
        if def.steps.is_empty() {
            return Err(OrchardError::Config(format!("loop {} has no steps", def.name)).into());
        }
        let mut steps = Vec::with_capacity(def.steps.len());
        for (idx, step) in def.steps.iter().enumerate() {
            let profile = self.find_profile(&step.profile).with_context(|| {
                format!("loop {} step {idx}", def.name)
            })?;
            let role = self.role_for_step(step, profile)
                .with_context(|| format!("loop {} step {idx}", def.name))?;
            if let Some(tree) = &step.delegation {
                self.validate_tree(&def.name, idx, tree)?;
            }
            let rules = self.rules_for(&role);
            steps.push(ResolvedStep {
                step: step.clone(),
                profile: profile.clone(),
                role,
                rules,
            });
        }
        Ok(ResolvedLoop {
            name: def.name.clone(),
            max_cycles: def.max_cycles,
            steps,
        })
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        serde_yaml::to_string(self).context("serializing config to YAML")
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# orchard configuration\n# Profiles, loops, roles, and prompt rules\n\n");

        fn set_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(item) = doc.get_mut(key) {
                if let Some(tbl) = item.as_table_mut() {
                    tbl.decor_mut().set_prefix(comment);
                } else if let Some(arr) = item.as_array_of_tables_mut()
                    && let Some(first) = arr.iter_mut().next()
                {
                    first.decor_mut().set_prefix(comment);
                }
            }
        }

        set_comment(&mut doc, "profiles", "\n# Agent profiles: family + model + reasoning\n");
        set_comment(&mut doc, "loops", "\n# Loops: ordered steps, each targeting a profile\n");
        set_comment(&mut doc, "runtime", "\n# Runtime tunables (grace period, retry budget, spawn queue)\n");

        Ok(doc.to_string())
    }
}

fn check_unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(OrchardError::Config(format!("duplicate {what} name: {name}")).into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, kind_of};

    const SAMPLE: &str = r"
default_role: developer
profiles:
  - name: fast
    agent: claude
    model: haiku
    max_instances: 1
    speed: fast
  - name: deep
    agent: codex
    reasoning_effort: high
    intelligence: 9
loops:
  - name: build
    steps:
      - profile: deep
        turns: 0
        can_message: true
        delegation:
          profiles:
            - profile: fast
              role: scout
      - profile: fast
        role: reviewer
        can_stop: true
";

    #[test]
    fn parse_full_yaml_config() {
        let config = Config::parse_yaml(SAMPLE).unwrap();
        assert_eq!(config.profiles.len(), 2);
        assert_eq!(config.find_profile("FAST").unwrap().instance_cap(), Some(1));
        let build = config.find_loop("build").unwrap();
        assert_eq!(build.steps[0].effective_turns(), 1);
        assert!(build.steps[1].can_stop);
        assert_eq!(config.runtime.grace_period_secs, 5);
        assert_eq!(config.runtime.max_consecutive_failures, 3);
    }

    #[test]
    fn missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("profiles.yaml")).unwrap();
        assert!(config.profiles.is_empty());
        assert_eq!(config.effective_default_role(), DEFAULT_ROLE);
    }

    #[test]
    fn duplicate_profile_names_are_case_insensitive() {
        let yaml = "profiles:\n  - {name: a, agent: claude}\n  - {name: A, agent: codex}\n";
        let err = Config::parse_yaml(yaml).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::ConfigInvalid);
        assert!(err.to_string().contains("duplicate profile"));
    }

    #[test]
    fn delegation_to_unknown_profile_rejected() {
        let yaml = r"
profiles:
  - {name: a, agent: claude}
loops:
  - name: l
    steps:
      - profile: a
        delegation:
          profiles:
            - profile: ghost
";
        let err = Config::parse_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown profile ghost"));
    }

    #[test]
    fn delegation_cycle_rejected_at_load() {
        let yaml = r"
profiles:
  - {name: a, agent: claude}
  - {name: b, agent: claude}
loops:
  - name: l
    steps:
      - profile: a
        delegation:
          profiles:
            - profile: b
              delegation:
                profiles:
                  - profile: b
";
        let err = Config::parse_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("delegation cycle"));
    }

    #[test]
    fn unknown_default_role_is_role_not_found() {
        let err = Config::parse_yaml("default_role: wizard\n").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::RoleNotFound);
    }

    #[test]
    fn unknown_step_and_delegation_roles_fail_at_load() {
        let step_role = r"
profiles:
  - {name: a, agent: claude}
loops:
  - name: l
    steps:
      - {profile: a, role: wizard}
";
        let err = Config::parse_yaml(step_role).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::RoleNotFound);
        assert!(err.to_string().contains("loop l step 0"));

        let rule_role = r"
profiles:
  - {name: a, agent: claude}
  - {name: b, agent: claude}
loops:
  - name: l
    steps:
      - profile: a
        delegation:
          profiles:
            - profile: b
              roles: [scout, necromancer]
";
        let err = Config::parse_yaml(rule_role).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::RoleNotFound);
        assert!(err.to_string().contains("necromancer"));

        let profile_role = "profiles:\n  - {name: a, agent: claude, role: bard}\n";
        let err = Config::parse_yaml(profile_role).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::RoleNotFound);
    }

    #[test]
    fn empty_step_role_resolves_to_default_role() {
        let config = Config::parse_yaml(SAMPLE).unwrap();
        let resolved = config.resolve_loop(config.find_loop("build").unwrap()).unwrap();
        assert_eq!(resolved.steps[0].role.name, "developer");
        assert_eq!(resolved.steps[1].role.name, "reviewer");
        assert!(!resolved.steps[1].role.can_write_code);
    }

    #[test]
    fn profile_role_beats_global_default() {
        let yaml = r"
profiles:
  - {name: a, agent: claude, role: scout}
";
        let config = Config::parse_yaml(yaml).unwrap();
        let def = config.resolve_target("a", 1).unwrap();
        let resolved = config.resolve_loop(&def).unwrap();
        assert_eq!(resolved.steps[0].role.name, "scout");
    }

    #[test]
    fn resolve_fails_atomically_on_missing_profile() {
        let config = Config::parse_yaml(SAMPLE).unwrap();
        let mut def = config.find_loop("build").unwrap().clone();
        def.steps.push(LoopStep::new("nobody"));
        let err = config.resolve_loop(&def).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::ProfileNotFound);
    }

    #[test]
    fn resolve_target_wraps_profile() {
        let config = Config::parse_yaml(SAMPLE).unwrap();
        let def = config.resolve_target("deep", 3).unwrap();
        assert_eq!(def.max_cycles, 1);
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].effective_turns(), 3);

        let err = config.resolve_target("nothing", 1).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::LoopNotFound);
    }

    #[test]
    fn delegation_defaults_to_configured_role() {
        let yaml = r"
default_role: lead
profiles:
  - {name: a, agent: claude}
  - {name: b, agent: claude}
loops:
  - name: l
    steps:
      - profile: a
        delegation:
          profiles:
            - profile: b
";
        let config = Config::parse_yaml(yaml).unwrap();
        let tree = config.loops[0].steps[0].delegation.as_ref().unwrap();
        assert_eq!(tree.profiles[0].roles, vec!["lead"]);
    }

    #[test]
    fn loop_round_trip_is_stable() {
        let config = Config::parse_yaml(SAMPLE).unwrap();
        let first = serde_yaml::to_string(&config.loops).unwrap();
        let reparsed: Vec<LoopDef> = serde_yaml::from_str(&first).unwrap();
        let second = serde_yaml::to_string(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn toml_and_json_parse_equivalently() {
        let config = Config::parse_yaml(SAMPLE).unwrap();
        let toml_str = config.to_toml().unwrap();
        assert!(toml_str.starts_with("# orchard configuration"));
        let from_toml = Config::parse_toml(&toml_str).unwrap();
        assert_eq!(from_toml.profiles, config.profiles);

        let json = serde_json::to_string(&config).unwrap();
        let from_json = Config::parse_json(&json).unwrap();
        assert_eq!(from_json.loops, config.loops);
    }

    #[test]
    fn malformed_yaml_is_config_invalid() {
        let err = Config::parse_yaml("profiles: [[[").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn intelligence_out_of_range_rejected() {
        let err = Config::parse_yaml("profiles:\n  - {name: a, agent: claude, intelligence: 11}\n")
            .unwrap_err();
        assert!(err.to_string().contains("intelligence"));
    }
}
