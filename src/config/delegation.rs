//! Per-step delegation trees.
//!
//! A step may carry a [`DelegationConfig`] listing which profiles the running
//! agent is allowed to spawn. Each [`DelegationRule`] can nest another config,
//! which becomes the child session's own delegation tree.
//!
//! Input accepts either `role: x` or `roles: [x, y]`; after deserialization a
//! rule always has at least one role. Output uses `role:` for exactly one role
//! and `roles:` otherwise.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Speed;
use super::defaults::DEFAULT_ROLE;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DelegationConfig {
    #[serde(default)]
    pub profiles: Vec<DelegationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawRule", into = "RawRule")]
pub struct DelegationRule {
    pub profile: String,
    pub roles: Vec<String>,
    pub speed: Option<Speed>,
    pub handoff: bool,
    pub delegation: Option<DelegationConfig>,
    /// True when `roles` was filled from the default rather than read.
    defaulted_roles: bool,
}

/// Wire shape of a delegation rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
struct RawRule {
    profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    speed: Option<Speed>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    handoff: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delegation: Option<DelegationConfig>,
}

impl From<RawRule> for DelegationRule {
    fn from(raw: RawRule) -> Self {
        let mut roles: Vec<String> = Vec::new();
        for role in raw.role.into_iter().chain(raw.roles) {
            let role = role.trim().to_string();
            if !role.is_empty() && !roles.iter().any(|r| r.eq_ignore_ascii_case(&role)) {
                roles.push(role);
            }
        }
        let defaulted_roles = roles.is_empty();
        if defaulted_roles {
            roles.push(DEFAULT_ROLE.to_string());
        }
        Self {
            profile: raw.profile,
            roles,
            speed: raw.speed,
            handoff: raw.handoff,
            delegation: raw.delegation,
            defaulted_roles,
        }
    }
}

impl From<DelegationRule> for RawRule {
    fn from(rule: DelegationRule) -> Self {
        let (role, roles) = if rule.roles.len() == 1 {
            (rule.roles.into_iter().next(), Vec::new())
        } else {
            (None, rule.roles)
        };
        Self {
            profile: rule.profile,
            role,
            roles,
            speed: rule.speed,
            handoff: rule.handoff,
            delegation: rule.delegation,
        }
    }
}

impl JsonSchema for DelegationRule {
    fn schema_name() -> String {
        "DelegationRule".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        RawRule::json_schema(generator)
    }
}

impl DelegationRule {
    pub fn new(profile: &str, roles: &[&str]) -> Self {
        Self::from(RawRule {
            profile: profile.to_string(),
            roles: roles.iter().map(ToString::to_string).collect(),
            ..RawRule::default()
        })
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }

    /// Replace a defaulted role with the configured default role.
    pub(crate) fn apply_default_role(&mut self, default_role: &str) {
        if self.defaulted_roles {
            self.roles = vec![default_role.to_string()];
        }
        if let Some(nested) = self.delegation.as_mut() {
            nested.apply_default_role(default_role);
        }
    }
}

impl DelegationConfig {
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Rule for `profile` at this level.
    pub fn rule_for(&self, profile: &str) -> Option<&DelegationRule> {
        self.profiles
            .iter()
            .find(|r| r.profile.eq_ignore_ascii_case(profile))
    }

    /// Walk a `/`-separated path of profile names down the tree. An empty path
    /// addresses this level.
    pub fn descend(&self, path: &str) -> Option<&Self> {
        let mut level = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            level = level.rule_for(segment)?.delegation.as_ref()?;
        }
        Some(level)
    }

    pub(crate) fn apply_default_role(&mut self, default_role: &str) {
        for rule in &mut self.profiles {
            rule.apply_default_role(default_role);
        }
    }

    /// Every profile name mentioned anywhere in the tree.
    pub fn profile_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for rule in &self.profiles {
            out.push(rule.profile.as_str());
            if let Some(nested) = &rule.delegation {
                out.extend(nested.profile_names());
            }
        }
        out
    }

    /// Every role any rule in the tree grants.
    pub fn role_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for rule in &self.profiles {
            out.extend(rule.roles.iter().map(String::as_str));
            if let Some(nested) = &rule.delegation {
                out.extend(nested.role_names());
            }
        }
        out
    }

    /// Find a profile repeated on some root-to-leaf path. `ancestors` holds the
    /// lowercase profile names above this level.
    pub fn find_cycle(&self, ancestors: &mut Vec<String>) -> Option<Vec<String>> {
        for rule in &self.profiles {
            let key = rule.profile.to_ascii_lowercase();
            if ancestors.contains(&key) {
                let mut path = ancestors.clone();
                path.push(key);
                return Some(path);
            }
            if let Some(nested) = &rule.delegation {
                ancestors.push(key);
                let found = nested.find_cycle(ancestors);
                ancestors.pop();
                if found.is_some() {
                    return found;
                }
            }
        }
        None
    }

    /// Profiles listed twice at the same level.
    pub fn duplicate_at_level(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        for rule in &self.profiles {
            if !seen.insert(rule.profile.to_ascii_lowercase()) {
                return Some(rule.profile.as_str());
            }
        }
        for rule in &self.profiles {
            if let Some(dup) = rule.delegation.as_ref().and_then(Self::duplicate_at_level) {
                return Some(dup);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_role_field_normalizes_to_roles() {
        let rule: DelegationRule = serde_yaml::from_str("profile: scout\nrole: reviewer\n").unwrap();
        assert_eq!(rule.roles, vec!["reviewer"]);
    }

    #[test]
    fn both_role_fields_merge_without_duplicates() {
        let rule: DelegationRule =
            serde_yaml::from_str("profile: p\nrole: a\nroles: [a, b]\n").unwrap();
        assert_eq!(rule.roles, vec!["a", "b"]);
    }

    #[test]
    fn empty_roles_fill_default() {
        let rule: DelegationRule = serde_yaml::from_str("profile: p\n").unwrap();
        assert_eq!(rule.roles, vec![DEFAULT_ROLE]);

        let mut cfg = DelegationConfig {
            profiles: vec![rule],
            max_parallel: None,
        };
        cfg.apply_default_role("lead");
        assert_eq!(cfg.profiles[0].roles, vec!["lead"]);
    }

    #[test]
    fn explicit_roles_survive_default_application() {
        let mut cfg = DelegationConfig {
            profiles: vec![DelegationRule::new("p", &["reviewer"])],
            max_parallel: None,
        };
        cfg.apply_default_role("lead");
        assert_eq!(cfg.profiles[0].roles, vec!["reviewer"]);
    }

    #[test]
    fn mixed_tree_reserializes_identically() {
        let yaml = r"
profiles:
- profile: fast
  role: scout
- profile: deep
  roles:
  - developer
  - reviewer
  handoff: true
  delegation:
    profiles:
    - profile: fast
      role: reviewer
";
        let first: DelegationConfig = serde_yaml::from_str(yaml).unwrap();
        let out1 = serde_yaml::to_string(&first).unwrap();
        let second: DelegationConfig = serde_yaml::from_str(&out1).unwrap();
        let out2 = serde_yaml::to_string(&second).unwrap();
        assert_eq!(out1, out2);
        assert!(out1.contains("role: scout"));
        assert!(out1.contains("roles:"));
    }

    #[test]
    fn descend_follows_profile_path() {
        let yaml = r"
profiles:
- profile: a
  delegation:
    profiles:
    - profile: b
";
        let cfg: DelegationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.descend("").unwrap().rule_for("a").is_some());
        assert!(cfg.descend("a").unwrap().rule_for("b").is_some());
        assert!(cfg.descend("a/b").is_none());
        assert!(cfg.descend("missing").is_none());
    }

    #[test]
    fn cycle_detection_reports_path() {
        let yaml = r"
profiles:
- profile: a
  delegation:
    profiles:
    - profile: b
      delegation:
        profiles:
        - profile: A
";
        let cfg: DelegationConfig = serde_yaml::from_str(yaml).unwrap();
        let cycle = cfg.find_cycle(&mut Vec::new()).unwrap();
        assert_eq!(cycle, vec!["a", "b", "a"]);
    }

    #[test]
    fn sibling_reuse_is_not_a_cycle() {
        let yaml = r"
profiles:
- profile: a
  delegation:
    profiles:
    - profile: b
- profile: b
";
        let cfg: DelegationConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.find_cycle(&mut Vec::new()).is_none());
    }
}
