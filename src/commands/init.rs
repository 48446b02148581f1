use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use schemars::schema_for;

use crate::config::{Config, DelegationConfig, DelegationRule, LoopDef, LoopStep, Profile};
use crate::error::OrchardError;
use crate::paths::Paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Config file format
    #[arg(long, value_enum, default_value = "yaml")]
    pub format: ConfigFormat,
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let existing = paths.config_file();
        if existing.exists() && !self.force {
            return Err(OrchardError::Config(format!(
                "{} already exists; use --force to overwrite",
                existing.display()
            ))
            .into());
        }

        let config = starter_config();
        let (name, body) = match self.format {
            ConfigFormat::Yaml => ("profiles.yaml", yaml_with_header(&config)?),
            ConfigFormat::Toml => ("profiles.toml", config.to_toml()?),
        };
        fs::create_dir_all(paths.root()).with_context(|| format!("creating {}", paths.root().display()))?;
        let target = paths.root().join(name);
        if self.force && existing.exists() && existing != target {
            fs::remove_file(&existing).with_context(|| format!("removing {}", existing.display()))?;
        }
        fs::write(&target, body).with_context(|| format!("writing {}", target.display()))?;
        println!("Generated {}", target.display());
        Ok(())
    }
}

fn yaml_with_header(config: &Config) -> anyhow::Result<String> {
    Ok(format!(
        "# orchard configuration\n# Profiles, loops, roles, and prompt rules. Run `orchard schema` for every key.\n\n{}",
        config.to_yaml()?
    ))
}

/// A lead/worker/reviewer setup that works with the built-in families.
pub fn starter_config() -> Config {
    let mut lead = Profile::new("lead", "claude");
    lead.model = Some("opus".to_string());
    lead.description = Some("Plans work and delegates it".to_string());

    let mut worker = Profile::new("worker", "claude");
    worker.model = Some("sonnet".to_string());
    worker.max_instances = Some(3);
    worker.description = Some("Implements one delegated task".to_string());

    let mut reviewer = Profile::new("reviewer", "codex");
    reviewer.role = Some("reviewer".to_string());
    reviewer.max_instances = Some(1);

    let mut plan_step = LoopStep::new("lead");
    plan_step.role = "lead".to_string();
    plan_step.can_stop = true;
    plan_step.can_message = true;
    plan_step.can_pushover = true;
    plan_step.delegation = Some(DelegationConfig {
        profiles: vec![
            DelegationRule::new("worker", &["developer"]),
            DelegationRule::new("reviewer", &["reviewer"]),
        ],
        max_parallel: Some(3),
    });

    let mut review_step = LoopStep::new("reviewer");
    review_step.role = "reviewer".to_string();
    review_step.can_message = true;

    let mut config = Config {
        profiles: vec![lead, worker, reviewer],
        loops: vec![LoopDef {
            name: "dev".to_string(),
            max_cycles: 10,
            steps: vec![plan_step, review_step],
        }],
        ..Config::default()
    };
    config.normalize();
    config
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    /// Write the schema to a file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl SchemaArgs {
    /// Print the JSON Schema for `profiles.yaml`.
    pub fn execute(&self) -> anyhow::Result<()> {
        let schema = schema_for!(Config);
        let json = serde_json::to_string_pretty(&schema)?;
        match &self.output {
            Some(path) => fs::write(path, format!("{json}\n")).with_context(|| format!("writing {}", path.display())),
            None => {
                println!("{json}");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starter_config_is_valid_and_resolvable() {
        let config = starter_config();
        config.validate().unwrap();
        let def = config.find_loop("dev").unwrap();
        let resolved = config.resolve_loop(def).unwrap();
        assert_eq!(resolved.steps.len(), 2);
        assert_eq!(resolved.steps[1].role.name, "reviewer");
    }

    #[test]
    fn starter_config_survives_both_formats() {
        let config = starter_config();
        let from_yaml = Config::parse_yaml(&yaml_with_header(&config).unwrap()).unwrap();
        assert_eq!(from_yaml.profiles.len(), 3);
        let from_toml = Config::parse_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(from_toml.loops[0].name, "dev");
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path());
        let args = InitArgs {
            format: ConfigFormat::Yaml,
            force: false,
        };
        args.execute(&paths).unwrap();
        assert!(dir.path().join("profiles.yaml").exists());
        let err = args.execute(&paths).unwrap_err();
        assert_eq!(crate::error::kind_of(&err), crate::error::ErrorKind::ConfigInvalid);
    }
}
