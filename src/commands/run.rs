use std::path::PathBuf;

use clap::Args;
use serde_json::json;
use tracing::info;

use super::attach::{AttachEnd, attach, session_result};
use super::{OutputFormat, load_config, print_json};
use crate::paths::Paths;
use crate::registry::Registry;
use crate::session::launch::{self, LaunchSpec};
use crate::store::Store;
use crate::worktree;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Loop name, or a profile name to run as a one-step loop
    pub target: String,
    /// Start the session and return without attaching
    #[arg(long)]
    pub detach: bool,
    /// Override the loop's cycle limit (0 = unbounded)
    #[arg(long)]
    pub max_cycles: Option<u32>,
    /// Turns per cycle when the target is a profile
    #[arg(long, default_value_t = 1)]
    pub turns: i64,
    /// Plan the session works on (default: the project's active plan)
    #[arg(long)]
    pub plan: Option<String>,
    /// Model override for every step
    #[arg(long)]
    pub model: Option<String>,
    /// Reasoning effort override for every step
    #[arg(long)]
    pub reasoning: Option<String>,
    /// Run without write access to the working tree
    #[arg(long)]
    pub read_only: bool,
    /// Project root directory (default: the enclosing git repository)
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl RunArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let config = load_config(paths)?;
        Registry::new(paths).sweep(config.runtime.keep_worktrees)?;

        let mut loop_def = config.resolve_target(&self.target, self.turns)?;
        if let Some(n) = self.max_cycles {
            loop_def.max_cycles = n;
        }

        let repo = match &self.project_root {
            Some(root) => root.clone(),
            None => {
                let cwd = std::env::current_dir()?;
                worktree::repo_root(&cwd).unwrap_or(cwd)
            }
        };
        let repo = repo.canonicalize().unwrap_or(repo);
        if let Some(plan) = &self.plan {
            Store::open(paths, &repo)?.get_plan(plan)?;
        }

        let mut spec = LaunchSpec::new(loop_def, &repo, &repo);
        spec.plan_id.clone_from(&self.plan);
        spec.model.clone_from(&self.model);
        spec.reasoning.clone_from(&self.reasoning);
        spec.read_only = self.read_only;

        let meta = launch::start(paths, &config, &spec)?;
        info!(id = meta.id, loop_name = %meta.loop_name, "session launched");
        let format = OutputFormat::resolve(self.format);

        if self.detach {
            if format == OutputFormat::Json {
                print_json(&json!({ "session_id": meta.id, "status": meta.status, "socket": meta.socket_path }))?;
            } else {
                println!("session {} started ({}); attach with `orchard attach {}`", meta.id, meta.loop_name, meta.id);
            }
            return Ok(());
        }

        match attach(paths, &meta, None, format)? {
            AttachEnd::Detached => {
                eprintln!("detached; session {} keeps running", meta.id);
                Ok(())
            }
            AttachEnd::Ended(meta) => session_result(&meta),
        }
    }
}
