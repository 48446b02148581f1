use clap::Args;

use crate::error::OrchardError;
use crate::paths::Paths;
use crate::session::daemon;

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Session to run
    #[arg(long)]
    pub session: u64,
}

impl DaemonArgs {
    pub fn execute(&self, paths: &Paths) -> anyhow::Result<()> {
        let outcome = daemon::run(paths, self.session)?;
        match outcome.exit_kind() {
            None => Ok(()),
            Some(kind) => Err(OrchardError::Remote {
                kind,
                message: format!("session {} ended: {}", self.session, outcome.reason.as_str()),
            }
            .into()),
        }
    }
}
