//! Push notifications through Pushover.

use std::time::Duration;

use crate::config::PushoverConfig;
use crate::error::OrchardError;

const PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";
const PUSHOVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can deliver a notification to the operator.
pub trait Notifier: Send + Sync {
    fn send(&self, title: &str, message: &str) -> anyhow::Result<()>;
}

pub struct Pushover {
    user_key: String,
    app_token: String,
}

impl Pushover {
    /// `None` unless both credentials are configured.
    pub fn from_config(config: &PushoverConfig) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }
        Some(Self {
            user_key: config.user_key.clone(),
            app_token: config.app_token.clone(),
        })
    }
}

impl Notifier for Pushover {
    fn send(&self, title: &str, message: &str) -> anyhow::Result<()> {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(PUSHOVER_TIMEOUT))
            .build()
            .into();
        agent
            .post(PUSHOVER_URL)
            .send_form([
                ("token", self.app_token.as_str()),
                ("user", self.user_key.as_str()),
                ("title", title),
                ("message", message),
            ])
            .map_err(|e| OrchardError::PushDelivery(e.to_string()))?;
        tracing::debug!(title, "push delivered");
        Ok(())
    }
}

/// Default title for a notification raised by a session.
pub fn title_for(session_id: u64, loop_name: &str) -> String {
    format!("orchard #{session_id} ({loop_name})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_pushover_is_none() {
        assert!(Pushover::from_config(&PushoverConfig::default()).is_none());
        let half = PushoverConfig {
            user_key: "u".into(),
            app_token: String::new(),
        };
        assert!(Pushover::from_config(&half).is_none());
    }

    #[test]
    fn configured_pushover_is_some() {
        let full = PushoverConfig {
            user_key: "u".into(),
            app_token: "t".into(),
        };
        assert!(Pushover::from_config(&full).is_some());
    }

    #[test]
    fn titles_name_the_session() {
        assert_eq!(title_for(7, "dev"), "orchard #7 (dev)");
    }
}
