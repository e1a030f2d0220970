//! `planbot start` / `planbot resume` / `planbot serve`: build the engine
//! from a queue file plus the operator config and run the queue.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use planbot_core::config::Config;
use planbot_core::driver::ClaudeDriver;
use planbot_core::events::{EventSink, TracingSink};
use planbot_core::mux::Multiplexer;
use planbot_core::orchestrator::Orchestrator;
use planbot_core::provider::telegram::{TelegramConfig, TelegramProvider};
use planbot_core::provider::terminal::TerminalProvider;
use planbot_core::provider::ResponseRouter;
use planbot_core::queue::load_queue_file;
use planbot_store::StateStore;

use crate::config::ConfigFile;
use crate::serve_cmd::{ServeState, check_secret_policy, run_serve};

/// Command-line overrides applied on top of the queue file's config block.
#[derive(Debug, Clone, Default)]
pub struct RunFlags {
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub auto_approve: bool,
    pub continue_on_error: bool,
    pub skip_permissions: bool,
    pub acknowledge_autonomous_risk: bool,
    pub no_plan: bool,
    /// Attach the Telegram provider from the operator config.
    pub telegram: bool,
    /// Run the webhook server alongside the queue.
    pub serve: bool,
    /// Allow serving without a signing secret.
    pub insecure: bool,
    /// Resume from persisted state instead of starting fresh.
    pub resume: bool,
}

/// Merge the queue file's config with command-line overrides. The queue
/// file can never enable `skip_permissions` (validation rejects it); only
/// the flag here can.
fn merge_config(file_config: Option<Config>, flags: &RunFlags) -> Config {
    let mut config = file_config.unwrap_or_default();
    if let Some(model) = &flags.model {
        config.model = Some(model.clone());
    }
    if let Some(fallback) = &flags.fallback_model {
        config.fallback_model = Some(fallback.clone());
    }
    if flags.auto_approve {
        config.auto_approve = true;
    }
    if flags.continue_on_error {
        config.continue_on_error = true;
    }
    if flags.skip_permissions {
        config.skip_permissions = true;
    }
    if flags.acknowledge_autonomous_risk {
        config.acknowledge_autonomous_risk = true;
    }
    if flags.no_plan {
        config.plan_mode = false;
    }
    config
}

pub async fn run_start(queue_path: &Path, flags: RunFlags, operator: &ConfigFile) -> Result<()> {
    let queue = load_queue_file(queue_path)?;
    let config = merge_config(queue.config.clone(), &flags);

    let root = queue_path.parent().unwrap_or(Path::new("."));
    let store = StateStore::new(root);

    let router = Arc::new(ResponseRouter::new());
    let mux = Arc::new(Multiplexer::new(
        Arc::clone(&router),
        config.timeouts.approval(),
        config.timeouts.question(),
    ));
    mux.add_provider(Arc::new(TerminalProvider::new(Arc::clone(&router))));
    if flags.telegram {
        let (bot_token, chat_id) = operator.telegram_credentials().context(
            "telegram provider requested but bot_token/chat_id are not configured; \
             run `planbot init` and edit the config file",
        )?;
        mux.add_provider(Arc::new(TelegramProvider::new(
            TelegramConfig {
                bot_token,
                chat_id,
                api_base: None,
            },
            Arc::clone(&router),
        )));
    }

    let driver = Arc::new(match &operator.driver.binary {
        Some(binary) => ClaudeDriver::with_binary(binary.clone()),
        None => ClaudeDriver::new(),
    });
    let events: Arc<dyn EventSink> = Arc::new(TracingSink);

    let orchestrator = Orchestrator::new(config, queue.tickets, driver, mux, store, events)?
        .with_hooks(queue.hooks.unwrap_or_default())
        .with_queue_path(queue_path.to_path_buf())
        .with_cwd(std::env::current_dir().context("failed to resolve working directory")?);

    // Optional webhook server, sharing the run's response router.
    let server = if flags.serve {
        let secret = operator.webhook_secret()?;
        check_secret_policy(&secret, flags.insecure)?;
        let state = Arc::new(ServeState {
            router,
            secret,
            started_at: Instant::now(),
        });
        let port = operator.webhook.port;
        Some(tokio::spawn(async move {
            if let Err(e) = run_serve(state, "127.0.0.1", port).await {
                tracing::error!(error = %e, "webhook server exited with an error");
            }
        }))
    } else {
        None
    };

    let result = if flags.resume {
        orchestrator.resume().await
    } else {
        orchestrator.start().await
    };

    if let Some(server) = server {
        server.abort();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_config() {
        let file_config = Config {
            model: Some("opus".into()),
            ..Config::default()
        };
        let flags = RunFlags {
            model: Some("sonnet".into()),
            auto_approve: true,
            no_plan: true,
            ..RunFlags::default()
        };
        let merged = merge_config(Some(file_config), &flags);
        assert_eq!(merged.model.as_deref(), Some("sonnet"));
        assert!(merged.auto_approve);
        assert!(!merged.plan_mode);
        // Untouched settings keep their file values/defaults.
        assert_eq!(merged.max_plan_revisions, 3);
        assert!(!merged.skip_permissions);
    }

    #[test]
    fn skip_permissions_comes_only_from_flags() {
        let merged = merge_config(None, &RunFlags::default());
        assert!(!merged.skip_permissions);

        let merged = merge_config(
            None,
            &RunFlags {
                skip_permissions: true,
                ..RunFlags::default()
            },
        );
        assert!(merged.skip_permissions);
    }
}
