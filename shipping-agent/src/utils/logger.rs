//! Logging setup for the shipping agent.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directives used when `RUST_LOG` is unset: the agent logs at `level`,
/// everything else only warns. Pipe output of the shipped commands is
/// traced under `shipping_agent::pipeline` and stays hidden below trace.
pub fn default_directives(level: &str) -> String {
    format!("warn,shipping_agent={level}")
}

/// Install the global subscriber. `RUST_LOG` replaces the defaults.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(level))
            .unwrap_or_else(|_| EnvFilter::new(default_directives("info"))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_level_to_agent() {
        assert_eq!(default_directives("debug"), "warn,shipping_agent=debug");
        assert!(EnvFilter::try_new(default_directives("trace")).is_ok());
    }
}
