use tracing_subscriber::{fmt, EnvFilter};

use crate::{errors::Error, Result};

/// Initialize tracing for the bot.
///
/// Default: `info` everywhere, including our crates. `RUST_LOG` overrides it.
pub fn init(service_name: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(default_directives(service_name))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init()
        .map_err(|e| Error::Logging(format!("subscriber already installed: {e}")))
}

fn default_directives(service_name: &str) -> String {
    format!("info,cgb_core=info,{service_name}=info")
}
