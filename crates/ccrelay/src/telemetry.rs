use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub level: String,
    pub json_output: bool,
}

impl TelemetryConfig {
    /// The assistant owns the terminal while it runs, so the quiet default is
    /// `warn`.
    pub fn from_verbosity(verbose: u8, json_output: bool) -> Self {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        Self {
            level: level.to_string(),
            json_output,
        }
    }
}

/// Logs always go to stderr; stdout belongs to command output.
pub fn init_subscriber(config: &TelemetryConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(TelemetryConfig::from_verbosity(0, false).level, "warn");
        assert_eq!(TelemetryConfig::from_verbosity(1, false).level, "info");
        assert_eq!(TelemetryConfig::from_verbosity(3, true).level, "debug");
    }
}
