//! Tracing subscriber setup.

use mindcast_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Build the filter used when `RUST_LOG` is not set.
fn build_filter(level: &str, filters: &[String]) -> EnvFilter {
    let mut filter = EnvFilter::new(level);
    for directive in filters {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Ignoring invalid log filter {directive:?}: {e}"),
        }
    }
    filter
}

/// Install the global subscriber. `RUST_LOG` takes precedence over config.
pub fn init(config: Option<&LoggingConfig>, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let filters = config.map(|l| l.filters.as_slice()).unwrap_or_default();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| build_filter(&level, filters));

    let json = config.is_some_and(|l| l.format == "json");
    let stdout = config.is_some_and(|l| l.output == "stdout");

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_includes_directives() {
        let filter = build_filter("info", &["mindcast_gateway=debug".to_string()]);
        let rendered = filter.to_string();
        assert!(rendered.contains("info"));
        assert!(rendered.contains("mindcast_gateway=debug"));
    }

    #[test]
    fn test_invalid_directive_is_skipped() {
        let filter = build_filter("warn", &["mindcast=loud".to_string()]);
        let rendered = filter.to_string();
        assert!(rendered.contains("warn"));
        assert!(!rendered.contains("loud"));
    }
}
