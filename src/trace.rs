use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured log levels.
pub const LOG_ENV: &str = "WATCHHUB_LOG";

/// Installs the global fmt subscriber. `levels` uses the `EnvFilter`
/// directive syntax, e.g. `info,watchhub=debug`; invalid directives fall
/// back to `info`.
pub fn init(color: bool, levels: &str) {
    let filter = EnvFilter::try_new(levels).unwrap_or_else(|_| EnvFilter::new("info"));

    // a second init, e.g. from tests, keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_ansi(color)
        .with_target(false)
        .with_env_filter(filter)
        .try_init();
}

/// Resolves the log directives, the environment wins over `fallback`.
pub fn levels(fallback: &str) -> String {
    std::env::var(LOG_ENV).unwrap_or_else(|_| match fallback {
        "off" => "off".to_owned(),
        level => [
            format!("watchhub={level}"),
            format!("kubernetes={level}"),
            "hyper=warn".to_owned(),
            "rustls=warn".to_owned(),
        ]
        .join(","),
    })
}
