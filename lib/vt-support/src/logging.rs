use serdeconv;
use slog::Logger;
use sloggers;

/// Builds the process-wide logger. `quiet` and `level` come from the
/// resolved `AppConfig` (`vt_quiet`, `vt_debug_level`); color is forced off
/// when `vt_color` is false since terminal escapes break redirected logs.
pub fn init(level: &str, color: bool, quiet: bool) -> Logger {
    use sloggers::{Config, LoggerConfig};

    if quiet {
        return Logger::root(slog::Discard, slog::o!());
    }

    let toml = format!(
        r#"
type = "terminal"
level = "{level}"
destination = "stderr"
color = {color}
"#,
        level = level,
        color = color,
    );

    let config: LoggerConfig = serdeconv::from_toml_str(&toml).expect("invalid logging config");

    config.build_logger().expect("failed to build logger")
}

/// Default logger for contexts that never call `init` explicitly (unit tests,
/// the demo binaries before `AppConfig` is loaded).
pub fn default_logger() -> Logger {
    init("debug", true, false)
}
