use crate::config::Config;
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// HTTP and TLS stack modules that flood the console during a provider call.
/// Shown only at Trace level.
const FILTERED_MODULES: &[&str] = &["reqwest", "hyper", "hyper_util", "rustls", "h2"];

pub struct Logger {}

impl Logger {
    /// Installs a terminal logger on stderr at `config.log_level_filter`.
    ///
    /// Stdout stays free for the command output (login URL, handoff JSON).
    pub fn init_logger(config: &Config) -> Result<(), log::SetLoggerError> {
        TermLogger::init(
            config.log_level_filter,
            Self::build_log_config(config.log_level_filter),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        )
    }

    /// Modules ignored at `level`.
    fn ignored_modules(level: LevelFilter) -> &'static [&'static str] {
        match level {
            LevelFilter::Trace => &[],
            _ => FILTERED_MODULES,
        }
    }

    fn build_log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();

        for module in Self::ignored_modules(level) {
            builder.add_filter_ignore_str(module);
        }

        builder.build()
    }
}
