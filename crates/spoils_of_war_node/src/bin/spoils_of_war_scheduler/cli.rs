use std::path::PathBuf;
use std::process;

pub(super) const DEFAULT_CONFIG_PATH: &str = "spoils_of_war.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct CliOptions {
    pub config_path: PathBuf,
    pub once: bool,
    pub tick_interval_ms: Option<u64>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            once: false,
            tick_interval_ms: None,
        }
    }
}

pub(super) fn parse_options<'a>(args: impl Iterator<Item = &'a str>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.peekable();

    while let Some(arg) = iter.next() {
        match arg {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--config" => {
                options.config_path = PathBuf::from(
                    iter.next()
                        .ok_or_else(|| "--config requires a path".to_string())?,
                );
            }
            "--once" => {
                options.once = true;
            }
            "--tick-ms" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| "--tick-ms requires a positive integer".to_string())?;
                options.tick_interval_ms = Some(
                    raw.parse::<u64>()
                        .ok()
                        .filter(|value| *value > 0)
                        .ok_or_else(|| "--tick-ms requires a positive integer".to_string())?,
                );
            }
            _ => return Err(format!("unknown option: {arg}")),
        }
    }

    Ok(options)
}

pub(super) fn print_help() {
    println!("Usage: spoils_of_war_scheduler [--config <path>] [--once] [--tick-ms <ms>]");
    println!("Options:");
    println!("  --config <path> TOML config file (default: {DEFAULT_CONFIG_PATH})");
    println!("  --once          Run a single sweep and exit");
    println!("  --tick-ms <ms>  Override scheduler.tick_interval_ms");
    println!("  -h, --help      Show help");
    println!("Logging is controlled by RUST_LOG (default: info).");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_arguments() {
        let options = parse_options(std::iter::empty()).expect("parse");
        assert_eq!(options, CliOptions::default());
    }

    #[test]
    fn parses_config_once_and_tick() {
        let options = parse_options(
            ["--config", "/etc/spoils.toml", "--once", "--tick-ms", "250"].into_iter(),
        )
        .expect("parse");
        assert_eq!(options.config_path, PathBuf::from("/etc/spoils.toml"));
        assert!(options.once);
        assert_eq!(options.tick_interval_ms, Some(250));
    }

    #[test]
    fn rejects_missing_values_and_unknown_flags() {
        assert!(parse_options(["--config"].into_iter()).is_err());
        assert!(parse_options(["--tick-ms", "0"].into_iter()).is_err());
        assert!(parse_options(["--verbose"].into_iter()).is_err());
    }
}
