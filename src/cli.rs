use std::ffi::OsString;

use clap::{ArgAction, Parser};

pub const NAME: &str = "hades";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = NAME, version = crate::VERSION)]
#[command(about = "Hades host intrusion detection agent")]
pub struct HadesOpts {
    /// Path of the INI configuration file
    #[arg(long)]
    pub config_file: Option<String>,

    /// Print the details of a single process as JSON and exit
    #[arg(long, value_name = "PID")]
    pub process_info: Option<u32>,

    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
}

impl HadesOpts {
    pub fn override_log_level(&self) -> log::Level {
        log_level_from_verbosity_flag_count(self.verbosity)
    }
}

pub fn parse_from_args() -> HadesOpts {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> HadesOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<HadesOpts, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    HadesOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> log::Level {
    match num {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        2..=u8::MAX => log::Level::Trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = try_parse_from(["hades"]).unwrap();
        assert_eq!(opts.config_file, None);
        assert_eq!(opts.process_info, None);
        assert_eq!(opts.override_log_level(), log::Level::Info);
    }

    #[test]
    fn verbosity() {
        let opts = try_parse_from(["hades", "-v"]).unwrap();
        assert_eq!(opts.override_log_level(), log::Level::Debug);
        let opts = try_parse_from(["hades", "-vvv"]).unwrap();
        assert_eq!(opts.override_log_level(), log::Level::Trace);
    }

    #[test]
    fn options() {
        let opts = try_parse_from([
            "hades",
            "--config-file",
            "/etc/hades.ini",
            "--process-info",
            "42",
        ])
        .unwrap();
        assert_eq!(opts.config_file.as_deref(), Some("/etc/hades.ini"));
        assert_eq!(opts.process_info, Some(42));
        assert!(try_parse_from(["hades", "--process-info", "abc"]).is_err());
    }
}
