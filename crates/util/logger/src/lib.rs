//! Logger setup, adapted from the teacher's `ethcore-logger`
//! (`bin/oe/logger/src/lib.rs`). The teacher's `RotatingLogger` is
//! dropped: nothing in this crate exposes an RPC surface to query
//! captured log lines.

use ansi_term::Colour;
use env_logger::{Builder as LogBuilder, Formatter};
use log::{LevelFilter, Record};
use std::{env, fs, io::Write, thread};

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Config {
    pub mode: Option<String>,
    pub color: bool,
    pub file: Option<String>,
}

/// Configures the global logger. Filters `ws`/`hyper` down to `Warn` and
/// `rustls` down to `Error` the way the teacher does, then layers on
/// `RUST_LOG` and `config.mode`.
pub fn setup_log(config: &Config) -> Result<(), String> {
    let mut builder = LogBuilder::new();
    builder.filter(Some("ws"), LevelFilter::Warn);
    builder.filter(Some("hyper"), LevelFilter::Warn);
    builder.filter(Some("rustls"), LevelFilter::Error);
    builder.filter(None, LevelFilter::Info);

    if let Ok(lvl) = env::var("RUST_LOG") {
        builder.parse(&lvl);
    }
    if let Some(ref s) = config.mode {
        builder.parse(s);
    }

    let isatty = atty::is(atty::Stream::Stderr);
    let enable_color = config.color && isatty;

    let mut open_options = fs::OpenOptions::new();
    let maybe_file = match config.file.as_ref() {
        Some(f) => Some(
            open_options
                .append(true)
                .create(true)
                .open(f)
                .map_err(|e| format!("cannot write to log file {f}: {e}"))?,
        ),
        None => None,
    };

    let format = move |buf: &mut Formatter, record: &Record| {
        let utc_time = chrono::Utc::now();
        let timestamp = utc_time.format("%Y-%m-%d %H:%M:%S %Z").to_string();
        let name = thread::current().name().map_or_else(Default::default, |x| x.to_string());
        let plain = format!("{timestamp} {name} {} {}  {}", record.level(), record.target(), record.args());

        if let Some(mut file) = maybe_file.as_ref() {
            let _ = file.write_all(plain.as_bytes());
            let _ = file.write_all(b"\n");
        }

        if enable_color {
            let colored = format!(
                "{} {} {} {}  {}",
                Colour::Black.bold().paint(timestamp),
                Colour::Blue.bold().paint(name),
                record.level(),
                record.target(),
                record.args()
            );
            writeln!(buf, "{colored}")
        } else {
            writeln!(buf, "{plain}")
        }
    };

    builder.format(format);
    builder.try_init().map_err(|e| format!("{e:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_colored_and_unfiled() {
        let config = Config::default();
        assert!(!config.color);
        assert!(config.mode.is_none());
        assert!(config.file.is_none());
    }
}
