// Logging setup for binaries and tests embedding the crate
use std::io::Write;

/// Initialize the global logger.
///
/// `quiet` keeps errors only, `verbose` enables debug output for this crate.
/// A set `RUST_LOG` takes over completely. Returns false when a logger was
/// already installed, so repeated calls (e.g. from tests) are harmless.
pub fn init_logger(verbose: bool, quiet: bool) -> bool {
    if std::env::var("RUST_LOG").is_ok() {
        return env_logger::try_init().is_ok();
    }

    let default_level = if quiet {
        log::LevelFilter::Error
    } else {
        log::LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level).format(|buf, record| {
        if record.level() <= log::Level::Warn {
            writeln!(buf, "[{}] {}", record.level(), record.args())
        } else if record.level() >= log::Level::Debug {
            writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args())
        } else {
            writeln!(buf, "{}", record.args())
        }
    });

    if verbose && !quiet {
        builder.filter_module(crate::constants::BINARY_NAME, log::LevelFilter::Debug);
        builder.filter_module("reqwest", log::LevelFilter::Info);
        builder.filter_module("hyper", log::LevelFilter::Info);
        builder.filter_module("hyper_util", log::LevelFilter::Info);
        builder.filter_module("rustls", log::LevelFilter::Info);
    }

    builder.try_init().is_ok()
}
