//! Logger bootstrap for hosts and tests.
//!
//! The library itself only talks to the `log` facade. Binaries that want the
//! default formatting call [`init`] once at startup.

use std::io::Write;

/// Install an `env_logger` that honours `RUST_LOG` and prefixes each record
/// with the emitting thread, which makes worker activity easy to follow.
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init() {
    let _ = builder().try_init();
}

/// Same as [`init`] but captured by the test harness.
pub fn init_for_tests() {
    let _ = builder().is_test(true).try_init();
}

fn builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .target(env_logger::Target::Stdout)
        .filter_level(log::LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{} {} {}] {}",
                record.level(),
                thread.name().unwrap_or("unnamed"),
                record.target(),
                record.args()
            )
        });
    builder
}
