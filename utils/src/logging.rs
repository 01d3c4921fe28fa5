// Logger setup
//
// Everything logs through the `log` facade. This installs env_logger
// with our line format:
//
//   [millis]<level> file:line - message
//
// The default level is debug, RUST_LOG overrides it.
use crate::timing::get_current_millis;
use std::io::Write;

const DEFAULT_FILTER: &str = "debug";

fn builder() -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(DEFAULT_FILTER));

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{:?}]<{}> {}:{} - {}",
            get_current_millis(),
            record.level().as_str().to_lowercase(),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        )
    });

    builder
}

/// Install the global logger
///
/// Safe to call more than once, later calls are ignored.
pub fn init() {
    let _ = builder().try_init();
}

/// Install the logger for a test binary
///
/// Output is captured by the test harness.
pub fn init_test() {
    let _ = builder().is_test(true).try_init();
}
