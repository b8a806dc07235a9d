//! Process-wide logging setup, shared by both binaries. Grounded on the
//! `log`+`env_logger` combination already used by this crate's other
//! modules; initialized once from each binary's `main` before anything else
//! runs.

use std::io::Write;

/// Initializes `env_logger` with a default filter of `info` (overridable via
/// `RUST_LOG`), timestamps to millisecond precision, and the module path on
/// each line — useful once both the host and helper process write to the
/// same log aggregator.
pub fn init_logging() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {:>5} {}] {}",
            buf.timestamp_millis(),
            record.level(),
            record.target(),
            record.args()
        )
    });
    // Calling init() twice (e.g. from tests that also exercise a binary's
    // setup path) panics; ignore that case rather than letting it propagate.
    let _ = builder.try_init();
}
