use tracing::Level;

use tether_types::TetherOptions;

/// Install the console subscriber the options ask for.
///
/// Returns whether a subscriber was installed: `false` when console logging
/// is disabled or another global subscriber is already registered (common in
/// embedding applications and under test harnesses).
pub fn init_tracing(options: &TetherOptions) -> bool {
    if !options.enable_console_logging {
        return false;
    }
    let level = if options.enable_detailed_logging {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .is_ok()
}
