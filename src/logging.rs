//! Process-wide logging init, following the teacher's `once_cell`-guarded
//! single-initialization idiom so tests and multiple `Peer`s in one process
//! never double-install the logger.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Install `env_logger` as the global logger. Safe to call more than once —
/// only the first call has any effect.
pub fn init() {
    INIT.get_or_init(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(cfg!(test))
            .try_init();
    });
}
