//! Daemon entry point.
//!
//! Exit codes: 0 clean shutdown, 1 fatal config error, 2 store migration
//! failure.

use std::process::ExitCode;

use callwatch::config::Config;
use callwatch::daemon::Daemon;

const EXIT_CONFIG: u8 = 1;
const EXIT_MIGRATION: u8 = 2;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = match Config::default_path() {
        Ok(path) => path,
        Err(e) => {
            log::error!("Cannot resolve config path: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Config error at {}: {}", config_path.display(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let daemon = Daemon::new(config, &config_path);

    // Migrations and crash recovery run before any worker starts.
    if let Err(e) = daemon.prepare() {
        log::error!("Startup failed: {}", e);
        if e.is_migration_failure() {
            return ExitCode::from(EXIT_MIGRATION);
        }
        return ExitCode::from(EXIT_CONFIG);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Runtime startup failed: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match runtime.block_on(daemon.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Daemon failed: {}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}
