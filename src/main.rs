use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use sydradb::{Config, Engine};

fn main() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .pretty()
        .init();

    let config = Config::default();
    info!(data_dir = ?config.data_dir, "starting sydradb");

    let engine = match Engine::init(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to initialize storage engine");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        error!(error = %e, "failed to install ctrl-c handler; running without graceful shutdown support");
    }

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("shutting down");
    engine.deinit();
}
