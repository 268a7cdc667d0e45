//! TunBridge command-line client.
//!
//! Usage: `tunbridge <config.json>`
//!
//! Reads the config file, starts the session and sleeps until the
//! session worker finishes; Ctrl-C and termination signals request a
//! soft stop. Exit code is 1 for argument/IO/config errors, otherwise
//! the transport plugin's serve return.

use std::fs::OpenOptions;
use std::time::Duration;

use tunbridge_core::config::strip_bom;
use tunbridge_core::vpn::session;
use tunbridge_core::ClientConfig;

fn init_logging() {
    // Log to logs/tunbridge.log when possible, stderr otherwise.
    let file = std::fs::create_dir_all("logs").ok().and_then(|_| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open("logs/tunbridge.log")
            .ok()
    });

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    if let Some(file) = file {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn run() -> i32 {
    init_logging();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("Usage: tunbridge <config.json>");
        return 1;
    };

    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error: cannot read '{path}': {e}");
            return 1;
        }
    };
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: '{path}' is not valid UTF-8: {e}");
            return 1;
        }
    };
    let text = strip_bom(&text).to_owned();

    // Reject a bad config here so the exit code is useful; the session
    // worker parses it again for its own use.
    if let Err(e) = ClientConfig::from_json(&text) {
        eprintln!("Error: {e}");
        return 1;
    }

    if session::start(&text) != 0 {
        eprintln!("Error: a session is already running");
        return 1;
    }

    if let Err(e) = ctrlc::set_handler(|| {
        log::info!("cli: interrupt received, stopping");
        session::stop();
    }) {
        log::warn!("cli: failed to install signal handler: {e}");
    }

    while session::is_running() != 0 {
        std::thread::sleep(Duration::from_secs(1));
    }
    session::last_exit_code()
}

fn main() {
    std::process::exit(run());
}
