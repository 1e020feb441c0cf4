//! Runs JavaScript files in a worker.
//!
//! ```text
//! cargo run -p jsworker --example run_script -- [engine flags] FILE...
//! ```
//!
//! `.mjs` files are loaded as modules; their imports are read from disk
//! relative to the current directory. The host answers every `send` with a
//! copy of the bytes it was given.

use std::process::ExitCode;

use jsworker::{set_flags, version, Worker, RESOLVED};

fn resolve_from_disk(worker: &mut Worker, specifier: &str, referrer: &str) -> i32 {
    let source = match std::fs::read_to_string(specifier) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!("[resolve] {} (imported by {}): {}", specifier, referrer, e);
            return 1;
        }
    };
    match worker.load_module(specifier, &source, resolve_from_disk) {
        Ok(()) => RESOLVED,
        Err(e) => {
            tracing::error!("[resolve] {}", e);
            1
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let files = set_flags(std::env::args().skip(1));
    if files.is_empty() {
        eprintln!("usage: run_script [engine flags] FILE...");
        return ExitCode::FAILURE;
    }
    tracing::info!("Running {} file(s) on {}", files.len(), version());

    let mut worker = match Worker::new(|msg: &[u8]| {
        tracing::info!("[host] Received {} bytes", msg.len());
        Some(msg.to_vec())
    }) {
        Ok(worker) => worker,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    for file in &files {
        let source = match std::fs::read_to_string(file) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("{}: {}", file, e);
                return ExitCode::FAILURE;
            }
        };
        let result = if file.ends_with(".mjs") {
            worker.load_module(file, &source, resolve_from_disk)
        } else {
            worker.load(file, &source)
        };
        if let Err(e) = result {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
