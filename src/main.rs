mod cli;

use std::env;

/// Custom hook on panics, kept for release builds of this binary.
fn setup_panic_hook() {
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("\n============================================================");
        eprintln!("nodebooks-runtime has panicked. This is a bug in the runtime.");
        eprintln!("If you can reliably reproduce this, please include the");
        eprintln!("reproduction steps and re-run with RUST_BACKTRACE=1 set.");
        eprintln!();
        eprintln!("Platform: {} {}", env::consts::OS, env::consts::ARCH);
        eprintln!("Version: {}", env!("CARGO_PKG_VERSION"));
        eprintln!("Args: {:?}", env::args().collect::<Vec<_>>());
        eprintln!();
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn main() {
    if !cfg!(debug_assertions) {
        setup_panic_hook();
    }

    cli::run();
}
