use std::process;

use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = minicon::cli::parse();

    if let Err(e) = minicon::cli::commands::dispatch(args) {
        eprintln!("minicon: {e:#}");
        process::exit(1);
    }
}
