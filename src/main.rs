use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SOCIALFEED_LOG";

fn main() {
    if handle_cli_flags() {
        return;
    }
    init_logging();

    if let Err(err) = socialfeed::run() {
        tracing::debug!(error = ?err, "exiting with error");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("socialfeed {}", socialfeed::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{}", socialfeed::app::USAGE);
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
