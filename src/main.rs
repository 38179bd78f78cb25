use anyhow::Result;
use hades::{cli, daemon, utils};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    hades::init_logger(options.override_log_level());

    match daemon::hades_daemon_run(&options).await {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            utils::report_error(&e);
            std::process::exit(1);
        }
    }
}
