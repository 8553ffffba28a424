use dlmgr_core::logging;

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(e) = logging::init_logging(cli.verbose) {
        eprintln!("dlmgr: falling back to stderr logging: {e:#}");
        logging::init_logging_stderr(cli.verbose);
    }

    if let Err(err) = cli.dispatch().await {
        eprintln!("dlmgr error: {err:#}");
        std::process::exit(1);
    }
}
