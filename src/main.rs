//! Binary entry point.
//!
//! Exit codes: 0 normal, 2 configuration error, 70 internal error.

use grepwise::cli::Cli;
use grepwise::Application;

const EXIT_CONFIG: i32 = 2;
const EXIT_INTERNAL: i32 = 70;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let config = match cli.load_config().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(EXIT_CONFIG);
        },
    };

    cli.init_logging(config.logging.structured);

    if cli.check_config {
        println!("configuration OK");
        return;
    }

    let app = match Application::new(config) {
        Ok(app) => app,
        Err(e) => {
            let code = if e.category() == "config" {
                EXIT_CONFIG
            } else {
                EXIT_INTERNAL
            };
            tracing::error!("failed to start: {}", e);
            std::process::exit(code);
        },
    };

    if let Err(e) = app.run().await {
        tracing::error!("fatal error: {}", e);
        std::process::exit(EXIT_INTERNAL);
    }
}
