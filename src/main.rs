use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // RUST_LOG wins for fine-grained directives; LOG_LEVEL is the
    // operator-facing coarse knob.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            tracing_subscriber::EnvFilter::try_new(level)
        })
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match tether::cli::run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("tether: {:#}", e);
            ExitCode::from(1)
        }
    }
}
