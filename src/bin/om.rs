//! Standalone migration CLI.
//!
//! Operates on the connection named by `REDIS_OM_URL` with no record types
//! registered; applications that need schema-aware commands (status,
//! check-schema, the datetime transition) should embed [`redis_om::cli`]
//! after registering their record types.

use clap::Parser;

use redis_om::cli::{self, Cli, EXIT_TRANSIENT};
use redis_om::migrate::data::DataMigrator;
use redis_om::Om;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let om = match Om::connect().await {
        Ok(om) => om,
        Err(e) => {
            eprintln!("cannot connect: {e}");
            std::process::exit(EXIT_TRANSIENT);
        }
    };
    let mut data = DataMigrator::new(om.client().clone(), om.registered_schemas());
    let code = cli::run(&om, &mut data, cli.command).await;
    std::process::exit(code);
}
