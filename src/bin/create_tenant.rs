//! Out-of-band tenant provisioning.
//!
//! Usage: create_tenant <tenant_id> <api_key> [name]
//!
//! Admission limits come from DEFAULT_MAX_CONCURRENT_JOBS and
//! DEFAULT_RATE_LIMIT_PER_MINUTE; edit the row directly to override them
//! for a single tenant.

use sqlx::postgres::PgPoolOptions;

use jobwell::config::Config;
use jobwell::store::Store;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let (Some(tenant_id), Some(api_key)) = (args.next(), args.next()) else {
        eprintln!("usage: create_tenant <tenant_id> <api_key> [name]");
        std::process::exit(1);
    };
    let name = args.next();

    let config = Config::from_env().expect("invalid configuration");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    let store = Store::new(pool);
    store.init_schema().await.expect("failed to initialize schema");

    let tenant = store
        .create_tenant(
            &tenant_id,
            &api_key,
            name.as_deref(),
            config.default_max_concurrent_jobs,
            config.default_rate_limit_per_minute,
        )
        .await
        .expect("failed to create tenant");

    println!("tenant created");
    println!("  id:                    {}", tenant.id);
    println!("  api key:               {api_key}");
    println!("  max concurrent jobs:   {}", tenant.max_concurrent_jobs);
    println!("  rate limit per minute: {}", tenant.rate_limit_per_minute);
}
