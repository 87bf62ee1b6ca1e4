use clap::Parser;

use puente::config::{Ctx, Env};
use puente::launch;
use puente::telemetry::setup_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = Env::parse();
    let ctx = Ctx::load(&env)?;

    setup_tracing(&ctx.log_level);

    launch(ctx).await
}
