use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};
use sqlx::PgPool;
use uuid::Uuid;

use keeper_server::app::App;
use keeper_server::config::Config;
use keeper_server::matches::{Core, MatchCtx, Request};
use keeper_server::state::User;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the config file
    #[clap(short, long, default_value = "kconfig.yaml")]
    config: String,
}

/// Demo core: tags itself from the creation meta and relays custom
/// packets exactly as their senders addressed them.
struct EchoCore;

impl Core for EchoCore {
    fn on_init(&mut self, ctx: &mut MatchCtx, meta: &[u8]) -> anyhow::Result<()> {
        if !meta.is_empty() {
            ctx.set_tag(meta)
                .map_err(|err| anyhow::anyhow!("invalid tag: {err}"))?;
        }
        Ok(())
    }

    fn on_custom_request(&mut self, ctx: &mut MatchCtx, requests: &[Request]) -> anyhow::Result<()> {
        for request in requests {
            ctx.resend_packet(&request.packet);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err((fallback, err)) => {
            eprintln!("failed to load config, (using default): {err}");
            fallback
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log.level.as_str()),
    )
    .init();

    info!("Connecting database...");
    let db = match PgPool::connect(&config.db.connection_string()).await {
        Ok(pool) => pool,
        Err(err) => {
            error!("cannot connect to database: {err}");
            std::process::exit(1);
        }
    };
    if config.db.ssl_mode == "disable" {
        warn!("Database is running without ssl.");
    }

    let app = match App::launch(config, Some(db)) {
        Ok(app) => app,
        Err(err) => {
            error!("cannot start server: {err}");
            std::process::exit(1);
        }
    };

    // Demo wiring: any credentials yield a half-hour session. A real
    // deployment replaces this with a database-backed verifier.
    app.register_email_login_handler(|_state, email, _password, addr| {
        debug!("Email login handler called with email {email} from address {addr}");
        Ok(Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(30 * 60),
            addr,
        )))
    });

    app.register_core("echo", Box::new(|| Box::new(EchoCore) as Box<dyn Core>));
    app.manager.add_string_category("mode");
    app.manager.add_int_category("size");

    if let Err(err) = app.serve().await {
        error!("Http server shut down due to error: {err}");
        std::process::exit(1);
    }
}
