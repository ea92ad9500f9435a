//! Application bootstrap: wires state, data plane, match manager and the
//! HTTP control plane together and exposes the registration surface the
//! application configures before serving.

use std::sync::Arc;

use log::info;
use sqlx::PgPool;

use crate::config::Config;
use crate::listener::Listener;
use crate::manager::{CoreFactory, Manager};
use crate::router::{Router, RpcHandler};
use crate::rpc::{self, EmailLoginHandler, EmailRegisterHandler};
use crate::state::State;

/// The assembled server. Register cores, index categories and RPC
/// handlers, then call [`App::serve`].
pub struct App {
    pub state: Arc<State>,
    pub manager: Arc<Manager>,
    pub listener: Arc<Listener>,
    pub router: Arc<Router>,
}

impl App {
    /// Binds the data plane and assembles every component. Fails on bind
    /// errors, which the caller treats as fatal.
    pub fn launch(config: Config, db: Option<PgPool>) -> anyhow::Result<App> {
        let state = State::new(config, db);

        let manager = Manager::new(Arc::clone(&state));

        let listener = Listener::new(
            Arc::clone(&state),
            &state.config().net.connection_string(),
        )?;
        let acceptor: Arc<dyn crate::listener::Acceptor> = Arc::clone(&manager) as Arc<dyn crate::listener::Acceptor>;
        listener.register_acceptor("match", acceptor);

        info!("Initializing router...");
        let router = Router::new(Arc::clone(&state));
        rpc::register_builtin(&router, &manager);

        Ok(App { state, manager, listener, router })
    }

    /// Registers a match-core factory under the id `create-match` looks
    /// up.
    pub fn register_core(&self, id: impl Into<String>, factory: CoreFactory) {
        self.manager.register_core(id, factory);
    }

    pub fn register_rpc(&self, id: impl Into<String>, handlers: Vec<RpcHandler>) {
        self.router.register_rpc(id, handlers);
    }

    pub fn register_email_register_handler(&self, handler: impl EmailRegisterHandler) {
        rpc::register_email_register_handler(&self.router, handler);
    }

    pub fn register_email_login_handler(&self, handler: impl EmailLoginHandler) {
        rpc::register_email_login_handler(&self.router, handler);
    }

    /// Freezes registration, starts the data-plane accept loop and serves
    /// the control plane until it dies.
    pub async fn serve(self) -> anyhow::Result<()> {
        self.manager.finish();
        self.listener.run();

        let addr = self.state.config().net.http_connection_string();
        info!("Starting HTTP server ({addr})...");
        self.router.serve(&addr).await
    }
}
