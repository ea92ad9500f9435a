//! Builtin RPC handlers: match creation and discovery, one-shot key
//! issuance and the pluggable email authentication surface.
//!
//! The email handlers only parse the wire shape; what "register" and
//! "login" actually mean (password storage, verification mail, database
//! schema) is supplied by the application as closures.

use std::sync::Arc;

use anyhow::anyhow;
use keeper_shared::codec::{Calculator, Reader, Writer};
use uuid::Uuid;

use crate::manager::Manager;
use crate::matches::Match;
use crate::router::{rpc_assert_user, Router, RpcHandler, RpcRequest};
use crate::state::{State, User};

/// Signature of the application's registration backend.
pub trait EmailRegisterHandler:
    Fn(&Arc<State>, &str, &str, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static
{
}
impl<F> EmailRegisterHandler for F where
    F: Fn(&Arc<State>, &str, &str, &[u8]) -> anyhow::Result<()> + Send + Sync + 'static
{
}

/// Signature of the application's login backend. Returns the freshly
/// minted user on success.
pub trait EmailLoginHandler:
    Fn(&Arc<State>, &str, &str, &str) -> anyhow::Result<Arc<User>> + Send + Sync + 'static
{
}
impl<F> EmailLoginHandler for F where
    F: Fn(&Arc<State>, &str, &str, &str) -> anyhow::Result<Arc<User>> + Send + Sync + 'static
{
}

/// Registers `create-match`, `create-key` and `find-match`.
pub fn register_builtin(router: &Router, manager: &Arc<Manager>) {
    router.register_rpc(
        "create-match",
        vec![Arc::new(rpc_assert_user), create_match_handler(manager)],
    );
    router.register_rpc(
        "create-key",
        vec![Arc::new(rpc_assert_user), Arc::new(create_key)],
    );
    router.register_rpc("find-match", vec![find_match_handler(manager)]);
}

fn create_match_handler(manager: &Arc<Manager>) -> RpcHandler {
    let manager = Arc::clone(manager);
    Arc::new(move |state: &Arc<State>,
                   user: Option<&Arc<User>>,
                   request: &RpcRequest,
                   response: &mut Vec<u8>| {
        let user = user.ok_or_else(|| anyhow!("invalid session"))?;

        let mut reader = Reader::new(&request.body);
        let factory_id = reader.string().ok_or_else(|| anyhow!("missing match type"))?;
        let core = manager
            .get_core(&factory_id)
            .ok_or_else(|| anyhow!("unknown match type"))?;

        let match_ = Match::new(
            Arc::clone(state),
            &manager,
            core,
            user,
            Uuid::nil(),
            reader.rest(),
        )?;
        let id = match_.id();
        manager.add_match(match_);

        response.extend_from_slice(id.as_bytes());
        Ok(())
    })
}

fn create_key(
    state: &Arc<State>,
    user: Option<&Arc<User>>,
    _request: &RpcRequest,
    response: &mut Vec<u8>,
) -> anyhow::Result<()> {
    let user = user.ok_or_else(|| anyhow!("invalid session"))?;

    if state.get_key(user.id()).is_some() {
        return Err(anyhow!(
            "you already have key so use it, then you can ask for more"
        ));
    }

    let key = state.create_key(user.id());
    response.extend_from_slice(key.as_bytes());
    Ok(())
}

fn find_match_handler(manager: &Arc<Manager>) -> RpcHandler {
    let manager = Arc::clone(manager);
    Arc::new(move |_state: &Arc<State>,
                   _user: Option<&Arc<User>>,
                   request: &RpcRequest,
                   response: &mut Vec<u8>| {
        let mut reader = Reader::new(&request.body);
        let max = reader.u32().ok_or_else(|| anyhow!("Missing max match amount."))?;
        let ratio = reader.u32().ok_or_else(|| anyhow!("Missing match ratio."))?;

        let matches = manager.search(max, ratio, reader.rest())?;

        let mut writer = Writer::with_capacity(4 + matches.len() * 0xFF);
        writer.u32(matches.len() as u32);
        for &id in &matches {
            writer.uuid(id);
            match manager.get_match(id) {
                Some(match_) => {
                    writer.u32(match_.user_amount());
                    writer.bytes(&match_.info());
                }
                // The match ended between the search and this read.
                None => {
                    writer.u32(0);
                    writer.bytes(&[]);
                }
            }
        }

        response.extend_from_slice(writer.buffer());
        Ok(())
    })
}

/// Wires an application registration backend to the `register-email` RPC.
/// The body is a length-prefixed email and password with free-form meta
/// trailing.
pub fn register_email_register_handler(router: &Router, handler: impl EmailRegisterHandler) {
    router.register_rpc(
        "register-email",
        vec![Arc::new(move |state: &Arc<State>,
                            _user: Option<&Arc<User>>,
                            request: &RpcRequest,
                            response: &mut Vec<u8>| {
            let mut reader = Reader::new(&request.body);
            let email = reader.string().ok_or_else(|| anyhow!("missing email"))?;
            let password = reader.string().ok_or_else(|| anyhow!("missing password"))?;

            handler(state, &email, &password, reader.rest())?;

            response.extend_from_slice(b"OK");
            Ok(())
        })],
    );
}

/// Wires an application login backend to the `login-email` RPC. On
/// success the user is installed into [`State`] and the response carries
/// `id ‖ session ‖ addr ‖ expiration_unix`.
pub fn register_email_login_handler(router: &Router, handler: impl EmailLoginHandler) {
    router.register_rpc(
        "login-email",
        vec![Arc::new(move |state: &Arc<State>,
                            _user: Option<&Arc<User>>,
                            request: &RpcRequest,
                            response: &mut Vec<u8>| {
            let mut reader = Reader::new(&request.body);
            let email = reader.string().ok_or_else(|| anyhow!("missing email"))?;
            let password = reader.string().ok_or_else(|| anyhow!("missing password"))?;

            let addr = request.remote_addr.to_string();
            let user = handler(state, &email, &password, &addr)?;

            let mut calc = Calculator::default();
            calc.uuid().uuid().string(&addr).u64();
            let mut writer = calc.to_writer();
            writer
                .uuid(user.id())
                .uuid(user.session())
                .string(&addr)
                .u64(user.expiration_unix());
            response.extend_from_slice(writer.buffer());

            state.add_user(user);
            Ok(())
        })],
    );
}
