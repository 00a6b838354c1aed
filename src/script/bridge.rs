//! Registers the `keystone` global and drives per-request handler
//! invocation through the scripting interpreter's protected-call
//! mechanism.

use crate::router::{ParamArray, Router};
use crate::script::exchange::{ExchangeData, HeadersView, ParamsView};
use mlua::{Lua, RegistryKey};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug)]
pub enum ScriptError {
    Setup(mlua::Error),
    Load(mlua::Error),
    /// A route was registered for an invalid pattern.
    InvalidRoute(String),
    /// Internal: the route-building closure outlived script execution.
    RouterStillShared,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Setup(e) => write!(f, "failed to set up scripting bridge: {e}"),
            ScriptError::Load(e) => write!(f, "failed to load route script: {e}"),
            ScriptError::InvalidRoute(msg) => write!(f, "{msg}"),
            ScriptError::RouterStillShared => {
                write!(f, "route table still referenced after script load")
            }
        }
    }
}

impl std::error::Error for ScriptError {}

/// Result of one handler invocation, as seen by the connection driving
/// the response.
pub enum InvokeOutcome {
    /// Handler ran and left a valid status in `ctx.status`.
    Ok(u16),
    /// The route's handler ref did not resolve to a callable value.
    NotCallable,
    /// The handler raised, or left `ctx.status` outside 100..599.
    ScriptError,
}

/// One worker's LuaJIT interpreter. `!Send`/`!Sync` by virtue of wrapping
/// `mlua::Lua`, which naturally enforces shared-nothing, one-per-worker
/// ownership.
pub struct ScriptEngine {
    lua: Lua,
}

impl ScriptEngine {
    /// Executes `source`, collecting every `keystone.add_route(...)` call
    /// into a `Router`. Returns the engine (to invoke handlers against
    /// later) and the populated router.
    pub fn load(source: &str) -> Result<(Self, Router<RegistryKey>), ScriptError> {
        let lua = Lua::new();
        let router = Rc::new(RefCell::new(Router::new()));

        {
            let router_for_closure = Rc::clone(&router);
            let add_route = lua
                .create_function(
                    move |lua, (method, pattern, handler): (String, String, mlua::Function)| {
                        let key = lua.create_registry_value(handler)?;
                        router_for_closure
                            .borrow_mut()
                            .add_route(&method, &pattern, key)
                            .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
                    },
                )
                .map_err(ScriptError::Setup)?;

            let keystone_table = lua.create_table().map_err(ScriptError::Setup)?;
            keystone_table
                .set("add_route", add_route)
                .map_err(ScriptError::Setup)?;
            lua.globals()
                .set("keystone", keystone_table)
                .map_err(ScriptError::Setup)?;
        }

        lua.load(source).exec().map_err(ScriptError::Load)?;

        let router = Rc::try_unwrap(router)
            .map_err(|_| ScriptError::RouterStillShared)?
            .into_inner();

        Ok((Self { lua }, router))
    }

    /// Invokes `handler` with a freshly built exchange bound to this
    /// request's spans. `response_body`/`response_headers` are the
    /// connection's own reset-retaining-capacity storage; on return they
    /// hold whatever the handler wrote (or are untouched on failure).
    pub fn invoke(
        &self,
        handler: &RegistryKey,
        method: &str,
        path: &str,
        body: &[u8],
        request_headers: &[httparse::Header<'_>],
        params: ParamArray<'_>,
        response_body: &mut Vec<u8>,
        response_headers: &mut Vec<(String, String)>,
    ) -> InvokeOutcome {
        let handler_fn: mlua::Function = match self.lua.registry_value(handler) {
            Ok(f) => f,
            Err(_) => return InvokeOutcome::NotCallable,
        };

        let mut status: u16 = 200;

        let call_result = self.lua.scope(|scope| {
            let params_view = scope.create_nonstatic_userdata(ParamsView(params))?;
            let headers_view = scope.create_nonstatic_userdata(HeadersView {
                request_headers,
                response_headers,
            })?;
            let exchange = scope.create_nonstatic_userdata(ExchangeData {
                method,
                path,
                body,
                status: &mut status,
                response_body,
                params_view,
                headers_view,
            })?;

            handler_fn.call::<_, ()>(exchange)
        });

        match call_result {
            Ok(()) if (100..=599).contains(&status) => InvokeOutcome::Ok(status),
            _ => InvokeOutcome::ScriptError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_registers_routes() {
        let (_, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/ping", function(ctx)
                    ctx.status = 200
                    ctx.body = "pong"
                end)
            "#,
        )
        .unwrap();

        let mut params = ParamArray::new();
        assert!(router.match_route("GET", "/ping", &mut params).is_some());
    }

    #[test]
    fn ping_handler_sets_status_and_body() {
        let (engine, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/ping", function(ctx)
                    ctx.status = 200
                    ctx.body = "pong"
                end)
            "#,
        )
        .unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/ping", &mut params).unwrap();

        let mut response_body = Vec::new();
        let mut response_headers = Vec::new();
        let outcome = engine.invoke(
            handler,
            "GET",
            "/ping",
            b"",
            &[],
            params,
            &mut response_body,
            &mut response_headers,
        );

        assert!(matches!(outcome, InvokeOutcome::Ok(200)));
        assert_eq!(response_body, b"pong");
    }

    #[test]
    fn param_capture_visible_to_handler() {
        let (engine, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/users/{id}", function(ctx)
                    ctx.status = 200
                    ctx.body = ctx.params.id
                end)
            "#,
        )
        .unwrap();

        let mut params = ParamArray::new();
        let handler = router
            .match_route("GET", "/users/42", &mut params)
            .unwrap();

        let mut response_body = Vec::new();
        let mut response_headers = Vec::new();
        engine.invoke(
            handler,
            "GET",
            "/users/42",
            b"",
            &[],
            params,
            &mut response_body,
            &mut response_headers,
        );

        assert_eq!(response_body, b"42");
    }

    #[test]
    fn raising_handler_yields_script_error() {
        let (engine, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/boom", function(ctx)
                    error("boom")
                end)
            "#,
        )
        .unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/boom", &mut params).unwrap();

        let mut response_body = Vec::new();
        let mut response_headers = Vec::new();
        let outcome = engine.invoke(
            handler,
            "GET",
            "/boom",
            b"",
            &[],
            params,
            &mut response_body,
            &mut response_headers,
        );

        assert!(matches!(outcome, InvokeOutcome::ScriptError));
    }

    #[test]
    fn status_bled_across_reusable_exchange_does_not_leak() {
        let (engine, router) = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/ping", function(ctx)
                    assert(ctx.status == 200, "status leaked from a previous request")
                    ctx.body = "pong"
                end)
            "#,
        )
        .unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/ping", &mut params).unwrap();

        for _ in 0..2 {
            let mut response_body = Vec::new();
            let mut response_headers = Vec::new();
            let outcome = engine.invoke(
                handler,
                "GET",
                "/ping",
                b"",
                &[],
                params,
                &mut response_body,
                &mut response_headers,
            );
            assert!(matches!(outcome, InvokeOutcome::Ok(200)));
        }
    }

    #[test]
    fn invalid_pattern_rejected_at_load_time() {
        let err = ScriptEngine::load(
            r#"
                keystone.add_route("GET", "/users/{}", function(ctx) end)
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::Load(_)));
    }
}
