//! The `ctx` object handed to script handlers: read-only views into the
//! current request plus mutable response fields. Built fresh inside
//! `Lua::scope` for each handler invocation so its borrows into the
//! connection's ring buffer cannot outlive that one call — the Rust
//! compiler enforces the "valid only for one handler invocation"
//! invariant instead of a manual reset discipline.

use crate::router::ParamArray;
use mlua::{AnyUserData, MetaMethod, UserData, UserDataFields, UserDataMethods, Value};

/// Request-side view and response-side storage, bound to one
/// invocation's borrow scope.
pub struct ExchangeData<'req> {
    pub method: &'req str,
    pub path: &'req str,
    pub body: &'req [u8],
    pub status: &'req mut u16,
    pub response_body: &'req mut Vec<u8>,
    pub params_view: AnyUserData<'req>,
    pub headers_view: AnyUserData<'req>,
}

impl<'req> UserData for ExchangeData<'req> {
    fn add_fields<'lua, F: UserDataFields<'lua, Self>>(_fields: &mut F) {}

    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            match key.as_str() {
                "method" => Ok(Value::String(lua.create_string(this.method)?)),
                "path" => Ok(Value::String(lua.create_string(this.path)?)),
                // Read-only request view, distinct from the write target
                // of the same name (see __newindex below).
                "body" => Ok(Value::String(lua.create_string(this.body)?)),
                "status" => Ok(Value::Integer(*this.status as i64)),
                "params" => Ok(Value::UserData(this.params_view.clone())),
                "headers" => Ok(Value::UserData(this.headers_view.clone())),
                _ => Ok(Value::Nil),
            }
        });

        methods.add_meta_method_mut(
            MetaMethod::NewIndex,
            |_lua, this, (key, value): (String, Value)| {
                match key.as_str() {
                    "status" => {
                        if let Value::Integer(n) = value {
                            *this.status = n as u16;
                        } else if let Value::Number(n) = value {
                            *this.status = n as u16;
                        }
                    }
                    "body" => {
                        if let Value::String(s) = value {
                            this.response_body.clear();
                            this.response_body.extend_from_slice(s.as_bytes());
                        }
                    }
                    // Read-only fields (method, path, params) and unknown
                    // keys: silently ignored.
                    _ => {}
                }
                Ok(())
            },
        );
    }
}

/// Read-only proxy for `ctx.params.<name>`.
pub struct ParamsView<'req>(pub ParamArray<'req>);

impl<'req> UserData for ParamsView<'req> {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            match this.0.get(&key) {
                Some(value) => Ok(Value::String(lua.create_string(value)?)),
                None => Ok(Value::Nil),
            }
        });
    }
}

/// Case-insensitive header proxy: reads scan request headers first, then
/// response headers already written this request; writes append a
/// response header.
pub struct HeadersView<'req> {
    pub request_headers: &'req [httparse::Header<'req>],
    pub response_headers: &'req mut Vec<(String, String)>,
}

impl<'req> UserData for HeadersView<'req> {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            if let Some(header) = this
                .request_headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(&key))
            {
                return Ok(Value::String(lua.create_string(header.value)?));
            }
            if let Some((_, value)) = this
                .response_headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&key))
            {
                return Ok(Value::String(lua.create_string(value.as_bytes())?));
            }
            Ok(Value::Nil)
        });

        methods.add_meta_method_mut(
            MetaMethod::NewIndex,
            |_lua, this, (key, value): (String, String)| {
                this.response_headers.push((key, value));
                Ok(())
            },
        );
    }
}
