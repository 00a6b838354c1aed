//! Embedded LuaJIT scripting bridge: one interpreter per worker, one
//! reusable-per-request exchange object, zero-copy request views.

mod bridge;
mod exchange;

pub use bridge::{InvokeOutcome, ScriptEngine, ScriptError};
