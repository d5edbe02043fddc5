//! Greeting function for the FaaS runtime
//!
//! Build the binaries and point `_HANDLER` at one of them:
//!
//! - `simple-handler` greets the `name` field of the event
//! - `simple-error` always fails, to exercise error reporting

use faas_runtime_core::{HandlerFailure, InvocationContext};
use serde_json::{json, Value};
use tracing::info;

pub async fn greet(event: Value, context: InvocationContext) -> Result<Value, HandlerFailure> {
    let name = event
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerFailure::new("Missing 'name' field in payload"))?;

    info!(request_id = %context.request_id, "Greeting {name}");
    Ok(json!({
        "message": format!("Hello, {name}!"),
        "processed": true,
    }))
}

pub async fn simulated_error(_event: Value, _context: InvocationContext) -> Result<Value, HandlerFailure> {
    Err(HandlerFailure::new("This is a simulated error from the user function"))
}
