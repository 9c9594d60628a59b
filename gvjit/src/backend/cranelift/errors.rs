use crate::error::JitError;

/// Turns a panic raised inside Cranelift while defining a function into a
/// readable compile error.
pub fn convert_cranelift_error(panic_msg: &str, func_name: &str) -> JitError {
    let message = if panic_msg.contains("declared type of variable")
        && panic_msg.contains("doesn't match type of value")
    {
        "a value of the wrong type was assigned; the body is not well typed".to_string()
    } else if panic_msg.contains("block") && panic_msg.contains("not sealed") {
        "internal error: control flow was left unsealed".to_string()
    } else if panic_msg.contains("undefined value") || panic_msg.contains("undefined variable") {
        "internal error: value used before definition".to_string()
    } else if panic_msg.contains("signature") {
        "a call does not match the callee's signature".to_string()
    } else {
        panic_msg.replace("RUST_BACKTRACE", "debug trace")
    };
    JitError::compile(func_name, message)
}

pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown internal error".to_string()
    }
}
