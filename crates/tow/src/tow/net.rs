use std::borrow::Cow;

/// Expands the `":PORT"` shorthand (all interfaces) into something `TcpListener::bind` accepts.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    match addr.strip_prefix(':') {
        Some(port) => Cow::Owned(format!("0.0.0.0:{port}")),
        None => Cow::Borrowed(addr),
    }
}
