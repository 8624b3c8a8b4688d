use crate::StateSnapshot;

/// Parse the body of a `STATE` line: whitespace-separated `KEY:VALUE` tokens.
///
/// Tokens without a `:` or with an empty key or value are skipped. A repeated key keeps its
/// last value. Values are not interpreted.
pub fn parse_state(body: &str) -> StateSnapshot {
    let mut snap = StateSnapshot::new();
    for token in body.split_whitespace() {
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        snap.insert(key, value);
    }
    snap
}
