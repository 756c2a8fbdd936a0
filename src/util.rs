/// Renders raw wire bytes for logs, escaping CR, LF and anything else that
/// isn't printable ASCII.
pub(crate) fn escape_wire(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}
