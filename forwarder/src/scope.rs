//! Request-scoped header values.

use std::collections::BTreeMap;
use std::sync::Arc;

/// The per-request mapping from canonical header name to the value that
/// must flow onto the forwarded request.
///
/// A scope is built by the listener's handler for exactly one request and
/// travels in that request's extensions. It is never stored on a
/// connection, a handler, the outbound transport, or any process-global —
/// that is the invariant that keeps header values from one request off the
/// next request on a reused upstream connection.
#[derive(Clone, Debug, Default)]
pub struct RequestScope(Arc<BTreeMap<String, String>>);

impl RequestScope {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(Arc::new(entries))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_are_cheap_to_clone_and_immutable() {
        let scope = RequestScope::new(
            [("X-Request-Id".to_string(), "abc".to_string())]
                .into_iter()
                .collect(),
        );
        let copy = scope.clone();
        assert_eq!(copy.len(), 1);
        assert_eq!(
            copy.iter().collect::<Vec<_>>(),
            vec![("X-Request-Id", "abc")]
        );
    }
}
