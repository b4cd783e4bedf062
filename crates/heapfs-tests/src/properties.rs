//! Property-based checks of the resolver and the content store.
