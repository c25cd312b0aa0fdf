//! Pattern-keyed dispatch tables.
//!
//! A [`PathRouter`] is populated once at construction time and only read
//! afterwards. Patterns are globs: `*` matches within a path segment, `**`
//! crosses segments, and a pattern with no metacharacters matches exactly.
//! The first registered pattern that matches wins.
//!
//! ```
//! use uplink_core::router::PathRouter;
//!
//! let mut routes = PathRouter::new();
//! routes.register("/todos/*", "todo");
//! routes.register("/**", "fallback");
//! assert_eq!(routes.resolve("/todos/12"), Some(&"todo"));
//! assert_eq!(routes.resolve("/anything/else"), Some(&"fallback"));
//! ```

use glob_match::glob_match;

pub struct PathRouter<T> {
    routes: Vec<(String, T)>,
}

impl<T> PathRouter<T> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `value` under a glob pattern.
    pub fn register(&mut self, pattern: impl Into<String>, value: T) {
        self.routes.push((pattern.into(), value));
    }

    /// Value registered under the first pattern matching `path`.
    pub fn resolve(&self, path: &str) -> Option<&T> {
        self.routes
            .iter()
            .find(|(pattern, _)| glob_match(pattern, path))
            .map(|(_, value)| value)
    }

    /// Whether any registered pattern matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<T> Default for PathRouter<T> {
    fn default() -> Self {
        Self::new()
    }
}
