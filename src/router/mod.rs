//! Radix-tree router: static and `{param}` path segments, no regex, no
//! backtracking. Static edges are always tried before the parameter edge
//! at the same depth, and once a parameter edge is taken a later mismatch
//! does not retract it.

use std::collections::HashMap;

/// A single captured path parameter: a name from the matched pattern and
/// a value borrowed from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteParam<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

/// Fixed-capacity, allocation-free sequence of captured parameters.
/// A fifth parameter in a pattern is silently dropped.
pub const MAX_PARAMS: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct ParamArray<'a> {
    params: [Option<RouteParam<'a>>; MAX_PARAMS],
    len: usize,
}

impl<'a> ParamArray<'a> {
    pub fn new() -> Self {
        Self {
            params: [None; MAX_PARAMS],
            len: 0,
        }
    }

    /// Record a capture. Beyond `MAX_PARAMS` the capture is dropped,
    /// matching the pattern's own capacity rather than failing the match.
    pub fn push(&mut self, name: &'a str, value: &'a str) {
        if self.len < MAX_PARAMS {
            self.params[self.len] = Some(RouteParam { name, value });
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RouteParam<'a>> + '_ {
        self.params[..self.len].iter().filter_map(|p| *p)
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.iter().find(|p| p.name == name).map(|p| p.value)
    }
}

impl<'a> Default for ParamArray<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum RouterError {
    /// A `{name}` segment with an empty or duplicated (within one
    /// pattern) name.
    InvalidPattern(String),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::InvalidPattern(msg) => write!(f, "invalid route pattern: {msg}"),
        }
    }
}

impl std::error::Error for RouterError {}

struct ParamEdge<H> {
    name: Box<str>,
    node: RouteNode<H>,
}

struct RouteNode<H> {
    static_children: HashMap<Box<str>, RouteNode<H>>,
    param_child: Option<Box<ParamEdge<H>>>,
    handlers: HashMap<String, H>,
}

impl<H> RouteNode<H> {
    fn new() -> Self {
        Self {
            static_children: HashMap::new(),
            param_child: None,
            handlers: HashMap::new(),
        }
    }
}

/// Radix tree mapping `(method, path)` to an opaque handler reference `H`.
/// `H` is intentionally unconstrained: the router only stores and returns
/// it, never inspects it (see `HandlerRef` in the scripting bridge).
pub struct Router<H> {
    root: RouteNode<H>,
}

impl<H> Router<H> {
    pub fn new() -> Self {
        Self {
            root: RouteNode::new(),
        }
    }

    /// Register a handler for `method` at `pattern`. Empty segments
    /// (leading/trailing/doubled slashes) are discarded. A segment
    /// wrapped in `{…}` is a parameter edge; its name must be non-empty
    /// and unique within the pattern.
    pub fn add_route(&mut self, method: &str, pattern: &str, handler: H) -> Result<(), RouterError> {
        let mut seen_params: Vec<&str> = Vec::new();
        let mut node = &mut self.root;

        for segment in segments(pattern) {
            if let Some(name) = param_name(segment) {
                if name.is_empty() {
                    return Err(RouterError::InvalidPattern(format!(
                        "empty parameter name in pattern '{pattern}'"
                    )));
                }
                if seen_params.contains(&name) {
                    return Err(RouterError::InvalidPattern(format!(
                        "duplicate parameter name '{{{name}}}' in pattern '{pattern}'"
                    )));
                }
                seen_params.push(name);

                let edge = node.param_child.get_or_insert_with(|| {
                    Box::new(ParamEdge {
                        name: name.into(),
                        node: RouteNode::new(),
                    })
                });
                node = &mut edge.node;
            } else {
                node = node
                    .static_children
                    .entry(segment.into())
                    .or_insert_with(RouteNode::new);
            }
        }

        node.handlers.insert(method.to_string(), handler);
        Ok(())
    }

    /// Match `method`/`path` against the tree, writing captured
    /// parameters into `params`. Returns the registered handler, or
    /// `None` if no route or no mapping for `method` exists at the
    /// matched node.
    pub fn match_route<'p>(
        &self,
        method: &str,
        path: &'p str,
        params: &mut ParamArray<'p>,
    ) -> Option<&H> {
        let mut node = &self.root;

        for segment in segments(path) {
            if let Some(child) = node.static_children.get(segment) {
                node = child;
            } else if let Some(edge) = &node.param_child {
                params.push(&edge.name, segment);
                node = &edge.node;
            } else {
                return None;
            }
        }

        node.handlers.get(method)
    }
}

impl<H> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn param_name(segment: &str) -> Option<&str> {
    segment
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_route_matches() {
        let mut router = Router::new();
        router.add_route("GET", "/ping", 1u32).unwrap();

        let mut params = ParamArray::new();
        assert_eq!(router.match_route("GET", "/ping", &mut params), Some(&1));
        assert_eq!(params.len(), 0);
    }

    #[test]
    fn unregistered_method_misses() {
        let mut router = Router::new();
        router.add_route("GET", "/ping", 1u32).unwrap();

        let mut params = ParamArray::new();
        assert_eq!(router.match_route("POST", "/ping", &mut params), None);
    }

    #[test]
    fn single_param_capture() {
        let mut router = Router::new();
        router.add_route("GET", "/users/{id}", 7u32).unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/users/42", &mut params);
        assert_eq!(handler, Some(&7));
        assert_eq!(params.get("id"), Some("42"));
    }

    #[test]
    fn four_params_capture_all() {
        let mut router = Router::new();
        router
            .add_route("GET", "/a/{p1}/b/{p2}/{p3}/{p4}", 1u32)
            .unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/a/v1/b/v2/v3/v4", &mut params);
        assert_eq!(handler, Some(&1));
        assert_eq!(params.len(), 4);
        assert_eq!(params.get("p1"), Some("v1"));
        assert_eq!(params.get("p4"), Some("v4"));
    }

    #[test]
    fn fifth_param_is_silently_dropped() {
        let mut router = Router::new();
        router
            .add_route(
                "GET",
                "/{p1}/{p2}/{p3}/{p4}/{p5}",
                1u32,
            )
            .unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/v1/v2/v3/v4/v5", &mut params);
        assert_eq!(handler, Some(&1));
        assert_eq!(params.len(), 4);
        assert_eq!(params.get("p5"), None);
    }

    #[test]
    fn static_beats_parameter_at_same_depth() {
        let mut router = Router::new();
        router.add_route("GET", "/users/me", 1u32).unwrap();
        router.add_route("GET", "/users/{id}", 2u32).unwrap();

        let mut params = ParamArray::new();
        let handler = router.match_route("GET", "/users/me", &mut params);
        assert_eq!(handler, Some(&1));
        assert_eq!(params.len(), 0);
    }

    #[test]
    fn no_match_returns_none() {
        let router: Router<u32> = Router::new();
        let mut params = ParamArray::new();
        assert_eq!(router.match_route("GET", "/missing", &mut params), None);
    }

    #[test]
    fn empty_param_name_is_rejected() {
        let mut router: Router<u32> = Router::new();
        let err = router.add_route("GET", "/users/{}", 1).unwrap_err();
        assert!(matches!(err, RouterError::InvalidPattern(_)));
    }

    #[test]
    fn duplicate_param_name_in_one_pattern_is_rejected() {
        let mut router: Router<u32> = Router::new();
        let err = router
            .add_route("GET", "/a/{id}/b/{id}", 1)
            .unwrap_err();
        assert!(matches!(err, RouterError::InvalidPattern(_)));
    }
}
