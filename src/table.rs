//! The route table: a tree of path segments.
//!
//! Patterns use `/literal/:param/literal2` syntax; a leading `:` marks a
//! capturing segment. Each node holds a per-method handler map, so one path
//! can carry several verbs, and may hold mounted sub-tables. Lookup walks
//! segment by segment, trying the literal child before the parameter child
//! at every depth. Static routes shadow dynamic ones, with backtracking so
//! `/users/me/avatar` can still fall through to `/users/:id/avatar` when
//! the literal subtree has no match. Mounted tables are consulted last, in
//! mount order.
//!
//! A mount shares the child table rather than copying it: registering into
//! the child *after* the mount still takes effect under the prefix, and
//! mounting is transitive through any number of levels.
//!
//! Ambiguity is a registration-time error, never a silent pick: a duplicate
//! `(method, path)`, two parameter segments with different names at the
//! same depth, or a mount whose current contents collide with the occupant
//! of its prefix, all fail with [`Error::Configuration`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::method::Method;

/// A route table shared between a router handle and any mount points.
pub type SharedTable<T> = Arc<RwLock<RouteTable<T>>>;

/// Parameters captured during a lookup, in path order. Values are
/// percent-decoded.
pub type Params = Vec<(String, String)>;

/// Tree of path segments with per-method values at the nodes.
#[derive(Debug)]
pub struct RouteTable<T> {
    root: Node<T>,
}

#[derive(Debug)]
struct Node<T> {
    literals: HashMap<String, Node<T>>,
    param: Option<ParamChild<T>>,
    handlers: HashMap<Method, T>,
    mounts: Vec<SharedTable<T>>,
}

#[derive(Debug)]
struct ParamChild<T> {
    name: String,
    node: Box<Node<T>>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            literals: HashMap::new(),
            param: None,
            handlers: HashMap::new(),
            mounts: Vec::new(),
        }
    }
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self { root: Node::default() }
    }
}

impl<T: Clone> RouteTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTable<T> {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Registers `value` under `(method, pattern)`.
    pub fn register(&mut self, method: Method, pattern: &str, value: T) -> Result<(), Error> {
        let mut node = &mut self.root;
        for segment in segments(pattern) {
            node = descend(node, segment, pattern)?;
        }
        if node.handlers.contains_key(&method) {
            return Err(Error::Configuration(format!(
                "duplicate route {method} {pattern}"
            )));
        }
        node.handlers.insert(method, value);
        Ok(())
    }

    /// Finds the value and captured params for `(method, path)`.
    ///
    /// Returns `None` on no match; never fails for a syntactically valid
    /// path string.
    pub fn lookup(&self, method: Method, path: &str) -> Option<(T, Params)> {
        let parts: Vec<&str> = segments(path).collect();
        let mut params = Params::new();
        walk(&self.root, &parts, method, &mut params)
            .map(|value| (value, params))
    }

    /// Grafts `child` under `prefix`, sharing it: later registrations in
    /// the child are visible here, and mounting nests transitively.
    ///
    /// The child's *current* patterns are checked against the occupant of
    /// the prefix; any collision fails the mount.
    pub fn mount(&mut self, prefix: &str, child: SharedTable<T>) -> Result<(), Error> {
        let mut node = &mut self.root;
        for segment in segments(prefix) {
            node = descend(node, segment, prefix)?;
        }

        let incoming = child.read().unwrap_or_else(|e| e.into_inner()).patterns();
        for (method, pattern) in &incoming {
            let parts: Vec<&str> = segments(pattern).collect();
            check_conflict(node, &parts, *method, prefix)?;
        }

        node.mounts.push(child);
        Ok(())
    }

    /// Every registered `(method, pattern)` pair, including the current
    /// contents of mounted tables of any depth.
    pub fn patterns(&self) -> Vec<(Method, String)> {
        let mut out = Vec::new();
        collect(&self.root, String::new(), &mut out);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.patterns().is_empty()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Steps into (creating if needed) the child for one pattern segment.
fn descend<'n, T>(
    node: &'n mut Node<T>,
    segment: &str,
    pattern: &str,
) -> Result<&'n mut Node<T>, Error> {
    if let Some(name) = segment.strip_prefix(':') {
        if let Some(existing) = &node.param {
            if existing.name != name {
                return Err(Error::Configuration(format!(
                    "conflicting parameter :{name} vs :{} in {pattern}",
                    existing.name
                )));
            }
        }
        let child = node
            .param
            .get_or_insert_with(|| ParamChild { name: name.to_owned(), node: Box::default() });
        Ok(&mut child.node)
    } else {
        Ok(node.literals.entry(segment.to_owned()).or_default())
    }
}

/// Depth-first match: literal child, then parameter child (backtracking),
/// then mounted tables in mount order.
fn walk<T: Clone>(
    node: &Node<T>,
    parts: &[&str],
    method: Method,
    params: &mut Params,
) -> Option<T> {
    let Some((head, tail)) = parts.split_first() else {
        if let Some(value) = node.handlers.get(&method) {
            return Some(value.clone());
        }
        return lookup_mounts(node, parts, method, params);
    };

    if let Some(literal) = node.literals.get(*head) {
        if let Some(found) = walk(literal, tail, method, params) {
            return Some(found);
        }
    }
    if let Some(param) = &node.param {
        let decoded = urlencoding::decode(head)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| (*head).to_owned());
        params.push((param.name.clone(), decoded));
        if let Some(found) = walk(&param.node, tail, method, params) {
            return Some(found);
        }
        params.pop();
    }
    lookup_mounts(node, parts, method, params)
}

fn lookup_mounts<T: Clone>(
    node: &Node<T>,
    parts: &[&str],
    method: Method,
    params: &mut Params,
) -> Option<T> {
    for mount in &node.mounts {
        let table = mount.read().unwrap_or_else(|e| e.into_inner());
        if let Some(found) = walk(&table.root, parts, method, params) {
            return Some(found);
        }
    }
    None
}

/// Walks the pattern the way `register` would and fails on any collision
/// with existing handlers, parameter names, or mounted contents.
fn check_conflict<T: Clone>(
    node: &Node<T>,
    parts: &[&str],
    method: Method,
    prefix: &str,
) -> Result<(), Error> {
    let Some((head, tail)) = parts.split_first() else {
        if node.handlers.contains_key(&method) {
            return Err(Error::Configuration(format!(
                "mount collision on {method} under {prefix}"
            )));
        }
        return Ok(());
    };

    if let Some(name) = head.strip_prefix(':') {
        if let Some(existing) = &node.param {
            if existing.name != name {
                return Err(Error::Configuration(format!(
                    "conflicting parameter :{name} vs :{} under mount {prefix}",
                    existing.name
                )));
            }
            check_conflict(&existing.node, tail, method, prefix)?;
        }
    } else if let Some(literal) = node.literals.get(*head) {
        check_conflict(literal, tail, method, prefix)?;
    }

    for mount in &node.mounts {
        let table = mount.read().unwrap_or_else(|e| e.into_inner());
        check_conflict(&table.root, parts, method, prefix)?;
    }
    Ok(())
}

fn collect<T>(node: &Node<T>, path: String, out: &mut Vec<(Method, String)>) {
    let display = if path.is_empty() { "/".to_owned() } else { path.clone() };
    for method in node.handlers.keys() {
        out.push((*method, display.clone()));
    }
    for (segment, child) in &node.literals {
        collect(child, format!("{path}/{segment}"), out);
    }
    if let Some(param) = &node.param {
        collect(&param.node, format!("{path}/:{}", param.name), out);
    }
    for mount in &node.mounts {
        let table = mount.read().unwrap_or_else(|e| e.into_inner());
        let mut nested = Vec::new();
        collect(&table.root, String::new(), &mut nested);
        for (method, pattern) in nested {
            let pattern = if pattern == "/" { String::new() } else { pattern };
            out.push((method, format!("{path}{pattern}")));
        }
    }
}
