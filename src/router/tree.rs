//! Radix tree with constant, parameter and wildcard nodes.
//!
//! Matching order at every node is fixed: constants, validated parameters,
//! plain parameters, validated wildcards, plain wildcard. Constant siblings
//! never share a first byte, so the constant step is a binary search.

use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::handler::HandlerChain;
use crate::method::METHOD_ANY;
use crate::params::{PARAM_ALLOW, PARAM_ROUTE, Params};

use super::check::{Check, CheckRegistry};
use super::pattern::{Segment, split_pattern};

/// Methods with a dedicated slot in every node's method table.
const FAST_METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "HEAD", "PATCH"];

fn fast_index(method: &str) -> Option<usize> {
    FAST_METHODS.iter().position(|m| *m == method)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Const,
    Param,
    Wildcard,
}

/// Handlers and route params installed for one method at one node.
#[derive(Clone)]
pub(crate) struct RouteEntry {
    pub params: Params,
    pub chain: HandlerChain,
}

/// Per-node method table: six fast slots, a map for the rest, and a record of
/// which slots were filled by an `Any` registration.
#[derive(Clone, Default)]
pub(crate) struct MethodTable {
    fast: [Option<RouteEntry>; 6],
    fast_any: u8,
    other: BTreeMap<String, (RouteEntry, bool)>,
    allow: String,
}

impl MethodTable {
    pub fn get(&self, method: &str) -> Option<&RouteEntry> {
        match fast_index(method) {
            Some(i) => self.fast[i].as_ref(),
            None => self.other.get(method).map(|(e, _)| e),
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.allow.is_empty()
    }

    pub fn allow(&self) -> &str {
        &self.allow
    }

    /// Installs `entry` for a real method. `from_any` marks the slot so a
    /// later specific registration replaces it silently; an `Any` install
    /// skips slots that a specific registration already owns.
    fn install(&mut self, method: &str, entry: RouteEntry, from_any: bool) {
        match fast_index(method) {
            Some(i) => {
                let bit = 1u8 << i;
                if from_any && self.fast[i].is_some() && self.fast_any & bit == 0 {
                    return;
                }
                self.fast[i] = Some(entry);
                if from_any {
                    self.fast_any |= bit;
                } else {
                    self.fast_any &= !bit;
                }
            }
            None => {
                if from_any && self.other.get(method).is_some_and(|(_, any)| !*any) {
                    return;
                }
                self.other.insert(method.to_owned(), (entry, from_any));
            }
        }
        self.rebuild_allow();
    }

    fn rebuild_allow(&mut self) {
        let mut methods: Vec<&str> = FAST_METHODS
            .iter()
            .zip(self.fast.iter())
            .filter(|(_, slot)| slot.is_some())
            .map(|(m, _)| *m)
            .chain(self.other.keys().map(String::as_str))
            .collect();
        methods.sort_unstable();
        self.allow = methods.join(", ");
    }
}

#[derive(Clone)]
pub(crate) struct Node {
    pub kind: NodeKind,
    /// Edge label for constants, raw segment text for the others.
    pub path: Vec<u8>,
    pub name: String,
    pub check: Option<Check>,
    pub constants: Vec<Node>,
    pub params: Vec<Node>,
    pub wildcards: Vec<Node>,
    /// Pattern of the first route installed here.
    pub route: String,
    pub slots: MethodTable,
}

impl Node {
    pub fn root() -> Self {
        Self::new(NodeKind::Const, Vec::new(), String::new(), None)
    }

    fn new(kind: NodeKind, path: Vec<u8>, name: String, check: Option<Check>) -> Self {
        Self {
            kind,
            path,
            name,
            check,
            constants: Vec::new(),
            params: Vec::new(),
            wildcards: Vec::new(),
            route: String::new(),
            slots: MethodTable::default(),
        }
    }

    /// Walks or grows the tree along `route` and returns the leaf.
    ///
    /// # Panics
    ///
    /// Panics when a check cannot be resolved.
    pub fn insert_route(&mut self, route: &str, checks: &CheckRegistry) -> &mut Node {
        let mut node = self;
        for segment in split_pattern(route) {
            node = match segment {
                Segment::Const(path) => node.insert_const(path.as_bytes()),
                Segment::Param { raw, name, check } => {
                    node.insert_dynamic(NodeKind::Param, raw, name, check, route, checks)
                }
                Segment::Wildcard { raw, name, check } => {
                    node.insert_dynamic(NodeKind::Wildcard, raw, name, check, route, checks)
                }
            };
        }
        node
    }

    fn insert_const(&mut self, path: &[u8]) -> &mut Node {
        if path.is_empty() {
            return self;
        }
        let first = path[0];
        let idx = self.constants.partition_point(|c| c.path[0] < first);
        if idx < self.constants.len() && self.constants[idx].path[0] == first {
            let common = common_prefix(&self.constants[idx].path, path);
            if common < self.constants[idx].path.len() {
                let prefix = path[..common].to_vec();
                let mut tail = std::mem::replace(
                    &mut self.constants[idx],
                    Node::new(NodeKind::Const, prefix, String::new(), None),
                );
                tail.path.drain(..common);
                self.constants[idx].constants.push(tail);
            }
            return self.constants[idx].insert_const(&path[common..]);
        }
        self.constants.insert(idx, Node::new(NodeKind::Const, path.to_vec(), String::new(), None));
        &mut self.constants[idx]
    }

    fn insert_dynamic(
        &mut self,
        kind: NodeKind,
        raw: String,
        name: String,
        check: Option<String>,
        route: &str,
        checks: &CheckRegistry,
    ) -> &mut Node {
        let children = match kind {
            NodeKind::Param => &mut self.params,
            _ => &mut self.wildcards,
        };
        if let Some(i) = children.iter().position(|c| c.path == raw.as_bytes()) {
            return &mut children[i];
        }
        let check = check.map(|text| {
            checks
                .resolve(&text)
                .unwrap_or_else(|e| panic!("invalid route `{route}`: {e}"))
        });
        let validated = check.is_some();
        let node = Node::new(kind, raw.into_bytes(), name, check);
        // validated children sit before plain ones; insertion order otherwise
        let idx = if validated {
            children.iter().position(|c| c.check.is_none()).unwrap_or(children.len())
        } else {
            children.len()
        };
        children.insert(idx, node);
        &mut children[idx]
    }

    /// Installs `entry` under `method` (`ANY` expands over `any_methods`).
    pub fn install(&mut self, method: &str, route: &str, entry: RouteEntry, any_methods: &[String]) {
        if self.route.is_empty() {
            self.route = route.to_owned();
        }
        if method == METHOD_ANY {
            for m in any_methods {
                self.slots.install(m, entry.clone(), true);
            }
        } else {
            self.slots.install(method, entry, false);
        }
    }

    /// Recursive descent; captured values are appended to `params` only
    /// along the successful branch.
    pub fn lookup<'n>(&'n self, path: &[u8], params: &mut Params) -> Option<&'n Node> {
        if path.is_empty() && self.slots.is_bound() {
            return Some(self);
        }

        if let Some(&first) = path.first() {
            let idx = self.constants.partition_point(|c| c.path[0] < first);
            if let Some(child) = self.constants.get(idx) {
                if path.starts_with(&child.path) {
                    if let Some(found) = child.lookup(&path[child.path.len()..], params) {
                        return Some(found);
                    }
                }
            }
        }

        if !self.params.is_empty() {
            let end = path.iter().position(|&b| b == b'/').unwrap_or(path.len());
            let segment = &path[..end];
            if !segment.is_empty() {
                let value = lossy(segment);
                for child in &self.params {
                    if !child.passes(&value) {
                        continue;
                    }
                    let mark = params.len();
                    params.add(child.name.as_str(), value.as_ref());
                    if let Some(found) = child.lookup(&path[end..], params) {
                        return Some(found);
                    }
                    params.truncate(mark);
                }
            }
        }

        if !self.wildcards.is_empty() {
            let value = lossy(path);
            for child in &self.wildcards {
                if child.slots.is_bound() && child.passes(&value) {
                    params.add(child.name.as_str(), value.as_ref());
                    return Some(child);
                }
            }
        }
        None
    }

    fn passes(&self, value: &str) -> bool {
        self.check.as_ref().is_none_or(|c| c.test(value))
    }

    /// Writes route + allow for a node-level 405.
    pub fn method_not_allowed_params(&self, params: &mut Params) {
        params.set(PARAM_ROUTE, self.route.as_str());
        params.set(PARAM_ALLOW, self.slots.allow());
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn lossy(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(route: &str) -> RouteEntry {
        RouteEntry { params: Params::new(route), chain: Vec::new().into() }
    }

    fn build(routes: &[&str]) -> Node {
        let checks = CheckRegistry::new();
        let mut root = Node::root();
        for r in routes {
            root.insert_route(r, &checks).install("GET", r, entry(r), &[]);
        }
        root
    }

    fn matched(root: &Node, path: &str) -> Option<(String, Params)> {
        let mut params = Params::default();
        root.lookup(path.as_bytes(), &mut params).map(|n| (n.route.clone(), params))
    }

    #[test]
    fn constant_siblings_split_on_common_prefix() {
        let root = build(&["/user", "/users", "/uid"]);
        let top = &root.constants;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].path, b"/u");
        let firsts: Vec<u8> = top[0].constants.iter().map(|c| c.path[0]).collect();
        assert_eq!(firsts, vec![b'i', b's']);
        assert_eq!(matched(&root, "/users").unwrap().0, "/users");
        assert_eq!(matched(&root, "/user").unwrap().0, "/user");
        assert!(matched(&root, "/use").is_none());
    }

    #[test]
    fn constant_beats_param_beats_wildcard() {
        let root = build(&["/x/y", "/x/:p", "/x/*w"]);
        assert_eq!(matched(&root, "/x/y").unwrap().0, "/x/y");
        let (route, params) = matched(&root, "/x/z").unwrap();
        assert_eq!(route, "/x/:p");
        assert_eq!(params.get("p"), Some("z"));
        let (route, params) = matched(&root, "/x/z/deep").unwrap();
        assert_eq!(route, "/x/*w");
        assert_eq!(params.get("w"), Some("z/deep"));
    }

    #[test]
    fn validated_param_precedes_plain() {
        let root = build(&["/u/:id", "/u/:id|num"]);
        let (route, params) = matched(&root, "/u/42").unwrap();
        assert_eq!(route, "/u/:id|num");
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(matched(&root, "/u/abc").unwrap().0, "/u/:id");
    }

    #[test]
    fn failed_branch_discards_captures() {
        let root = build(&["/:a/x", "/*rest"]);
        let (route, params) = matched(&root, "/q/y").unwrap();
        assert_eq!(route, "/*rest");
        assert_eq!(params.get("a"), None);
        assert_eq!(params.get("rest"), Some("q/y"));
    }

    #[test]
    fn any_install_respects_specific_slots() {
        let mut table = MethodTable::default();
        table.install("GET", entry("a"), false);
        table.install("GET", entry("b"), true);
        table.install("POST", entry("b"), true);
        assert_eq!(table.get("GET").unwrap().params.route(), "a");
        assert_eq!(table.get("POST").unwrap().params.route(), "b");
        table.install("POST", entry("c"), false);
        assert_eq!(table.get("POST").unwrap().params.route(), "c");
        table.install("LOCK", entry("d"), false);
        assert_eq!(table.allow(), "GET, LOCK, POST");
    }

    #[test]
    fn multibyte_constants_split_safely() {
        let root = build(&["/é", "/è"]);
        assert_eq!(matched(&root, "/é").unwrap().0, "/é");
        assert_eq!(matched(&root, "/è").unwrap().0, "/è");
    }
}
