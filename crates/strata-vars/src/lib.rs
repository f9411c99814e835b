// SPDX-License-Identifier: MIT OR Apache-2.0
//! Variable substitution for strata configuration.
//!
//! Variable values are templates over the `%{name}` grammar. Parsing a
//! template yields a [`ValueClass`] — an ordered list of literal and
//! reference parts — interned by source string so identical templates share
//! storage. Resolution is lazy, iterative (no unbounded recursion), and
//! cycle-safe: a reference loop is reported with the full hop list, a
//! reference to an undefined variable with the referring provenance.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use strata_error::{LoadError, LoadErrorReason};
use strata_node::{Node, NodeValue, Provenance};

// ---------------------------------------------------------------------------
// Template parsing
// ---------------------------------------------------------------------------

/// One parsed segment of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePart {
    /// Literal text, emitted verbatim.
    Literal(String),
    /// A `%{name}` reference to another variable.
    Variable(String),
}

/// The parsed form of a template string.
///
/// Interned: parsing the same source string twice returns the same
/// allocation.
#[derive(Debug, PartialEq, Eq)]
pub struct ValueClass {
    parts: Vec<ValuePart>,
}

impl ValueClass {
    /// The ordered parts of the template.
    pub fn parts(&self) -> &[ValuePart] {
        &self.parts
    }

    /// Names of the variables this template references, in order of first
    /// appearance.
    pub fn variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for part in &self.parts {
            if let ValuePart::Variable(name) = part {
                if !names.iter().any(|n| n == name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Anything that does not match, including unterminated `%{`, stays
    // literal text.
    RE.get_or_init(|| Regex::new(r"%\{([A-Za-z][A-Za-z0-9_-]*)\}").expect("valid regex"))
}

/// Parse a template into its interned [`ValueClass`].
pub fn parse_class(template: &str) -> Arc<ValueClass> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<ValueClass>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    if let Some(class) = cache.lock().expect("value class cache poisoned").get(template) {
        return Arc::clone(class);
    }

    let mut parts = Vec::new();
    let mut cursor = 0;
    for captures in reference_regex().captures_iter(template) {
        let whole = captures.get(0).expect("capture group 0 always present");
        if whole.start() > cursor {
            parts.push(ValuePart::Literal(template[cursor..whole.start()].to_owned()));
        }
        let name = captures.get(1).expect("capture group 1 always present");
        parts.push(ValuePart::Variable(name.as_str().to_owned()));
        cursor = whole.end();
    }
    if cursor < template.len() {
        parts.push(ValuePart::Literal(template[cursor..].to_owned()));
    }

    let class = Arc::new(ValueClass { parts });
    cache
        .lock()
        .expect("value class cache poisoned")
        .insert(template.to_owned(), Arc::clone(&class));
    class
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A variable value: a scalar template plus its parsed class and, once
/// computed, the cached resolved string.
#[derive(Debug, Clone)]
pub struct Value {
    provenance: Provenance,
    class: Arc<ValueClass>,
    resolved: OnceLock<String>,
}

impl Value {
    /// Wrap a template string declared at `provenance`.
    pub fn new(template: &str, provenance: Provenance) -> Self {
        Self {
            provenance,
            class: parse_class(template),
            resolved: OnceLock::new(),
        }
    }

    /// The parsed template.
    pub fn class(&self) -> &Arc<ValueClass> {
        &self.class
    }

    /// The cached resolved string, if resolution has happened.
    pub fn resolved(&self) -> Option<&str> {
        self.resolved.get().map(String::as_str)
    }

    /// Where the value was declared.
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}

// ---------------------------------------------------------------------------
// The variable environment
// ---------------------------------------------------------------------------

/// Built-in variables injected by the engine.
///
/// These always win over user declarations of the same names.
#[derive(Debug, Clone)]
pub struct Builtins {
    /// Name of the element owning this environment.
    pub element_name: String,
    /// Name of the project the element belongs to.
    pub project_name: String,
    /// Effective parallel job count for the element's build.
    pub max_jobs: u32,
}

/// An element's variable environment.
///
/// Constructed from the fully composed `variables` mapping; resolution is
/// lazy and cached per value.
#[derive(Debug, Clone)]
pub struct Variables {
    env: BTreeMap<String, Value>,
}

impl Variables {
    /// Build the environment from a composed `variables` mapping.
    ///
    /// Every value must be a scalar. The engine injects the read-only
    /// built-ins and applies the `notparallel` rule: when `notparallel` is
    /// true in the composed mapping, `max-jobs` is forced to `"1"`.
    pub fn new(node: &Node, builtins: &Builtins) -> Result<Self, LoadError> {
        let mut env = BTreeMap::new();
        for (name, child) in node.items() {
            match child.value() {
                NodeValue::Scalar(Some(text)) => {
                    env.insert(name.to_owned(), Value::new(text, child.provenance().clone()));
                }
                NodeValue::Scalar(None) => {
                    // A null clears an inherited variable.
                    env.remove(name);
                }
                _ => {
                    return Err(LoadError::new(
                        LoadErrorReason::InvalidData,
                        format!("variable '{name}' must be a string"),
                    )
                    .with_provenance(child.provenance().to_string()));
                }
            }
        }

        let notparallel = node.get_bool_or("notparallel", false)?;
        let max_jobs = if notparallel { 1 } else { builtins.max_jobs };

        let provenance = node.provenance().clone();
        env.insert(
            "element-name".into(),
            Value::new(&builtins.element_name, provenance.clone()),
        );
        env.insert(
            "project-name".into(),
            Value::new(&builtins.project_name, provenance.clone()),
        );
        env.insert("max-jobs".into(), Value::new(&max_jobs.to_string(), provenance));

        Ok(Self { env })
    }

    /// Whether `name` is defined.
    pub fn contains(&self, name: &str) -> bool {
        self.env.contains_key(name)
    }

    /// The declared variable names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.env.keys().map(String::as_str)
    }

    /// Look up the raw [`Value`] for `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.env.get(name)
    }

    /// Resolve `name` to its final string.
    ///
    /// # Errors
    ///
    /// [`UnresolvedVariable`](LoadErrorReason::UnresolvedVariable) when the
    /// name (or anything it references) is undefined;
    /// [`CircularReferenceVariable`](LoadErrorReason::CircularReferenceVariable)
    /// with the full hop list on a reference cycle.
    pub fn get(&self, name: &str) -> Result<String, LoadError> {
        let Some(value) = self.env.get(name) else {
            return Err(undefined_error(name, None));
        };
        // Early return: already resolved.
        if let Some(resolved) = value.resolved() {
            return Ok(resolved.to_owned());
        }
        self.resolve(name)
    }

    /// Resolve a template scalar against this environment.
    ///
    /// Undefined references are reported with the scalar's provenance.
    pub fn subst(&self, node: &Node) -> Result<String, LoadError> {
        let template = node.as_str()?;
        let class = parse_class(template);
        let mut out = String::new();
        for part in class.parts() {
            match part {
                ValuePart::Literal(text) => out.push_str(text),
                ValuePart::Variable(name) => {
                    if !self.contains(name) {
                        return Err(undefined_error(name, Some(node.provenance())));
                    }
                    out.push_str(&self.get(name)?);
                }
            }
        }
        Ok(out)
    }

    /// Recursively rewrite every scalar in a tree through [`subst`].
    ///
    /// Mapping keys are left untouched; null scalars pass through.
    ///
    /// [`subst`]: Self::subst
    pub fn expand(&self, node: &mut Node) -> Result<(), LoadError> {
        match node.kind() {
            strata_node::NodeKind::Scalar => {
                if node.is_null() {
                    return Ok(());
                }
                let resolved = self.subst(node)?;
                let provenance = node.provenance().clone();
                *node = Node::scalar(resolved, provenance);
                Ok(())
            }
            strata_node::NodeKind::Mapping => {
                let keys: Vec<String> = node.items().map(|(k, _)| k.to_owned()).collect();
                for key in keys {
                    if let Some(child) = node.get_node_mut(&key) {
                        self.expand(child)?;
                    }
                }
                Ok(())
            }
            strata_node::NodeKind::Sequence => {
                let provenance = node.provenance().clone();
                let mut children = node.as_sequence()?.to_vec();
                for child in &mut children {
                    self.expand(child)?;
                }
                *node = Node::sequence(children, provenance);
                Ok(())
            }
        }
    }

    /// Force-resolve every variable, surfacing the first error.
    pub fn check(&self) -> Result<(), LoadError> {
        for name in self.env.keys() {
            self.get(name)?;
        }
        Ok(())
    }

    /// Resolve everything and return the `(name, resolved)` pairs in
    /// name order.
    pub fn resolved_pairs(&self) -> Result<Vec<(String, String)>, LoadError> {
        self.env
            .keys()
            .map(|name| Ok((name.clone(), self.get(name)?)))
            .collect()
    }

    // The iterative resolver: a depth-first walk over the reference graph
    // with an explicit frame stack. Values resolve in post-order, innermost
    // first, and each resolved string is cached on its Value.
    fn resolve(&self, root: &str) -> Result<String, LoadError> {
        enum Colour {
            OnStack,
            Done,
        }

        struct Frame {
            name: String,
            deps: Vec<String>,
            next: usize,
        }

        let mut colours: HashMap<String, Colour> = HashMap::new();
        let mut stack: Vec<Frame> = Vec::new();

        let Some(root_value) = self.env.get(root) else {
            return Err(undefined_error(root, None));
        };
        colours.insert(root.to_owned(), Colour::OnStack);
        stack.push(Frame {
            name: root.to_owned(),
            deps: root_value.class.variable_names(),
            next: 0,
        });

        while let Some(top) = stack.last() {
            if top.next < top.deps.len() {
                let dep = top.deps[top.next].clone();
                let referee = top.name.clone();
                if let Some(frame) = stack.last_mut() {
                    frame.next += 1;
                }

                match colours.get(&dep) {
                    Some(Colour::Done) => {}
                    Some(Colour::OnStack) => {
                        // Reconstruct the hop list from the frame stack.
                        let start = stack
                            .iter()
                            .position(|f| f.name == dep)
                            .unwrap_or(0);
                        let mut hops: Vec<&str> =
                            stack[start..].iter().map(|f| f.name.as_str()).collect();
                        hops.push(&dep);
                        let path = hops.join(" -> ");
                        let provenance = self
                            .env
                            .get(&dep)
                            .map(|v| v.provenance().to_string());
                        let mut err = LoadError::new(
                            LoadErrorReason::CircularReferenceVariable,
                            format!("circular reference while resolving '%{{{dep}}}'"),
                        )
                        .with_detail(path);
                        if let Some(p) = provenance {
                            err = err.with_provenance(p);
                        }
                        return Err(err);
                    }
                    None => {
                        let Some(value) = self.env.get(&dep) else {
                            let provenance =
                                self.env.get(&referee).map(|v| v.provenance().clone());
                            return Err(undefined_error(&dep, provenance.as_ref()));
                        };
                        if value.resolved().is_some() {
                            colours.insert(dep, Colour::Done);
                        } else {
                            colours.insert(dep.clone(), Colour::OnStack);
                            stack.push(Frame {
                                name: dep,
                                deps: value.class.variable_names(),
                                next: 0,
                            });
                        }
                    }
                }
            } else {
                // Post-order: every dependency is resolved, concatenate.
                let name = top.name.clone();
                stack.pop();
                let Some(value) = self.env.get(&name) else {
                    continue;
                };
                let mut out = String::new();
                for part in value.class.parts() {
                    match part {
                        ValuePart::Literal(text) => out.push_str(text),
                        ValuePart::Variable(dep) => {
                            match self.env.get(dep).and_then(|v| v.resolved()) {
                                Some(resolved) => out.push_str(resolved),
                                None => {
                                    return Err(LoadError::new(
                                        LoadErrorReason::RecursiveVariable,
                                        format!(
                                            "variable '%{{{dep}}}' did not settle while resolving '{name}'"
                                        ),
                                    )
                                    .with_provenance(value.provenance().to_string()));
                                }
                            }
                        }
                    }
                }
                let _ = value.resolved.set(out);
                colours.insert(name, Colour::Done);
            }
        }

        match self.env.get(root).and_then(|v| v.resolved()) {
            Some(resolved) => Ok(resolved.to_owned()),
            None => Err(LoadError::new(
                LoadErrorReason::RecursiveVariable,
                format!("variable '%{{{root}}}' did not settle"),
            )),
        }
    }
}

fn undefined_error(name: &str, provenance: Option<&Provenance>) -> LoadError {
    let mut err = LoadError::new(
        LoadErrorReason::UnresolvedVariable,
        format!("reference to undefined variable '%{{{name}}}'"),
    );
    if let Some(p) = provenance {
        err = err.with_provenance(p.to_string());
    }
    err
}
