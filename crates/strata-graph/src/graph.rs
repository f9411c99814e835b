// SPDX-License-Identifier: MIT OR Apache-2.0
//! The element graph: ownership, lookup, and deterministic traversal.

use crate::element::{Element, ElementId, Scope};
use std::collections::{HashMap, HashSet};
use strata_error::{LoadError, LoadErrorReason};

/// Owns every loaded element and the dependency edges between them.
///
/// The graph is immutable once loading completes; concurrent readers need
/// no synchronisation.
#[derive(Debug, Default)]
pub struct ElementGraph {
    elements: Vec<Element>,
    by_name: HashMap<String, ElementId>,
}

impl ElementGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, element: Element) -> ElementId {
        let id = ElementId(self.elements.len());
        self.by_name.insert(element.name().to_owned(), id);
        self.elements.push(element);
        id
    }

    pub(crate) fn add_build_dep(&mut self, from: ElementId, to: ElementId) {
        let deps = &mut self.elements[from.0].build_deps;
        if !deps.contains(&to) {
            deps.push(to);
        }
    }

    pub(crate) fn add_runtime_dep(&mut self, from: ElementId, to: ElementId) {
        let deps = &mut self.elements[from.0].runtime_deps;
        if !deps.contains(&to) {
            deps.push(to);
        }
    }

    /// Borrow an element by id.
    pub fn get(&self, id: ElementId) -> &Element {
        &self.elements[id.0]
    }

    /// Find an element by its project-qualified name.
    pub fn lookup(&self, name: &str) -> Option<ElementId> {
        self.by_name.get(name).copied()
    }

    /// Number of elements in the graph.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the graph holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate over `(id, element)` pairs in load order.
    pub fn iter(&self) -> impl Iterator<Item = (ElementId, &Element)> {
        self.elements
            .iter()
            .enumerate()
            .map(|(i, e)| (ElementId(i), e))
    }

    // -- traversal ------------------------------------------------------

    /// The runtime closure of `roots`: every transitively reachable runtime
    /// dependency, in post-order, each element at most once.
    pub fn runtime_closure(&self, roots: &[ElementId]) -> Vec<ElementId> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        for root in roots {
            self.post_order(*root, &mut visited, &mut out, |e| e.runtime_deps.clone());
        }
        out
    }

    /// Enumerate dependencies of `target` under a scope filter.
    ///
    /// `Scope::Build` yields the elements staged into `target`'s build
    /// sandbox — each build dependency's runtime closure, post-order —
    /// and never `target` itself. `Scope::Run` yields the runtime closure
    /// including `target`. `Scope::All` is their union.
    ///
    /// Without `recurse` only direct dependencies are yielded.
    pub fn dependencies(&self, target: ElementId, scope: Scope, recurse: bool) -> Vec<ElementId> {
        if !recurse {
            let element = self.get(target);
            return match scope {
                Scope::Build => element.build_deps.clone(),
                Scope::Run => element.runtime_deps.clone(),
                Scope::All => {
                    let mut out = element.build_deps.clone();
                    for dep in &element.runtime_deps {
                        if !out.contains(dep) {
                            out.push(*dep);
                        }
                    }
                    out
                }
            };
        }

        match scope {
            Scope::Build => self.runtime_closure(&self.get(target).build_deps.clone()),
            Scope::Run => self.runtime_closure(&[target]),
            Scope::All => {
                let mut out = self.runtime_closure(&self.get(target).build_deps.clone());
                for id in self.runtime_closure(&[target]) {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
                out
            }
        }
    }

    /// The scheduling plan for `targets`: every element that must be
    /// considered, post-order over both dependency kinds, so that each
    /// element appears after its build dependencies, their runtime
    /// closures, and its own runtime dependencies.
    pub fn plan(&self, targets: &[ElementId]) -> Vec<ElementId> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        for target in targets {
            self.post_order(*target, &mut visited, &mut out, |e| {
                let mut children = e.build_deps.clone();
                for dep in &e.runtime_deps {
                    if !children.contains(dep) {
                        children.push(*dep);
                    }
                }
                children
            });
        }
        out
    }

    // Iterative post-order over `children`, yielding each node once.
    fn post_order<F>(
        &self,
        root: ElementId,
        visited: &mut HashSet<ElementId>,
        out: &mut Vec<ElementId>,
        children: F,
    ) where
        F: Fn(&Element) -> Vec<ElementId>,
    {
        if visited.contains(&root) {
            return;
        }
        // (node, next child index)
        let mut stack: Vec<(ElementId, usize)> = vec![(root, 0)];
        visited.insert(root);
        while let Some((node, index)) = stack.pop() {
            let deps = children(self.get(node));
            if index < deps.len() {
                stack.push((node, index + 1));
                let child = deps[index];
                if visited.insert(child) {
                    stack.push((child, 0));
                }
            } else {
                out.push(node);
            }
        }
    }

    // -- validation -----------------------------------------------------

    /// Reject dependency cycles, reporting the full path.
    pub fn detect_cycles(&self) -> Result<(), LoadError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            OnStack,
            Done,
        }

        let mut colours: HashMap<ElementId, Colour> = HashMap::new();
        for (start, _) in self.iter() {
            if colours.contains_key(&start) {
                continue;
            }
            let mut stack: Vec<(ElementId, usize)> = vec![(start, 0)];
            colours.insert(start, Colour::OnStack);
            while let Some((node, index)) = stack.pop() {
                let deps = self.combined_deps(node);
                if index < deps.len() {
                    stack.push((node, index + 1));
                    let child = deps[index];
                    match colours.get(&child) {
                        Some(Colour::Done) => {}
                        Some(Colour::OnStack) => {
                            let mut path: Vec<&str> = stack
                                .iter()
                                .skip_while(|(id, _)| *id != child)
                                .map(|(id, _)| self.get(*id).name())
                                .collect();
                            path.push(self.get(child).name());
                            return Err(LoadError::new(
                                LoadErrorReason::CircularDependency,
                                format!(
                                    "circular dependency on element '{}'",
                                    self.get(child).name()
                                ),
                            )
                            .with_provenance(self.get(child).provenance().to_string())
                            .with_detail(path.join(" -> ")));
                        }
                        None => {
                            colours.insert(child, Colour::OnStack);
                            stack.push((child, 0));
                        }
                    }
                } else {
                    colours.insert(node, Colour::Done);
                }
            }
        }
        Ok(())
    }

    fn combined_deps(&self, id: ElementId) -> Vec<ElementId> {
        let element = self.get(id);
        let mut out = element.build_deps.clone();
        for dep in &element.runtime_deps {
            if !out.contains(dep) {
                out.push(*dep);
            }
        }
        out
    }
}
