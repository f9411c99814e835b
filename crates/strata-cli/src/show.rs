// SPDX-License-Identifier: MIT OR Apache-2.0
//! `strata show`: print the dependency graph and element states without
//! running any jobs.

use crate::commands::{App, load, session_config};
use crate::DepsArg;
use strata_error::{ElementError, Error};
use strata_graph::{ElementId, Scope};
use strata_vars::{ValuePart, parse_class};

const DEFAULT_FORMAT: &str = "%{state}  %{key}  %{name}";

/// Element state as reported by `show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementState {
    /// The artifact is in the local cache.
    Cached,
    /// All dependencies are cached; a build could start now.
    Buildable,
    /// Waiting on uncached dependencies.
    Waiting,
    /// Sources are not pinned; keys cannot resolve.
    NoReference,
}

impl ElementState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Buildable => "buildable",
            Self::Waiting => "waiting",
            Self::NoReference => "no reference",
        }
    }
}

pub fn show(
    app: &App,
    targets: &[String],
    deps: DepsArg,
    format: Option<&str>,
) -> Result<i32, Error> {
    let config = session_config(app, app.user.strict, false, false);
    let loaded = load(app, targets, config, None, false)?;
    let graph = &loaded.graph;

    // Resolve keys statically, dependencies first.
    let plan = graph.plan(&loaded.targets);
    for id in &plan {
        loaded.session.record_pull_decision(*id, false);
        let _ = loaded.session.try_finalize_strong_key(*id)?;
    }

    let selection: Vec<ElementId> = match deps {
        DepsArg::Plan | DepsArg::All => plan,
        DepsArg::None => loaded.targets.clone(),
        DepsArg::Run => graph.runtime_closure(&loaded.targets),
    };

    let template = format.unwrap_or(DEFAULT_FORMAT);
    for id in selection {
        println!("{}", render(&loaded, id, template)?);
    }
    Ok(strata_error::EXIT_SUCCESS)
}

fn element_state(loaded: &crate::commands::Loaded, id: ElementId) -> Result<ElementState, Error> {
    let session = &loaded.session;

    if !session.sources_pinned(id)? {
        return Ok(ElementState::NoReference);
    }
    if session.artifact_available(id) {
        return Ok(ElementState::Cached);
    }
    let staged = loaded.graph.dependencies(id, Scope::Build, true);
    if staged.iter().all(|dep| session.artifact_available(*dep)) {
        Ok(ElementState::Buildable)
    } else {
        Ok(ElementState::Waiting)
    }
}

// Render one element through the %{...} template grammar shared with the
// variable engine.
fn render(
    loaded: &crate::commands::Loaded,
    id: ElementId,
    template: &str,
) -> Result<String, Error> {
    let element = loaded.graph.get(id);
    let state = element_state(loaded, id)?;
    let key = element.strong_key().or(element.weak_key());

    let mut out = String::new();
    for part in parse_class(template).parts() {
        match part {
            ValuePart::Literal(text) => out.push_str(text),
            ValuePart::Variable(name) => match name.as_str() {
                "name" => out.push_str(element.name()),
                "state" => out.push_str(state.as_str()),
                "key" => match key {
                    Some(key) => out.push_str(key.brief()),
                    None => out.push_str("--------"),
                },
                "full-key" => match key {
                    Some(key) => out.push_str(key.as_hex()),
                    None => out.push_str(&"-".repeat(64)),
                },
                other => {
                    return Err(Error::from(ElementError::new(
                        element.name(),
                        format!("unknown show format field '%{{{other}}}'"),
                    )));
                }
            },
        }
    }
    Ok(out)
}
