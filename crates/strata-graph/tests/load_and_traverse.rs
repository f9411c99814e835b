// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end loading of on-disk projects and graph traversal.

use std::path::Path;
use strata_error::LoadErrorReason;
use strata_graph::{GraphBuilder, Scope, load_project};
use strata_node::FileRegistry;

fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, contents).unwrap();
    }
}

const PROJECT: &str = "name: demo\n";

#[test]
fn loads_a_three_element_chain() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            ("elements/a.bst", "kind: import\nsources:\n- kind: local\n  path: files/a\n"),
            ("elements/b.bst", "kind: manual\nbuild-depends:\n- a.bst\n"),
            ("elements/c.bst", "kind: manual\nbuild-depends:\n- b.bst\n"),
        ],
    );

    let registry = FileRegistry::new();
    let project = load_project(&registry, dir.path(), &["c.bst".into()], 2).unwrap();
    assert_eq!(project.name, "demo");
    assert_eq!(project.graph.len(), 3);

    let c = project.graph.lookup("c.bst").unwrap();
    let b = project.graph.lookup("b.bst").unwrap();
    let a = project.graph.lookup("a.bst").unwrap();

    assert_eq!(project.graph.get(c).kind(), "manual");
    assert_eq!(project.graph.get(c).build_deps(), &[b]);
    assert_eq!(project.graph.get(b).build_deps(), &[a]);
    assert_eq!(project.graph.get(a).sources().len(), 1);
    assert_eq!(project.graph.get(a).sources()[0].kind, "local");
}

#[test]
fn plan_orders_dependencies_first() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            ("elements/a.bst", "kind: import\n"),
            ("elements/b.bst", "kind: manual\nbuild-depends:\n- a.bst\n"),
            ("elements/c.bst", "kind: manual\nbuild-depends:\n- b.bst\n"),
        ],
    );

    let registry = FileRegistry::new();
    let project = load_project(&registry, dir.path(), &["c.bst".into()], 1).unwrap();
    let c = project.graph.lookup("c.bst").unwrap();
    let order: Vec<&str> = project
        .graph
        .plan(&[c])
        .into_iter()
        .map(|id| project.graph.get(id).name())
        .collect();
    assert_eq!(order, ["a.bst", "b.bst", "c.bst"]);
}

#[test]
fn build_scope_stages_runtime_closures() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            ("elements/libc.bst", "kind: import\n"),
            (
                "elements/gcc.bst",
                "kind: manual\nruntime-depends:\n- libc.bst\n",
            ),
            (
                "elements/app.bst",
                "kind: manual\nbuild-depends:\n- gcc.bst\n",
            ),
        ],
    );

    let registry = FileRegistry::new();
    let project = load_project(&registry, dir.path(), &["app.bst".into()], 1).unwrap();
    let app = project.graph.lookup("app.bst").unwrap();

    // Building app needs gcc staged, and gcc drags in its runtime closure.
    let staged: Vec<&str> = project
        .graph
        .dependencies(app, Scope::Build, true)
        .into_iter()
        .map(|id| project.graph.get(id).name())
        .collect();
    assert_eq!(staged, ["libc.bst", "gcc.bst"]);

    // But libc is not a direct dependency.
    let direct = project.graph.dependencies(app, Scope::Build, false);
    assert_eq!(direct.len(), 1);
}

#[test]
fn depends_type_splits_scopes() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            ("elements/tool.bst", "kind: import\n"),
            ("elements/lib.bst", "kind: import\n"),
            ("elements/both.bst", "kind: import\n"),
            (
                "elements/app.bst",
                concat!(
                    "kind: manual\n",
                    "depends:\n",
                    "- filename: tool.bst\n",
                    "  type: build\n",
                    "- filename: lib.bst\n",
                    "  type: runtime\n",
                    "- both.bst\n",
                ),
            ),
        ],
    );

    let registry = FileRegistry::new();
    let project = load_project(&registry, dir.path(), &["app.bst".into()], 1).unwrap();
    let app = project.graph.lookup("app.bst").unwrap();
    let tool = project.graph.lookup("tool.bst").unwrap();
    let lib = project.graph.lookup("lib.bst").unwrap();
    let both = project.graph.lookup("both.bst").unwrap();

    assert_eq!(project.graph.get(app).build_deps(), &[tool, both]);
    assert_eq!(project.graph.get(app).runtime_deps(), &[lib, both]);
}

#[test]
fn dependency_cycles_are_rejected_with_the_path() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            ("elements/a.bst", "kind: manual\nbuild-depends:\n- b.bst\n"),
            ("elements/b.bst", "kind: manual\nbuild-depends:\n- a.bst\n"),
        ],
    );

    let registry = FileRegistry::new();
    let err = load_project(&registry, dir.path(), &["a.bst".into()], 1).unwrap_err();
    assert_eq!(err.reason, LoadErrorReason::CircularDependency);
    let detail = err.detail.unwrap();
    assert!(detail.contains("a.bst"), "path missing a.bst: {detail}");
    assert!(detail.contains("->"), "no hop separator: {detail}");
}

#[test]
fn variables_expand_into_element_config() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            (
                "project.yaml",
                "name: demo\nvariables:\n  flavor: release\n",
            ),
            (
                "elements/app.bst",
                concat!(
                    "kind: manual\n",
                    "variables:\n",
                    "  builddir: '%{prefix}/build-%{flavor}'\n",
                    "config:\n",
                    "  build-commands:\n",
                    "  - make -C %{builddir}\n",
                ),
            ),
        ],
    );

    let registry = FileRegistry::new();
    let project = load_project(&registry, dir.path(), &["app.bst".into()], 1).unwrap();
    let app = project.graph.get(project.graph.lookup("app.bst").unwrap());

    assert_eq!(app.variables().get("builddir").unwrap(), "/usr/build-release");
    assert_eq!(
        app.config().get_str_list("build-commands").unwrap(),
        ["make -C /usr/build-release"]
    );
    // Built-ins are present.
    assert_eq!(app.variables().get("element-name").unwrap(), "app.bst");
    assert_eq!(app.variables().get("project-name").unwrap(), "demo");
}

#[test]
fn undefined_variable_fails_the_load() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            (
                "elements/app.bst",
                "kind: manual\nvariables:\n  broken: '%{absent}'\n",
            ),
        ],
    );

    let registry = FileRegistry::new();
    let err = load_project(&registry, dir.path(), &["app.bst".into()], 1).unwrap_err();
    assert_eq!(err.reason, LoadErrorReason::UnresolvedVariable);
}

#[test]
fn unknown_element_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            ("elements/app.bst", "kind: manual\ndependencies:\n- a.bst\n"),
        ],
    );

    let registry = FileRegistry::new();
    let err = load_project(&registry, dir.path(), &["app.bst".into()], 1).unwrap_err();
    assert_eq!(err.reason, LoadErrorReason::InvalidData);
    assert!(err.message.contains("unexpected key"));
}

#[test]
fn missing_element_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_files(dir.path(), &[("project.yaml", PROJECT)]);

    let registry = FileRegistry::new();
    let err = load_project(&registry, dir.path(), &["ghost.bst".into()], 1).unwrap_err();
    assert_eq!(err.reason, LoadErrorReason::MissingFile);
}

#[test]
fn junction_imports_a_subproject() {
    let dir = tempfile::tempdir().unwrap();
    write_files(
        dir.path(),
        &[
            ("project.yaml", PROJECT),
            (
                "elements/subproj.bst",
                "kind: junction\nconfig:\n  path: subproject\n",
            ),
            (
                "elements/app.bst",
                concat!(
                    "kind: manual\n",
                    "build-depends:\n",
                    "- filename: widget.bst\n",
                    "  junction: subproj.bst\n",
                ),
            ),
            ("subproject/project.yaml", "name: sub\n"),
            ("subproject/elements/widget.bst", "kind: import\n"),
        ],
    );

    let registry = FileRegistry::new();
    let project = load_project(&registry, dir.path(), &["app.bst".into()], 1).unwrap();
    let widget = project.graph.lookup("subproj.bst:widget.bst").unwrap();
    let app = project.graph.lookup("app.bst").unwrap();
    assert_eq!(project.graph.get(app).build_deps(), &[widget]);
    assert_eq!(
        project.graph.get(widget).variables().get("project-name").unwrap(),
        "sub"
    );
}

#[test]
fn builder_constructs_synthetic_graphs() {
    let registry = FileRegistry::new();
    let mut builder = GraphBuilder::new(registry);
    builder.element("a.bst", "import").unwrap();
    builder.element("b.bst", "manual").unwrap();
    builder.element("c.bst", "manual").unwrap();
    builder.build_dep("b.bst", "a.bst");
    builder.build_dep("c.bst", "b.bst");
    let graph = builder.finish().unwrap();

    let c = graph.lookup("c.bst").unwrap();
    let order: Vec<&str> = graph
        .plan(&[c])
        .into_iter()
        .map(|id| graph.get(id).name())
        .collect();
    assert_eq!(order, ["a.bst", "b.bst", "c.bst"]);
}

#[test]
fn builder_rejects_cycles() {
    let registry = FileRegistry::new();
    let mut builder = GraphBuilder::new(registry);
    builder.element("a.bst", "manual").unwrap();
    builder.element("b.bst", "manual").unwrap();
    builder.build_dep("a.bst", "b.bst");
    builder.runtime_dep("b.bst", "a.bst");
    let err = builder.finish().unwrap_err();
    assert_eq!(err.reason, LoadErrorReason::CircularDependency);
}
