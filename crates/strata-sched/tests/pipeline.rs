// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scheduler runs over synthetic element graphs.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use strata_cas::{DirectoryRemote, LocalCas};
use strata_error::Error;
use strata_graph::{ElementGraph, GraphBuilder};
use strata_node::{FileRegistry, Node};
use strata_plugin::{
    BuildContext, ElementKind, NullSandbox, PluginError, PluginRegistry, Sandbox, builtin_registry,
};
use strata_sched::{QueueStatus, Scheduler, Session, SessionConfig, build_pipeline};

// ---------------------------------------------------------------------------
// Test element kinds
// ---------------------------------------------------------------------------

/// Fails permanently on every assemble.
struct ExplosiveKind;

#[async_trait]
impl ElementKind for ExplosiveKind {
    fn kind(&self) -> &str {
        "explosive"
    }

    fn unique_key(&self, config: &Node) -> Result<String, PluginError> {
        Ok(strata_keys::digest(&strata_keys::canonicalize(config))
            .as_hex()
            .to_owned())
    }

    fn configure(&self, _config: &Node) -> Result<(), strata_error::LoadError> {
        Ok(())
    }

    async fn assemble(
        &self,
        _sandbox: &dyn Sandbox,
        _context: &BuildContext,
    ) -> Result<(), PluginError> {
        Err(PluginError::permanent("kaboom"))
    }
}

/// Fails with a transient error the first `failures` times, then succeeds.
struct FlakyKind {
    failures: AtomicU32,
}

#[async_trait]
impl ElementKind for FlakyKind {
    fn kind(&self) -> &str {
        "flaky"
    }

    fn unique_key(&self, config: &Node) -> Result<String, PluginError> {
        Ok(strata_keys::digest(&strata_keys::canonicalize(config))
            .as_hex()
            .to_owned())
    }

    fn configure(&self, _config: &Node) -> Result<(), strata_error::LoadError> {
        Ok(())
    }

    async fn assemble(
        &self,
        _sandbox: &dyn Sandbox,
        _context: &BuildContext,
    ) -> Result<(), PluginError> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(PluginError::transient("mirror hiccup"))
        } else {
            Ok(())
        }
    }
}

/// Sleeps while recording how many assembles run concurrently.
struct SlowKind {
    active: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
    sleep_ms: u64,
}

#[async_trait]
impl ElementKind for SlowKind {
    fn kind(&self) -> &str {
        "slow"
    }

    fn unique_key(&self, config: &Node) -> Result<String, PluginError> {
        Ok(strata_keys::digest(&strata_keys::canonicalize(config))
            .as_hex()
            .to_owned())
    }

    fn configure(&self, _config: &Node) -> Result<(), strata_error::LoadError> {
        Ok(())
    }

    async fn assemble(
        &self,
        _sandbox: &dyn Sandbox,
        _context: &BuildContext,
    ) -> Result<(), PluginError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(self.sleep_ms)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn chain_graph() -> Arc<ElementGraph> {
    let mut builder = GraphBuilder::new(FileRegistry::new());
    builder.element("a.bst", "import").unwrap();
    builder.element("b.bst", "import").unwrap();
    builder.element("c.bst", "import").unwrap();
    builder.build_dep("b.bst", "a.bst");
    builder.build_dep("c.bst", "b.bst");
    Arc::new(builder.finish().unwrap())
}

fn manual_config(registry: &FileRegistry, command: &str) -> Node {
    let mut config = Node::mapping(registry.synthetic());
    config
        .insert(
            "build-commands",
            Node::sequence(
                vec![Node::scalar(command, registry.synthetic())],
                registry.synthetic(),
            ),
        )
        .unwrap();
    config
}

fn session(
    graph: Arc<ElementGraph>,
    registry: PluginRegistry,
    cas: Arc<LocalCas>,
    config: SessionConfig,
) -> Session {
    let project_dir = cas.root().to_owned();
    Session::new(
        graph,
        registry,
        cas,
        config,
        project_dir,
        serde_json::json!({}),
    )
    .unwrap()
    .with_sandbox_factory(|root| Arc::new(NullSandbox::new(root)) as Arc<dyn Sandbox>)
}

fn build_status(report: &strata_sched::SessionReport, element: &str) -> Option<QueueStatus> {
    report
        .statuses
        .get(element)?
        .iter()
        .find(|(queue, _)| queue == "build")
        .map(|(_, status)| *status)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn builds_a_dependency_chain_in_order() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());
    let graph = chain_graph();
    let session = Arc::new(session(
        Arc::clone(&graph),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));

    let target = graph.lookup("c.bst").unwrap();
    let mut scheduler = Scheduler::new(Arc::clone(&session), build_pipeline(false));
    let report = scheduler.run(&[target]).await.unwrap();

    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);
    assert!(!report.interrupted);
    for name in ["a.bst", "b.bst", "c.bst"] {
        assert_eq!(build_status(&report, name), Some(QueueStatus::Done));
        let id = graph.lookup(name).unwrap();
        let strong = graph.get(id).strong_key().expect("strong key assigned");
        assert!(cas.contains(name, strong), "{name} not cached");
    }

    // No build dependencies: strong and weak coincide.
    let a = graph.get(graph.lookup("a.bst").unwrap());
    assert_eq!(a.strong_key(), a.weak_key());

    // With build dependencies they differ.
    let b = graph.get(graph.lookup("b.bst").unwrap());
    assert_ne!(b.strong_key(), b.weak_key());
}

#[tokio::test]
async fn second_session_skips_cached_artifacts() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let first_graph = chain_graph();
    let first = Arc::new(session(
        Arc::clone(&first_graph),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = first_graph.lookup("c.bst").unwrap();
    Scheduler::new(first, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    // Fresh graph, same cache: everything skips.
    let second_graph = chain_graph();
    let second = Arc::new(session(
        Arc::clone(&second_graph),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = second_graph.lookup("c.bst").unwrap();
    let report = Scheduler::new(second, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    assert!(report.failed.is_empty());
    for name in ["a.bst", "b.bst", "c.bst"] {
        assert_eq!(build_status(&report, name), Some(QueueStatus::Skip));
    }
}

#[tokio::test]
async fn failure_marks_reverse_dependencies_failed() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let mut builder = GraphBuilder::new(FileRegistry::new());
    builder.element("a.bst", "import").unwrap();
    builder.element("bomb.bst", "explosive").unwrap();
    builder.element("c.bst", "import").unwrap();
    builder.build_dep("bomb.bst", "a.bst");
    builder.build_dep("c.bst", "bomb.bst");
    let graph = Arc::new(builder.finish().unwrap());

    let mut registry = builtin_registry();
    registry.register_element(Arc::new(ExplosiveKind));

    let session = Arc::new(session(
        Arc::clone(&graph),
        registry,
        cas,
        SessionConfig::default(),
    ));
    let target = graph.lookup("c.bst").unwrap();
    let report = Scheduler::new(session, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    let failed: Vec<&str> = report.failed.iter().map(|f| f.element.as_str()).collect();
    assert!(failed.contains(&"bomb.bst"), "failed: {failed:?}");
    assert!(
        failed.contains(&"c.bst"),
        "reverse dependency not failed: {failed:?}"
    );
    let derived = report
        .failed
        .iter()
        .find(|f| f.element == "c.bst")
        .unwrap();
    assert!(matches!(&derived.error, Error::Element(e) if e.message.contains("bomb.bst")));
    assert_eq!(report.exit_code(false), strata_error::EXIT_FATAL);
}

#[tokio::test]
async fn keep_going_drops_dependants_silently_and_continues() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let mut builder = GraphBuilder::new(FileRegistry::new());
    builder.element("bomb.bst", "explosive").unwrap();
    builder.element("victim.bst", "import").unwrap();
    builder.element("bystander.bst", "import").unwrap();
    builder.build_dep("victim.bst", "bomb.bst");
    let graph = Arc::new(builder.finish().unwrap());

    let mut registry = builtin_registry();
    registry.register_element(Arc::new(ExplosiveKind));

    let config = SessionConfig {
        keep_going: true,
        ..SessionConfig::default()
    };
    let session = Arc::new(session(Arc::clone(&graph), registry, Arc::clone(&cas), config));
    let victim = graph.lookup("victim.bst").unwrap();
    let bystander = graph.lookup("bystander.bst").unwrap();
    let report = Scheduler::new(session, build_pipeline(false))
        .run(&[victim, bystander])
        .await
        .unwrap();

    // Only the bomb is reported; the victim is dropped silently.
    let failed: Vec<&str> = report.failed.iter().map(|f| f.element.as_str()).collect();
    assert_eq!(failed, ["bomb.bst"]);
    assert_eq!(build_status(&report, "bystander.bst"), Some(QueueStatus::Done));
    assert!(cas.contains(
        "bystander.bst",
        graph.get(bystander).strong_key().unwrap()
    ));
    assert_eq!(report.exit_code(true), strata_error::EXIT_RECOVERABLE);
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let mut builder = GraphBuilder::new(FileRegistry::new());
    builder.element("flaky.bst", "flaky").unwrap();
    let graph = Arc::new(builder.finish().unwrap());

    let mut registry = builtin_registry();
    registry.register_element(Arc::new(FlakyKind {
        failures: AtomicU32::new(2),
    }));

    let config = SessionConfig {
        max_retries: 2,
        retry_delay_ms: 1,
        ..SessionConfig::default()
    };
    let session = Arc::new(session(Arc::clone(&graph), registry, cas, config));
    let target = graph.lookup("flaky.bst").unwrap();
    let report = Scheduler::new(session, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);
    assert_eq!(build_status(&report, "flaky.bst"), Some(QueueStatus::Done));
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let mut builder = GraphBuilder::new(FileRegistry::new());
    builder.element("flaky.bst", "flaky").unwrap();
    let graph = Arc::new(builder.finish().unwrap());

    let mut registry = builtin_registry();
    // Needs three retries; only two are budgeted.
    registry.register_element(Arc::new(FlakyKind {
        failures: AtomicU32::new(3),
    }));

    let config = SessionConfig {
        max_retries: 2,
        retry_delay_ms: 1,
        ..SessionConfig::default()
    };
    let session = Arc::new(session(Arc::clone(&graph), registry, cas, config));
    let target = graph.lookup("flaky.bst").unwrap();
    let report = Scheduler::new(session, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].element, "flaky.bst");
}

#[tokio::test]
async fn resource_pool_bounds_build_concurrency() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut builder = GraphBuilder::new(FileRegistry::new());
    for index in 0..6 {
        builder
            .element(&format!("slow-{index}.bst"), "slow")
            .unwrap();
    }
    let graph = Arc::new(builder.finish().unwrap());

    let mut registry = builtin_registry();
    registry.register_element(Arc::new(SlowKind {
        active: Arc::clone(&active),
        peak: Arc::clone(&peak),
        sleep_ms: 30,
    }));

    let mut config = SessionConfig::default();
    config.pools.insert("process".into(), 2);
    let session = Arc::new(session(Arc::clone(&graph), registry, cas, config));

    let targets: Vec<_> = (0..6)
        .map(|i| graph.lookup(&format!("slow-{i}.bst")).unwrap())
        .collect();
    let mut scheduler = Scheduler::new(session, build_pipeline(false));
    let report = scheduler.run(&targets).await.unwrap();

    assert!(report.failed.is_empty());
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "pool exceeded: peak {}",
        peak.load(Ordering::SeqCst)
    );
    assert!(scheduler.broker().is_idle());
}

#[tokio::test]
async fn interrupt_cancels_workers_and_leaves_cache_consistent() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut builder = GraphBuilder::new(FileRegistry::new());
    for index in 0..3 {
        builder
            .element(&format!("slow-{index}.bst"), "slow")
            .unwrap();
    }
    let graph = Arc::new(builder.finish().unwrap());

    let mut registry = builtin_registry();
    registry.register_element(Arc::new(SlowKind {
        active,
        peak,
        sleep_ms: 60_000,
    }));

    let config = SessionConfig {
        grace_ms: 200,
        ..SessionConfig::default()
    };
    let session = Arc::new(session(Arc::clone(&graph), registry, Arc::clone(&cas), config));
    let targets: Vec<_> = (0..3)
        .map(|i| graph.lookup(&format!("slow-{i}.bst")).unwrap())
        .collect();

    let mut scheduler = Scheduler::new(session, build_pipeline(false));
    let interrupt = scheduler.interrupt_token();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        interrupt.cancel();
    });

    let started = std::time::Instant::now();
    let report = scheduler.run(&targets).await.unwrap();
    assert!(report.interrupted);
    assert!(
        started.elapsed() < std::time::Duration::from_secs(5),
        "cancellation exceeded the grace window"
    );

    // Interrupted elements are not failed, and no tokens stay leased.
    assert!(report.failed.is_empty());
    assert!(scheduler.broker().is_idle());

    // No half-written artifacts.
    for index in 0..3 {
        let name = format!("slow-{index}.bst");
        let id = graph.lookup(&name).unwrap();
        if let Some(key) = graph.get(id).strong_key() {
            assert!(!cas.contains(&name, key), "{name} half-written");
        }
    }
    assert_eq!(report.exit_code(false), strata_error::EXIT_INTERRUPTED);
}

#[tokio::test]
async fn unscheduled_dependencies_fail_rather_than_hang() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());
    let graph = chain_graph();
    let session = Arc::new(session(
        Arc::clone(&graph),
        builtin_registry(),
        cas,
        SessionConfig::default(),
    ));

    // Only c is scheduled; its dependencies are neither cached nor planned.
    let target = graph.lookup("c.bst").unwrap();
    let report = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        Scheduler::new(session, build_pipeline(false)).run_plan(&[target]),
    )
    .await
    .expect("scheduler must not hang")
    .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].element, "c.bst");
    assert!(matches!(report.failed[0].error, Error::Scheduler(_)));
}

#[tokio::test]
async fn bare_targets_build_against_cached_dependencies() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());

    // Populate the cache with the whole chain.
    let graph = chain_graph();
    let full = Arc::new(session(
        Arc::clone(&graph),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = graph.lookup("c.bst").unwrap();
    Scheduler::new(full, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    // A fresh session scheduling only c finds everything it needs locally.
    let graph = chain_graph();
    let bare = Arc::new(session(
        Arc::clone(&graph),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = graph.lookup("c.bst").unwrap();
    let report = Scheduler::new(bare, build_pipeline(false))
        .run_plan(&[target])
        .await
        .unwrap();
    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);
    assert_eq!(build_status(&report, "c.bst"), Some(QueueStatus::Skip));
}

#[tokio::test]
async fn non_strict_sessions_reuse_weak_key_matches() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());
    let file_registry = FileRegistry::new();

    let build_graph = |command: &str| {
        let mut builder = GraphBuilder::new(file_registry.clone());
        builder
            .element_with(
                "a.bst",
                "manual",
                manual_config(&file_registry, command),
                Vec::new(),
            )
            .unwrap();
        builder.element("b.bst", "manual").unwrap();
        builder.build_dep("b.bst", "a.bst");
        Arc::new(builder.finish().unwrap())
    };

    // Strict first build.
    let graph_one = build_graph("make one");
    let first = Arc::new(session(
        Arc::clone(&graph_one),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = graph_one.lookup("b.bst").unwrap();
    Scheduler::new(first, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();
    let b_strong_v1 = graph_one
        .get(graph_one.lookup("b.bst").unwrap())
        .strong_key()
        .unwrap()
        .clone();

    // Change a's content; non-strict second session.
    let graph_two = build_graph("make two");
    let config = SessionConfig {
        strict: false,
        ..SessionConfig::default()
    };
    let second = Arc::new(session(
        Arc::clone(&graph_two),
        builtin_registry(),
        Arc::clone(&cas),
        config,
    ));
    let target = graph_two.lookup("b.bst").unwrap();
    let report = Scheduler::new(second, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();
    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);

    // a rebuilt (its own content changed)…
    assert_eq!(build_status(&report, "a.bst"), Some(QueueStatus::Done));
    // …but b was reused via its weak key, keeping the embedded strong key.
    assert_eq!(build_status(&report, "b.bst"), Some(QueueStatus::Skip));
    let b_strong_v2 = graph_two
        .get(graph_two.lookup("b.bst").unwrap())
        .strong_key()
        .unwrap()
        .clone();
    assert_eq!(b_strong_v2, b_strong_v1);

    // A strict session with the same change rebuilds b instead.
    let graph_three = build_graph("make two");
    let third = Arc::new(session(
        Arc::clone(&graph_three),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = graph_three.lookup("b.bst").unwrap();
    let report = Scheduler::new(third, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();
    assert_eq!(build_status(&report, "b.bst"), Some(QueueStatus::Done));
}

#[tokio::test]
async fn tracking_pins_sources_before_building() {
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());
    let file_registry = FileRegistry::new();

    let mut source_config = Node::mapping(file_registry.synthetic());
    source_config
        .insert("kind", Node::scalar("static", file_registry.synthetic()))
        .unwrap();
    source_config
        .insert("content", Node::scalar("hello world", file_registry.synthetic()))
        .unwrap();

    let mut builder = GraphBuilder::new(file_registry.clone());
    builder
        .element_with(
            "app.bst",
            "import",
            Node::mapping(file_registry.synthetic()),
            vec![strata_graph::SourceDecl {
                kind: "static".into(),
                config: source_config,
                provenance: file_registry.synthetic(),
            }],
        )
        .unwrap();
    let graph = Arc::new(builder.finish().unwrap());

    let session = Arc::new(session(
        Arc::clone(&graph),
        builtin_registry(),
        Arc::clone(&cas),
        SessionConfig::default(),
    ));
    let target = graph.lookup("app.bst").unwrap();
    let report = Scheduler::new(session, build_pipeline(true))
        .run(&[target])
        .await
        .unwrap();

    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);
    let statuses = report.statuses.get("app.bst").unwrap();
    assert!(
        statuses
            .iter()
            .any(|(queue, status)| queue == "track" && *status == QueueStatus::Done)
    );
    let strong = graph.get(target).strong_key().unwrap();
    assert!(cas.contains("app.bst", strong));

    // The staged artifact carries the source content.
    let artifact = cas.lookup("app.bst", strong).unwrap().unwrap();
    let out = tempfile::tempdir().unwrap();
    cas.checkout(&artifact, out.path()).unwrap();
    assert_eq!(
        std::fs::read_to_string(out.path().join("content.txt")).unwrap(),
        "hello world"
    );
}

#[tokio::test]
async fn push_then_pull_through_a_remote() {
    let remote_dir = tempfile::tempdir().unwrap();

    // First machine: build and push.
    let cache_one = tempfile::tempdir().unwrap();
    let cas_one = Arc::new(LocalCas::open(cache_one.path()).unwrap());
    let graph_one = chain_graph();
    let first = Arc::new(
        session(
            Arc::clone(&graph_one),
            builtin_registry(),
            Arc::clone(&cas_one),
            SessionConfig::default(),
        )
        .with_push_remote(Arc::new(DirectoryRemote::new(remote_dir.path()))),
    );
    let target = graph_one.lookup("c.bst").unwrap();
    let report = Scheduler::new(first, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();
    assert!(report.failed.is_empty());
    let pushed = report
        .statuses
        .values()
        .flatten()
        .filter(|(queue, status)| queue == "push" && *status == QueueStatus::Done)
        .count();
    assert_eq!(pushed, 3, "all built artifacts push");

    // Second machine: pull instead of build.
    let cache_two = tempfile::tempdir().unwrap();
    let cas_two = Arc::new(LocalCas::open(cache_two.path()).unwrap());
    let graph_two = chain_graph();
    let second = Arc::new(
        session(
            Arc::clone(&graph_two),
            builtin_registry(),
            Arc::clone(&cas_two),
            SessionConfig::default(),
        )
        .with_remote(Arc::new(DirectoryRemote::new(remote_dir.path()))),
    );
    let target = graph_two.lookup("c.bst").unwrap();
    let report = Scheduler::new(second, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    assert!(report.failed.is_empty(), "failures: {:?}", report.failed);
    for name in ["a.bst", "b.bst", "c.bst"] {
        assert_eq!(build_status(&report, name), Some(QueueStatus::Skip));
        let pulled = report.statuses.get(name).unwrap().iter().any(
            |(queue, status)| queue == "pull" && *status == QueueStatus::Done,
        );
        assert!(pulled, "{name} was not pulled");
    }
    // Pulled artifacts are not pushed back.
    let report_statuses: Vec<_> = report
        .statuses
        .values()
        .flatten()
        .filter(|(queue, status)| queue == "push" && *status == QueueStatus::Done)
        .collect();
    assert!(report_statuses.is_empty());
}

#[tokio::test]
async fn pull_payloads_record_hits_and_misses() {
    let remote_dir = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let cas = Arc::new(LocalCas::open(cache.path()).unwrap());
    let graph = chain_graph();

    // Remote exists but is empty: pulls run and miss, then builds happen.
    let session = Arc::new(
        session(
            Arc::clone(&graph),
            builtin_registry(),
            Arc::clone(&cas),
            SessionConfig::default(),
        )
        .with_remote(Arc::new(DirectoryRemote::new(remote_dir.path()))),
    );
    let target = graph.lookup("c.bst").unwrap();
    let report = Scheduler::new(session, build_pipeline(false))
        .run(&[target])
        .await
        .unwrap();

    assert!(report.failed.is_empty());
    for name in ["a.bst", "b.bst", "c.bst"] {
        let statuses = report.statuses.get(name).unwrap();
        // A miss still completes the pull stage.
        assert!(
            statuses
                .iter()
                .any(|(queue, status)| queue == "pull" && *status == QueueStatus::Done)
        );
        assert_eq!(build_status(&report, name), Some(QueueStatus::Done));
    }
}
