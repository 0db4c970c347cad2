//! Traversal orchestration
//!
//! One coordinating thread owns the module cache and the tree; short-lived
//! background workers perform the file-system-heavy import resolution, one
//! worker per node-expansion batch. Workers never touch shared tree or
//! cache state: they hand a write-once batch of contexts back over a
//! channel and the coordinator merges it, so the cache is effectively
//! single-writer and needs no locking of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::cache::{ModuleCacheKey, ModuleFlag, ModuleInfo, ModulesCache};
use crate::common::LookupError;
use crate::imports::{ImportContext, ImportContextBuilder};
use crate::pe::PeBinary;
use crate::query::{TreePolicy, MAX_RECURSION_DEPTH};
use crate::search::ModuleSearchStrategy;
use crate::tree::{DependencyTree, NodeId};

/// Cooperative cancellation signal shared between the coordinator and its
/// workers; checked at traversal entry and before every merge
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Callbacks of the interactive layer
///
/// `working` reports the number of in-flight expansions; a progress
/// indicator should be visible exactly while it is non-zero.
/// `module_discovered` fires once per distinct module, in discovery order.
pub trait ScanObserver: Send {
    fn module_discovered(&mut self, _module: &Arc<ModuleInfo>) {}
    fn working(&mut self, _in_flight: usize) {}
}

/// Observer that ignores everything
pub struct NullObserver;

impl ScanObserver for NullObserver {}

struct ExpansionBatch {
    node: NodeId,
    depth: usize,
    contexts: Vec<ImportContext>,
}

/// Result of a completed traversal
pub struct ScanOutcome {
    pub root: NodeId,
    pub tree: DependencyTree,
    pub modules: ModulesCache,
}

/// Drives one traversal: expands the root binary into a tree of resolved
/// modules, deduplicating against the cache and scheduling further
/// expansion according to the configured policy
pub struct ScanSession {
    builder: Arc<ImportContextBuilder>,
    cache: ModulesCache,
    tree: DependencyTree,
    cancel: CancellationToken,
    observer: Box<dyn ScanObserver>,
    tx: Sender<ExpansionBatch>,
    rx: Receiver<ExpansionBatch>,
    in_flight: usize,
}

impl ScanSession {
    pub fn new(builder: Arc<ImportContextBuilder>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            builder,
            cache: ModulesCache::new(),
            tree: DependencyTree::new(),
            cancel: CancellationToken::new(),
            observer: Box::new(NullObserver),
            tx,
            rx,
            in_flight: 0,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn ScanObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tree(&self) -> &DependencyTree {
        &self.tree
    }

    pub fn modules(&self) -> &ModulesCache {
        &self.cache
    }

    /// Load the root binary and expand it to completion (or cancellation)
    pub fn run(&mut self) -> Result<NodeId, LookupError> {
        let target = self.builder.resolver().query().target.clone();
        let root_pe = self.builder.resolver().binaries().get(&target).ok_or_else(|| {
            LookupError::ScanError(format!(
                "{} is not a valid PE-COFF file",
                target.display()
            ))
        })?;

        let root_info = ModuleInfo::root(root_pe.clone());
        let key = ModuleCacheKey::new(
            &root_info.name,
            root_info.filepath.as_deref(),
            ModuleFlag::empty(),
        );
        let root_info = self.cache.insert(key, root_info);
        self.observer.module_discovered(&root_info);

        let root_id = self.tree.add_root(root_info);
        self.schedule_expansion(root_id, root_pe, 0);
        self.drain();
        Ok(root_id)
    }

    /// On-demand expansion of a node discovered earlier but left
    /// unrealized (cache hit, depth limit, or `ChildOnly` policy)
    pub fn expand_node(&mut self, id: NodeId) {
        if self.cancel.is_cancelled() || !self.tree.node(id).has_unrealized_children() {
            return;
        }
        let Some(binary) = self.tree.node(id).module().binary().cloned() else {
            return;
        };
        let depth = self.tree.node(id).depth();
        self.tree.set_unrealized(id, false);
        self.schedule_expansion(id, binary, depth);
        self.drain();
    }

    pub fn into_outcome(self, root: NodeId) -> ScanOutcome {
        ScanOutcome {
            root,
            tree: self.tree,
            modules: self.cache,
        }
    }

    fn schedule_expansion(&mut self, node: NodeId, pe: Arc<PeBinary>, depth: usize) {
        if self.cancel.is_cancelled() {
            return;
        }
        // unconditional ceiling: a malformed import graph must not take the
        // traversal down, the branch just stops here
        if depth >= MAX_RECURSION_DEPTH {
            tracing::debug!(depth, "recursion ceiling reached, truncating branch");
            return;
        }

        let builder = self.builder.clone();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();
        self.in_flight += 1;
        self.observer.working(self.in_flight);

        std::thread::spawn(move || {
            let contexts = if cancel.is_cancelled() {
                Vec::new()
            } else {
                builder.build(&pe)
            };
            // the session may have been dropped after cancellation
            let _ = tx.send(ExpansionBatch {
                node,
                depth,
                contexts,
            });
        });
    }

    fn drain(&mut self) {
        while self.in_flight > 0 {
            let Ok(batch) = self.rx.recv() else {
                break;
            };
            self.in_flight -= 1;
            if !self.cancel.is_cancelled() {
                self.merge(batch);
            }
            self.observer.working(self.in_flight);
        }
    }

    /// Fold one worker's batch into the cache and the tree; only ever runs
    /// on the coordinating thread
    fn merge(&mut self, batch: ExpansionBatch) {
        for ctx in batch.contexts {
            let key = ctx.cache_key();

            let (info, is_new) = match self.cache.get(&key).cloned() {
                Some(existing) => {
                    // same identity seen again: union the flags, keep the record
                    existing.add_flags(ctx.flags);
                    (existing, false)
                }
                None => {
                    let info = self.new_module_info(&ctx);
                    let info = self.cache.insert(key, info);
                    self.observer.module_discovered(&info);
                    (info, true)
                }
            };

            let expandable = info
                .binary()
                .map(|b| b.has_imports())
                .unwrap_or(false);
            let child = self.tree.add_child(batch.node, info.clone(), expandable);

            if info.has_errors() {
                self.tree.propagate_child_error(child);
            }

            if is_new && self.should_expand(&ctx, batch.depth + 1) {
                if let Some(binary) = info.binary().cloned().filter(|b| b.has_imports()) {
                    self.tree.set_unrealized(child, false);
                    self.schedule_expansion(child, binary, batch.depth + 1);
                }
            }
        }
    }

    fn new_module_info(&self, ctx: &ImportContext) -> ModuleInfo {
        // a path that resolved but is no longer present (or never parsed)
        // is a missing module for traversal purposes
        let present = ctx
            .filepath()
            .map(|p| self.builder.resolver().binaries().locator().exists(p))
            .unwrap_or(false);
        let mut flags = ctx.flags;
        if !present {
            flags |= ModuleFlag::NOT_FOUND;
        }
        ModuleInfo::new(
            &ctx.name,
            ctx.strategy,
            present.then(|| ctx.binary.clone()).flatten(),
            ctx.apiset_backing.clone(),
            flags,
        )
    }

    fn should_expand(&self, ctx: &ImportContext, child_depth: usize) -> bool {
        let query = self.builder.resolver().query();
        if child_depth >= query.effective_max_depth() {
            return false;
        }
        match query.policy {
            TreePolicy::ChildOnly => false,
            TreePolicy::RecursiveOnlyOnDirectImports => {
                ctx.strategy != ModuleSearchStrategy::ApiSetSchema
                    && !ctx.flags.contains(ModuleFlag::DELAY_LOAD)
            }
            TreePolicy::Recursive => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apiset::ApiSetSchema;
    use crate::pe::BinaryCache;
    use crate::query::ScanQuery;
    use crate::search::{ModuleResolver, ModuleSearchStrategy};
    use crate::sxs::SxsEntries;
    use crate::testutil::{synthetic_pe, test_system, FakeLocator, TEST_SYS_DIR};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn query(policy: TreePolicy) -> ScanQuery {
        ScanQuery {
            target: PathBuf::from("C:/app/app.exe"),
            app_dir: PathBuf::from("C:/app"),
            working_dir: PathBuf::from("C:/app"),
            custom_search_folders: Vec::new(),
            policy,
            max_depth: None,
            system: Some(test_system()),
        }
    }

    fn session_for(locator: FakeLocator, query: ScanQuery) -> ScanSession {
        let resolver = ModuleResolver::new(
            query,
            SxsEntries::empty(),
            BinaryCache::new(Arc::new(locator)),
        );
        ScanSession::new(Arc::new(ImportContextBuilder::new(Arc::new(resolver))))
    }

    fn names_of(tree: &DependencyTree, root: NodeId) -> Vec<String> {
        let mut names = Vec::new();
        tree.visit_depth_first(root, &mut |_, node| names.push(node.module().name.clone()));
        names
    }

    #[test]
    fn scenario_system_apiset_and_missing_import() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe(
            "app.exe",
            "C:/app/app.exe",
            &[
                "kernel32.dll",
                "api-ms-win-core-file-l1-2-0.dll",
                "missing.dll",
            ],
        ));
        locator.add_binary(synthetic_pe(
            "kernel32.dll",
            &format!("{}/kernel32.dll", TEST_SYS_DIR),
            &[],
        ));
        locator.add_binary(synthetic_pe(
            "kernelbase.dll",
            &format!("{}/kernelbase.dll", TEST_SYS_DIR),
            &[],
        ));
        let mut q = query(TreePolicy::Recursive);
        q.system.as_mut().unwrap().apiset = Some(ApiSetSchema::from_pairs([(
            "api-ms-win-core-file-l1-2-0",
            "kernelbase.dll",
        )]));

        let mut session = session_for(locator, q);
        let root = session.run().expect("root should load");

        let tree = session.tree();
        let root_children = tree.node(root).children();
        assert_eq!(root_children.len(), 3);

        let kernel32 = tree.node(root_children[0]).module();
        assert_eq!(kernel32.strategy, ModuleSearchStrategy::WindowsSystemDirectory);
        assert!(kernel32.found());

        let apiset = tree.node(root_children[1]).module();
        assert_eq!(apiset.strategy, ModuleSearchStrategy::ApiSetSchema);
        assert_eq!(apiset.apiset_backing.as_deref(), Some("kernelbase.dll"));
        assert!(apiset.flags().contains(ModuleFlag::API_SET));
        assert_eq!(
            apiset.filepath.as_deref(),
            Some(std::path::Path::new("C:/Windows/System32/kernelbase.dll"))
        );

        let missing = tree.node(root_children[2]).module();
        assert_eq!(missing.strategy, ModuleSearchStrategy::NotFound);
        assert!(missing.flags().contains(ModuleFlag::NOT_FOUND));
        assert!(tree.node(root_children[2]).children().is_empty());

        // the root visibly indicates that something below failed
        assert!(tree
            .node(root)
            .module()
            .flags()
            .contains(ModuleFlag::CHILDREN_ERROR));
    }

    #[test]
    fn child_only_policy_leaves_placeholders() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe("app.exe", "C:/app/app.exe", &["mid.dll"]));
        locator.add_binary(synthetic_pe("mid.dll", "C:/app/mid.dll", &["leaf.dll"]));
        locator.add_binary(synthetic_pe("leaf.dll", "C:/app/leaf.dll", &[]));

        let mut session = session_for(locator, query(TreePolicy::ChildOnly));
        let root = session.run().unwrap();

        let tree = session.tree();
        assert_eq!(names_of(tree, root), ["app.exe", "mid.dll"]);
        let mid = tree.node(root).children()[0];
        assert!(tree.node(mid).has_unrealized_children());
        assert!(tree.node(mid).children().is_empty());
    }

    #[test]
    fn lazy_expansion_realizes_a_placeholder() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe("app.exe", "C:/app/app.exe", &["mid.dll"]));
        locator.add_binary(synthetic_pe("mid.dll", "C:/app/mid.dll", &["leaf.dll"]));
        locator.add_binary(synthetic_pe("leaf.dll", "C:/app/leaf.dll", &[]));

        let mut session = session_for(locator, query(TreePolicy::ChildOnly));
        let root = session.run().unwrap();
        let mid = session.tree().node(root).children()[0];

        session.expand_node(mid);

        let tree = session.tree();
        assert!(!tree.node(mid).has_unrealized_children());
        assert_eq!(names_of(tree, root), ["app.exe", "mid.dll", "leaf.dll"]);
    }

    #[test]
    fn delay_loaded_imports_gate_on_the_policy() {
        for (policy, expect_expanded) in [
            (TreePolicy::RecursiveOnlyOnDirectImports, false),
            (TreePolicy::Recursive, true),
        ] {
            let locator = FakeLocator::new();
            let mut app = synthetic_pe("app.exe", "C:/app/app.exe", &[]);
            app.imports = vec![crate::testutil::delay_import("late.dll")];
            locator.add_binary(app);
            locator.add_binary(synthetic_pe("late.dll", "C:/app/late.dll", &["leaf.dll"]));
            locator.add_binary(synthetic_pe("leaf.dll", "C:/app/leaf.dll", &[]));

            let mut session = session_for(locator, query(policy));
            let root = session.run().unwrap();
            let tree = session.tree();
            let late = tree.node(root).children()[0];
            assert_eq!(
                !tree.node(late).children().is_empty(),
                expect_expanded,
                "policy {:?}",
                policy
            );
        }
    }

    #[test]
    fn shared_dependency_is_cached_once_and_placed_twice() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe(
            "app.exe",
            "C:/app/app.exe",
            &["a.dll", "b.dll"],
        ));
        locator.add_binary(synthetic_pe("a.dll", "C:/app/a.dll", &["shared.dll"]));
        locator.add_binary(synthetic_pe("b.dll", "C:/app/b.dll", &["shared.dll"]));
        locator.add_binary(synthetic_pe("shared.dll", "C:/app/shared.dll", &["tail.dll"]));
        locator.add_binary(synthetic_pe("tail.dll", "C:/app/tail.dll", &[]));

        let mut session = session_for(locator, query(TreePolicy::Recursive));
        let root = session.run().unwrap();

        let tree = session.tree();
        let positions = {
            let mut count = 0;
            tree.visit_depth_first(root, &mut |_, node| {
                if node.module().name == "shared.dll" {
                    count += 1;
                }
            });
            count
        };
        assert_eq!(positions, 2);

        // one cache entry; only the first placement was expanded, the other
        // stayed an unrealized placeholder
        let cached = session
            .modules()
            .modules()
            .filter(|m| m.name == "shared.dll")
            .count();
        assert_eq!(cached, 1);

        let mut realized = 0;
        let mut placeholders = 0;
        tree.visit_depth_first(root, &mut |_, node| {
            if node.module().name == "shared.dll" {
                if node.has_unrealized_children() {
                    placeholders += 1;
                } else {
                    realized += 1;
                }
            }
        });
        assert_eq!((realized, placeholders), (1, 1));
    }

    #[test]
    fn import_cycle_terminates() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe("app.exe", "C:/app/app.exe", &["a.dll"]));
        locator.add_binary(synthetic_pe("a.dll", "C:/app/a.dll", &["b.dll"]));
        locator.add_binary(synthetic_pe("b.dll", "C:/app/b.dll", &["a.dll"]));

        let mut session = session_for(locator, query(TreePolicy::Recursive));
        let root = session.run().unwrap();

        // a.dll appears under the root and again under b.dll, as a
        // placeholder; nothing recurses past the repeated identity
        let tree = session.tree();
        assert_eq!(
            names_of(tree, root),
            ["app.exe", "a.dll", "b.dll", "a.dll"]
        );
        assert!(tree.len() <= MAX_RECURSION_DEPTH);
    }

    #[test]
    fn max_depth_truncates_eager_expansion() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe("app.exe", "C:/app/app.exe", &["c1.dll"]));
        locator.add_binary(synthetic_pe("c1.dll", "C:/app/c1.dll", &["c2.dll"]));
        locator.add_binary(synthetic_pe("c2.dll", "C:/app/c2.dll", &["c3.dll"]));
        locator.add_binary(synthetic_pe("c3.dll", "C:/app/c3.dll", &[]));

        let mut q = query(TreePolicy::Recursive);
        q.max_depth = Some(2);
        let mut session = session_for(locator, q);
        let root = session.run().unwrap();

        let tree = session.tree();
        assert_eq!(names_of(tree, root), ["app.exe", "c1.dll", "c2.dll"]);
        // the cut-off node still advertises its children for lazy expansion
        let mut deepest = root;
        while let Some(&child) = tree.node(deepest).children().first() {
            deepest = child;
        }
        assert!(tree.node(deepest).has_unrealized_children());
    }

    #[test]
    fn pre_cancelled_session_expands_nothing() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe("app.exe", "C:/app/app.exe", &["dep.dll"]));
        locator.add_binary(synthetic_pe("dep.dll", "C:/app/dep.dll", &[]));

        let mut session = session_for(locator, query(TreePolicy::Recursive));
        session.cancellation_token().cancel();
        let root = session.run().unwrap();

        assert!(session.tree().node(root).children().is_empty());
        assert_eq!(session.modules().len(), 1);
    }

    #[derive(Default)]
    struct RecordingObserver {
        discovered: Arc<Mutex<Vec<String>>>,
        busy_transitions: Arc<Mutex<Vec<usize>>>,
    }

    impl ScanObserver for RecordingObserver {
        fn module_discovered(&mut self, module: &Arc<ModuleInfo>) {
            self.discovered.lock().unwrap().push(module.name.clone());
        }

        fn working(&mut self, in_flight: usize) {
            self.busy_transitions.lock().unwrap().push(in_flight);
        }
    }

    #[test]
    fn observer_sees_each_module_once_and_progress_returning_to_zero() {
        let locator = FakeLocator::new();
        locator.add_binary(synthetic_pe(
            "app.exe",
            "C:/app/app.exe",
            &["a.dll", "b.dll"],
        ));
        locator.add_binary(synthetic_pe("a.dll", "C:/app/a.dll", &["b.dll"]));
        locator.add_binary(synthetic_pe("b.dll", "C:/app/b.dll", &[]));

        let observer = RecordingObserver::default();
        let discovered = observer.discovered.clone();
        let transitions = observer.busy_transitions.clone();

        let resolver = ModuleResolver::new(
            query(TreePolicy::Recursive),
            SxsEntries::empty(),
            BinaryCache::new(Arc::new(locator)),
        );
        let mut session = ScanSession::new(Arc::new(ImportContextBuilder::new(Arc::new(resolver))))
            .with_observer(Box::new(observer));
        session.run().unwrap();

        let mut seen = discovered.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, ["a.dll", "app.exe", "b.dll"]);

        let transitions = transitions.lock().unwrap();
        assert_eq!(*transitions.last().unwrap(), 0);
        assert!(transitions.iter().any(|&n| n > 0));
    }
}
