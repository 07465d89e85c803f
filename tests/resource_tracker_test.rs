//! Resource tracker removal and session shutdown through the public API.

use crossbeam::channel;
use lazyjit::ir::Module;
use lazyjit::layers::ModuleTransform;
use lazyjit::{JitError, JitResult, LazyJit};
use std::sync::Arc;

fn module(name: &str, text: &str) -> Module {
    Module::parse(name, text).expect("parse")
}

#[test]
fn test_removal_while_compiling_is_busy() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (started_tx, started_rx) = channel::bounded::<()>(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);
    let blocking = move |module: Module| -> JitResult<Module> {
        let _ = started_tx.send(());
        let _ = release_rx.recv();
        Ok(module)
    };
    let jit = LazyJit::builder()
        .num_threads(2)
        .lazy(false)
        .optimizer(Arc::new(blocking) as Arc<dyn ModuleTransform>)
        .build()
        .unwrap();

    let tracker = jit.create_tracker().unwrap();
    jit.add_module_with(
        &tracker,
        module("slow", "define slow() {\nentry:\n  ret 9\n}\n"),
    )
    .unwrap();

    std::thread::scope(|scope| {
        let lookup = scope.spawn(|| jit.lookup("slow"));
        started_rx.recv().unwrap();

        assert_eq!(
            jit.remove_tracker(&tracker),
            Err(JitError::ResourceBusy { pending: 1 })
        );
        assert!(!tracker.is_removed());

        release_tx.send(()).unwrap();
        assert!(lookup.join().unwrap().is_ok());
    });

    assert!(jit.linking_layer().memory().total_bytes() > 0);
    jit.remove_tracker(&tracker).unwrap();
    assert!(tracker.is_removed());
    assert!(matches!(
        jit.lookup("slow"),
        Err(JitError::SymbolNotFound { .. })
    ));
    assert_eq!(jit.linking_layer().memory().total_bytes(), 0);
    assert_eq!(jit.stats().trackers_removed, 1);
}

#[test]
fn test_removed_tracker_is_closed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder().num_threads(1).build().unwrap();
    let tracker = jit.create_tracker().unwrap();
    jit.add_module_with(&tracker, module("a", "define a() {\nentry:\n  ret 1\n}\n"))
        .unwrap();

    jit.remove_tracker(&tracker).unwrap();
    assert_eq!(jit.remove_tracker(&tracker), Err(JitError::TrackerClosed));
    assert_eq!(
        jit.add_module_with(&tracker, module("b", "define b() {\nentry:\n  ret 2\n}\n")),
        Err(JitError::TrackerClosed)
    );
    assert!(matches!(jit.lookup("a"), Err(JitError::SymbolNotFound { .. })));
}

#[test]
fn test_removal_frees_names_for_redefinition() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder().num_threads(1).lazy(false).build().unwrap();
    let tracker = jit.create_tracker().unwrap();
    jit.add_module_with(&tracker, module("v1", "define version() {\nentry:\n  ret 1\n}\n"))
        .unwrap();
    jit.remove_tracker(&tracker).unwrap();

    jit.add_module(module("v2", "define version() {\nentry:\n  ret 2\n}\n"))
        .unwrap();
    assert!(jit.lookup("version").is_ok());
}

#[test]
fn test_removing_default_tracker_installs_fresh_one() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder().num_threads(0).build().unwrap();
    let first = jit.main_namespace().default_tracker().unwrap();
    jit.add_module(module("m", "define f() {\nentry:\n  ret 0\n}\n"))
        .unwrap();
    first.remove().unwrap();

    let second = jit.main_namespace().default_tracker().unwrap();
    assert_ne!(first.key(), second.key());
    jit.add_module(module("m", "define f() {\nentry:\n  ret 0\n}\n"))
        .unwrap();
}

#[test]
fn test_lazy_tracker_removal_releases_stubs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder().num_threads(2).build().unwrap();
    let tracker = jit.create_tracker().unwrap();
    jit.add_module_with(
        &tracker,
        module("pair", "define a() {\nentry:\n  ret 1\n}\ndefine b() {\nentry:\n  ret 2\n}\n"),
    )
    .unwrap();
    jit.lookup("a").unwrap();

    let stubs = jit.lazy_layer().unwrap().stubs().clone();
    assert_eq!(stubs.stub_count(), 2);
    jit.remove_tracker(&tracker).unwrap();
    assert_eq!(stubs.stub_count(), 0);
    assert!(matches!(jit.lookup("b"), Err(JitError::SymbolNotFound { .. })));
}

#[test]
fn test_separate_namespaces_keep_separate_symbols() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder().num_threads(1).lazy(false).build().unwrap();
    let plugin = jit.create_namespace("plugin").unwrap();
    let tracker = plugin.create_tracker().unwrap();
    jit.add_module_to(&plugin, &tracker, module("p", "define entry_point() {\nentry:\n  ret 3\n}\n"))
        .unwrap();

    assert!(jit.lookup_in(&plugin, "entry_point").is_ok());
    assert!(matches!(
        jit.lookup("entry_point"),
        Err(JitError::SymbolNotFound { .. })
    ));

    plugin.remove().unwrap();
    assert!(jit.session().namespace("plugin").is_none());
}

#[test]
fn test_operations_after_shutdown() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder().num_threads(2).lazy(false).build().unwrap();
    let tracker = jit.create_tracker().unwrap();
    jit.add_module(module("m", "define f() {\nentry:\n  ret 0\n}\n"))
        .unwrap();

    jit.shutdown().unwrap();
    assert!(jit.session().is_closed());
    assert_eq!(jit.lookup("f"), Err(JitError::SessionClosed));
    assert_eq!(
        jit.add_module(module("n", "define g() {\nentry:\n  ret 0\n}\n")),
        Err(JitError::SessionClosed)
    );
    assert_eq!(jit.remove_tracker(&tracker), Err(JitError::SessionClosed));
    assert!(matches!(
        jit.create_namespace("late"),
        Err(JitError::SessionClosed)
    ));
    assert_eq!(jit.shutdown(), Err(JitError::SessionClosed));
}
