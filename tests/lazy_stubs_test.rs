//! Tests of compile-on-demand: functions are reachable through stubs whose
//! first call compiles the body exactly once.

use lazyjit::ir::Module;
use lazyjit::orc::SymbolStatus;
use lazyjit::{JitError, LazyJit};

fn lazy_jit(threads: usize) -> LazyJit {
    LazyJit::builder().num_threads(threads).build().expect("jit")
}

fn module(name: &str, text: &str) -> Module {
    Module::parse(name, text).expect("parse")
}

#[test]
fn test_lookup_does_not_compile_bodies() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = lazy_jit(2);
    assert!(jit.is_lazy());
    jit.add_module(module(
        "pair",
        "define a() {\nentry:\n  ret 1\n}\ndefine b() {\nentry:\n  ret 2\n}\n",
    ))
    .unwrap();

    let a = jit.lookup("a").unwrap();
    let b = jit.lookup("b").unwrap();
    assert_ne!(a, b);
    assert_eq!(jit.lookup("a").unwrap(), a);

    let stats = jit.stats();
    assert_eq!(stats.stubs_created, 2);
    assert_eq!(stats.stubs_resolved, 0);
    assert_eq!(stats.functions_compiled, 0);
}

#[test]
fn test_compile_failure_is_reported_not_fatal() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = lazy_jit(2);
    jit.add_module(module(
        "broken",
        "define fine() {\nentry:\n  ret 5\n}\ndefine boom() {\nentry:\n  %r = sdiv 1, 0\n  ret %r\n}\n",
    ))
    .unwrap();

    match jit.compile_now("boom") {
        Err(JitError::LazyCompileFailure { symbol, source }) => {
            assert_eq!(symbol, "boom");
            assert!(matches!(*source, JitError::Optimization { .. }));
        }
        other => panic!("expected a lazy compile failure, got {other:?}"),
    }
    // Retrying reports the same failure without compiling again.
    assert!(matches!(
        jit.compile_now("boom"),
        Err(JitError::LazyCompileFailure { .. })
    ));

    // The sibling function is unaffected.
    assert!(jit.compile_now("fine").is_ok());
    assert_eq!(jit.stats().stubs_resolved, 1);
}

#[test]
fn test_compile_now_unknown_symbol() {
    let jit = lazy_jit(1);
    assert!(matches!(
        jit.compile_now("nothing"),
        Err(JitError::SymbolNotFound { .. })
    ));
}

#[test]
fn test_bodies_live_in_impl_namespace() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = lazy_jit(1);
    jit.add_module(module("one", "define one() {\nentry:\n  ret 1\n}\n"))
        .unwrap();

    let cod = jit.lazy_layer().expect("lazy layer");
    let impl_ns = cod.impl_namespace(jit.main_namespace()).unwrap();
    assert_eq!(impl_ns.status("one"), Some(SymbolStatus::Pending));

    let body = jit.compile_now("one").unwrap();
    assert_eq!(impl_ns.status("one"), Some(SymbolStatus::Ready(body)));
    // The public name keeps resolving to the stub.
    assert_ne!(jit.lookup("one").unwrap(), body);
}

#[cfg(all(target_arch = "x86_64", unix))]
mod execution {
    use super::*;
    use lazyjit::orc::Task;
    use std::time::Duration;

    type Fn1 = extern "C" fn(i64) -> i64;
    type Fn2 = extern "C" fn(i64, i64) -> i64;

    fn as_fn<F: Copy>(jit: &LazyJit, name: &str) -> F {
        let addr = jit.lookup(name).expect("lookup");
        // SAFETY: the tests only transmute to pointer-sized fn types.
        unsafe { std::mem::transmute_copy(&(addr.0 as usize)) }
    }

    #[test]
    fn test_first_call_compiles() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = lazy_jit(2);
        jit.add_module(module(
            "arith",
            "define mul(%a, %b) {\nentry:\n  %r = mul %a, %b\n  ret %r\n}\n",
        ))
        .unwrap();

        let stub = jit.lookup("mul").unwrap();
        let mul: Fn2 = as_fn(&jit, "mul");
        assert_eq!(mul(3, 7), 21);
        assert_eq!(mul(6, 7), 42);

        let stats = jit.stats();
        assert_eq!(stats.stubs_resolved, 1);
        assert_eq!(stats.functions_compiled, 1);
        // The stub address is stable after resolution.
        assert_eq!(jit.lookup("mul").unwrap(), stub);
    }

    #[test]
    fn test_concurrent_first_calls_compile_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = lazy_jit(4);
        jit.add_module(module(
            "sq",
            "define square(%x) {\nentry:\n  %r = mul %x, %x\n  ret %r\n}\n",
        ))
        .unwrap();

        let square: Fn1 = as_fn(&jit, "square");
        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|scope| {
            for i in 0..8i64 {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    assert_eq!(square(i), i * i);
                });
            }
        });

        let stats = jit.stats();
        assert_eq!(stats.functions_compiled, 1);
        assert_eq!(stats.stubs_resolved, 1);
    }

    #[test]
    fn test_only_called_functions_compile() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = lazy_jit(2);
        jit.add_module(module(
            "lib",
            r#"
define double(%x) {
entry:
    %r = add %x, %x
    ret %r
}
define never(%x) {
entry:
    ret %x
}
define quadruple(%x) {
entry:
    %d = call @double(%x)
    %r = call @double(%d)
    ret %r
}
"#,
        ))
        .unwrap();

        let quadruple: Fn1 = as_fn(&jit, "quadruple");
        assert_eq!(quadruple(5), 20);

        let stats = jit.stats();
        assert_eq!(stats.stubs_created, 3);
        assert_eq!(stats.stubs_resolved, 2);
        assert_eq!(stats.functions_compiled, 2);
    }

    #[test]
    fn test_mutual_recursion_through_stubs() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = lazy_jit(2);
        jit.add_module(module(
            "even",
            r#"
define is_even(%n) {
entry:
    %z = icmp eq %n, 0
    condbr %z, ^yes, ^no
yes:
    ret 1
no:
    %m = sub %n, 1
    %r = call @is_odd(%m)
    ret %r
}
"#,
        ))
        .unwrap();
        jit.add_module(module(
            "odd",
            r#"
define is_odd(%n) {
entry:
    %z = icmp eq %n, 0
    condbr %z, ^yes, ^no
yes:
    ret 0
no:
    %m = sub %n, 1
    %r = call @is_even(%m)
    ret %r
}
"#,
        ))
        .unwrap();

        let is_even: Fn1 = as_fn(&jit, "is_even");
        assert_eq!(is_even(10), 1);
        assert_eq!(is_even(7), 0);
        assert_eq!(jit.stats().stubs_resolved, 2);
    }

    #[test]
    fn test_first_call_on_pool_worker() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = lazy_jit(1);
        jit.add_module(module(
            "sq",
            "define square(%x) {\nentry:\n  %r = mul %x, %x\n  ret %r\n}\n",
        ))
        .unwrap();

        let square: Fn1 = as_fn(&jit, "square");
        let (tx, rx) = crossbeam::channel::bounded(1);
        jit.session().dispatch(Task::new("call square", move || {
            let _ = tx.send(square(9));
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(81));
        assert_eq!(jit.stats().functions_compiled, 1);
    }

    #[test]
    fn test_lazy_function_reads_global() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = lazy_jit(2);
        jit.add_module(module(
            "cfg",
            "global hidden base = 100\ndefine offset(%x) {\nentry:\n  %b = load @base\n  %r = add %b, %x\n  ret %r\n}\n",
        ))
        .unwrap();

        let offset: Fn1 = as_fn(&jit, "offset");
        assert_eq!(offset(23), 123);
        // Hidden globals are not visible to outside lookups.
        assert!(matches!(
            jit.lookup("base"),
            Err(JitError::SymbolNotFound { .. })
        ));
    }
}
