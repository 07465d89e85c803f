//! End-to-end tests of the eager pipeline: parse, optimize, compile, link, run.
//!
//! Modules are compiled as a whole on the first lookup of one of their
//! symbols; nothing here goes through lazy stubs.

use lazyjit::ir::Module;
use lazyjit::orc::SymbolStatus;
use lazyjit::{JitError, LazyJit};

fn eager_jit(threads: usize) -> LazyJit {
    LazyJit::builder()
        .num_threads(threads)
        .lazy(false)
        .build()
        .expect("jit")
}

fn module(name: &str, text: &str) -> Module {
    Module::parse(name, text).expect("parse")
}

#[cfg(all(target_arch = "x86_64", unix))]
mod execution {
    use super::*;
    use lazyjit::orc::Task;
    use std::time::Duration;

    type Fn0 = extern "C" fn() -> i64;
    type Fn1 = extern "C" fn(i64) -> i64;
    type Fn2 = extern "C" fn(i64, i64) -> i64;

    fn as_fn<F: Copy>(jit: &LazyJit, name: &str) -> F {
        let addr = jit.lookup(name).expect("lookup");
        assert!(!addr.is_null());
        // SAFETY: the tests only transmute to pointer-sized fn types.
        unsafe { std::mem::transmute_copy(&(addr.0 as usize)) }
    }

    #[test]
    fn test_multiply() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(2);
        jit.add_module(module(
            "arith",
            "define mul(%a, %b) {\nentry:\n  %r = mul %a, %b\n  ret %r\n}\n",
        ))
        .unwrap();

        let mul: Fn2 = as_fn(&jit, "mul");
        assert_eq!(mul(3, 7), 21);
        assert_eq!(mul(-4, 5), -20);

        let stats = jit.stats();
        assert_eq!(stats.modules_compiled, 1);
        assert_eq!(stats.objects_linked, 1);
        assert!(stats.code_bytes > 0);
    }

    #[test]
    fn test_repeated_lookup_returns_same_address() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(2);
        jit.add_module(module("one", "define one() {\nentry:\n  ret 1\n}\n"))
            .unwrap();

        let first = jit.lookup("one").unwrap();
        let second = jit.lookup("one").unwrap();
        assert_eq!(first, second);
        assert_eq!(jit.stats().modules_compiled, 1);
        assert_eq!(jit.main_namespace().status("one"), Some(SymbolStatus::Ready(first)));
    }

    #[test]
    fn test_cross_module_call() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(2);
        jit.add_module(module(
            "lib",
            "define square(%x) {\nentry:\n  %r = mul %x, %x\n  ret %r\n}\n",
        ))
        .unwrap();
        jit.add_module(module(
            "app",
            "define sum_squares(%a, %b) {\nentry:\n  %x = call @square(%a)\n  %y = call @square(%b)\n  %r = add %x, %y\n  ret %r\n}\n",
        ))
        .unwrap();

        let sum_squares: Fn2 = as_fn(&jit, "sum_squares");
        assert_eq!(sum_squares(3, 4), 25);
        // The dependency was pulled in by the link of `app`.
        assert_eq!(jit.stats().modules_compiled, 2);
    }

    #[test]
    fn test_loop_with_phi() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(0);
        jit.add_module(module(
            "loops",
            r#"
define factorial(%n) {
entry:
    br ^loop
loop:
    %i = phi [1, ^entry], [%next_i, ^body]
    %acc = phi [1, ^entry], [%next_acc, ^body]
    %done = icmp sgt %i, %n
    condbr %done, ^exit, ^body
body:
    %next_acc = mul %acc, %i
    %next_i = add %i, 1
    br ^loop
exit:
    ret %acc
}
"#,
        ))
        .unwrap();

        let factorial: Fn1 = as_fn(&jit, "factorial");
        assert_eq!(factorial(0), 1);
        assert_eq!(factorial(5), 120);
        assert_eq!(factorial(10), 3_628_800);
    }

    #[test]
    fn test_globals_load_and_store() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(2);
        jit.add_module(module(
            "counter",
            r#"
global count = 40
define bump() {
entry:
    %c = load @count
    %n = add %c, 1
    store @count, %n
    ret %n
}
"#,
        ))
        .unwrap();

        let bump: Fn0 = as_fn(&jit, "bump");
        assert_eq!(bump(), 41);
        assert_eq!(bump(), 42);

        let count = jit.lookup("count").unwrap();
        // SAFETY: `count` is a linked 8-byte global.
        assert_eq!(unsafe { *(count.0 as usize as *const i64) }, 42);
    }

    #[test]
    fn test_process_symbol_resolution() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(2);
        jit.add_module(module(
            "host",
            "extern labs\ndefine magnitude(%x) {\nentry:\n  %r = call @labs(%x)\n  ret %r\n}\n",
        ))
        .unwrap();

        let magnitude: Fn1 = as_fn(&jit, "magnitude");
        assert_eq!(magnitude(-17), 17);
    }

    #[test]
    fn test_host_callback() {
        extern "C" fn triple(x: i64) -> i64 {
            x * 3
        }

        let _ = env_logger::builder().is_test(true).try_init();
        let jit = LazyJit::builder()
            .num_threads(1)
            .lazy(false)
            .process_symbols(false)
            .build()
            .unwrap();
        let callback: Fn1 = triple;
        jit.define_absolute("triple", lazyjit::JitAddress(callback as usize as u64))
            .unwrap();
        jit.add_module(module(
            "cb",
            "define twice_triple(%x) {\nentry:\n  %t = call @triple(%x)\n  %r = add %t, %t\n  ret %r\n}\n",
        ))
        .unwrap();

        let f: Fn1 = as_fn(&jit, "twice_triple");
        assert_eq!(f(7), 42);
    }

    #[test]
    fn test_mutually_recursive_modules() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(2);
        jit.add_module(module(
            "even",
            "define is_even(%n) {\nentry:\n  %z = icmp eq %n, 0\n  condbr %z, ^yes, ^no\nyes:\n  ret 1\nno:\n  %m = sub %n, 1\n  %r = call @is_odd(%m)\n  ret %r\n}\n",
        ))
        .unwrap();
        jit.add_module(module(
            "odd",
            "define is_odd(%n) {\nentry:\n  %z = icmp eq %n, 0\n  condbr %z, ^yes, ^no\nyes:\n  ret 0\nno:\n  %m = sub %n, 1\n  %r = call @is_even(%m)\n  ret %r\n}\n",
        ))
        .unwrap();

        let is_even: Fn1 = as_fn(&jit, "is_even");
        assert_eq!(is_even(10), 1);
        assert_eq!(is_even(7), 0);
        let is_odd: Fn1 = as_fn(&jit, "is_odd");
        assert_eq!(is_odd(7), 1);

        let stats = jit.stats();
        assert_eq!(stats.modules_compiled, 2);
        assert_eq!(stats.failed_materializations, 0);
    }

    #[test]
    fn test_lookup_from_pool_worker() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(1);
        jit.add_module(module(
            "arith",
            "define mul(%a, %b) {\nentry:\n  %r = mul %a, %b\n  ret %r\n}\n",
        ))
        .unwrap();

        // The only worker looks the symbol up itself; nothing else can
        // materialize it.
        let (tx, rx) = crossbeam::channel::bounded(1);
        let ns = jit.main_namespace().clone();
        jit.session().dispatch(Task::new("user", move || {
            let _ = tx.send(ns.lookup("mul"));
        }));
        let addr = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("worker lookup finished")
            .unwrap();

        assert_eq!(jit.lookup("mul").unwrap(), addr);
        let mul: Fn2 = as_fn(&jit, "mul");
        assert_eq!(mul(6, 7), 42);
    }

    #[test]
    fn test_concurrent_disjoint_modules() {
        let _ = env_logger::builder().is_test(true).try_init();
        let jit = eager_jit(4);

        std::thread::scope(|scope| {
            for i in 0..8i64 {
                let jit = &jit;
                scope.spawn(move || {
                    let name = format!("plus{i}");
                    let text = format!("define {name}(%x) {{\nentry:\n  %r = add %x, {i}\n  ret %r\n}}\n");
                    jit.add_module(module(&format!("m{i}"), &text)).unwrap();
                    let f: Fn1 = as_fn(jit, &name);
                    assert_eq!(f(100), 100 + i);
                });
            }
        });

        assert_eq!(jit.stats().modules_compiled, 8);
    }
}

#[test]
fn test_duplicate_definition_keeps_first() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = eager_jit(1);
    jit.add_module(module("first", "define dup() {\nentry:\n  ret 1\n}\n"))
        .unwrap();

    let err = jit
        .add_module(module(
            "second",
            "define dup() {\nentry:\n  ret 2\n}\ndefine fresh() {\nentry:\n  ret 3\n}\n",
        ))
        .unwrap_err();
    assert!(matches!(err, JitError::DuplicateSymbol { ref name, .. } if name == "dup"));

    // The rejected module is not partially admitted.
    assert_eq!(jit.main_namespace().status("fresh"), None);
    assert_eq!(jit.main_namespace().status("dup"), Some(SymbolStatus::Pending));
}

#[test]
fn test_constant_division_by_zero_fails_lookup() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = eager_jit(2);
    jit.add_module(module(
        "bad",
        "define boom() {\nentry:\n  %r = sdiv 10, 0\n  ret %r\n}\n",
    ))
    .unwrap();

    let err = jit.lookup("boom").unwrap_err();
    assert!(matches!(err, JitError::Optimization { ref module, .. } if module == "bad"));
    assert!(matches!(
        jit.main_namespace().status("boom"),
        Some(SymbolStatus::Failed(JitError::Optimization { .. }))
    ));
    // A failed symbol keeps reporting the same error.
    assert_eq!(jit.lookup("boom").unwrap_err(), err);
    assert_eq!(jit.stats().failed_materializations, 1);
}

#[test]
fn test_unresolved_external_is_link_error() {
    let _ = env_logger::builder().is_test(true).try_init();
    let jit = LazyJit::builder()
        .num_threads(2)
        .lazy(false)
        .process_symbols(false)
        .build()
        .unwrap();
    jit.add_module(module(
        "dangling",
        "define caller() {\nentry:\n  %r = call @no_such_function()\n  ret %r\n}\n",
    ))
    .unwrap();

    match jit.lookup("caller") {
        Err(JitError::Link { module, reason }) => {
            assert_eq!(module, "dangling");
            assert!(reason.contains("no_such_function"), "{reason}");
        }
        other => panic!("expected a link error, got {other:?}"),
    }
    assert_eq!(jit.linking_layer().memory().total_bytes(), 0);
}

#[test]
fn test_unknown_symbol() {
    let jit = eager_jit(0);
    assert!(matches!(
        jit.lookup("missing"),
        Err(JitError::SymbolNotFound { .. })
    ));
}
