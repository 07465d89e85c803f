// This module tracks JIT activity counters. StatsCounters holds atomics that the layers bump
// as work flows through them (modules compiled, functions compiled, bytes of machine code,
// objects linked, lazy stubs created and resolved, trackers removed) and can be shared freely
// between worker threads. JitStats is a plain snapshot of those counters with a Display
// implementation used by the command-line driver to print a summary after a run.

//! Counters for compilation and linking activity.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Live counters shared by the session and its layers.
#[derive(Debug, Default)]
pub struct StatsCounters {
    modules_compiled: AtomicUsize,
    functions_compiled: AtomicUsize,
    code_bytes: AtomicUsize,
    objects_linked: AtomicUsize,
    stubs_created: AtomicUsize,
    stubs_resolved: AtomicUsize,
    trackers_removed: AtomicUsize,
    failed_materializations: AtomicUsize,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a module was compiled to an object.
    pub fn record_module_compiled(&self, functions: usize, code_size: usize) {
        self.modules_compiled.fetch_add(1, Ordering::Relaxed);
        self.functions_compiled.fetch_add(functions, Ordering::Relaxed);
        self.code_bytes.fetch_add(code_size, Ordering::Relaxed);
    }

    pub fn record_object_linked(&self) {
        self.objects_linked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stubs_created(&self, count: usize) {
        self.stubs_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stub_resolved(&self) {
        self.stubs_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tracker_removed(&self) {
        self.trackers_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_materializations(&self, count: usize) {
        self.failed_materializations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JitStats {
        JitStats {
            modules_compiled: self.modules_compiled.load(Ordering::Relaxed),
            functions_compiled: self.functions_compiled.load(Ordering::Relaxed),
            code_bytes: self.code_bytes.load(Ordering::Relaxed),
            objects_linked: self.objects_linked.load(Ordering::Relaxed),
            stubs_created: self.stubs_created.load(Ordering::Relaxed),
            stubs_resolved: self.stubs_resolved.load(Ordering::Relaxed),
            trackers_removed: self.trackers_removed.load(Ordering::Relaxed),
            failed_materializations: self.failed_materializations.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of the JIT counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JitStats {
    /// Modules turned into object code.
    pub modules_compiled: usize,

    /// Function bodies generated.
    pub functions_compiled: usize,

    /// Total machine code size (bytes).
    pub code_bytes: usize,

    /// Objects mapped into memory and published.
    pub objects_linked: usize,

    /// Indirection stubs installed for lazy functions.
    pub stubs_created: usize,

    /// Stubs redirected to a compiled body.
    pub stubs_resolved: usize,

    pub trackers_removed: usize,

    pub failed_materializations: usize,
}

impl fmt::Display for JitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "JIT Statistics:")?;
        writeln!(f, "  Modules compiled: {}", self.modules_compiled)?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.code_bytes)?;
        writeln!(f, "  Objects linked: {}", self.objects_linked)?;
        writeln!(
            f,
            "  Lazy stubs: {} created, {} resolved",
            self.stubs_created, self.stubs_resolved
        )?;
        writeln!(f, "  Trackers removed: {}", self.trackers_removed)?;
        if self.failed_materializations > 0 {
            writeln!(f, "  Failed materializations: {}", self.failed_materializations)?;
        }
        Ok(())
    }
}
