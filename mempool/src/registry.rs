//! Process-wide pool registry for diagnostics
//!
//! Append-only list of pool descriptors backing the operational "show
//! pools" surface. Registration happens at pool creation; records are
//! never removed (except by [`Registry::clear`], which exists for test
//! teardown), and a record whose pool has been destroyed simply renders
//! nothing.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

/// Renders one pool's diagnostic line into the buffer; returns `false`
/// when the pool behind the record no longer exists.
pub type RenderFn = Box<dyn Fn(&mut String) -> bool + Send + Sync>;

/// Descriptor of one registered pool.
pub struct PoolRecord {
    arena_base: usize,
    slot_size: usize,
    usable: usize,
    render: RenderFn,
}

impl PoolRecord {
    /// Build a record from a pool's arena geometry and render callback.
    pub fn new(arena_base: usize, slot_size: usize, usable: usize, render: RenderFn) -> Self {
        Self {
            arena_base,
            slot_size,
            usable,
            render,
        }
    }

    /// Address of the first arena slot.
    pub fn arena_base(&self) -> usize {
        self.arena_base
    }

    /// Size in bytes of one slot.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Usable object count of the registered pool.
    pub fn usable(&self) -> usize {
        self.usable
    }
}

impl std::fmt::Debug for PoolRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRecord")
            .field("arena_base", &format_args!("{:#x}", self.arena_base))
            .field("slot_size", &self.slot_size)
            .field("usable", &self.usable)
            .finish()
    }
}

/// Ordered collection of pool records.
///
/// The expected access pattern is single-writer-at-init, many-reader
/// afterwards; the lock makes the registry safe for any pattern.
#[derive(Default)]
pub struct Registry {
    records: RwLock<Vec<PoolRecord>>,
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::default);

/// The process-wide registry that pool creation appends to.
pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Registry {
    /// Create an empty registry (local registries are mainly for tests).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn register(&self, record: PoolRecord) {
        debug!(
            arena_base = record.arena_base,
            slot_size = record.slot_size,
            usable = record.usable,
            "registered mempool"
        );
        self.records.write().push(record);
    }

    /// Number of records ever registered (including destroyed pools).
    pub fn count(&self) -> usize {
        self.records.read().len()
    }

    /// Render every live pool's diagnostic line into `out`, in
    /// registration order, stopping before a line would push the output
    /// past `max_bytes`. Returns the number of bytes appended.
    pub fn render_all(&self, out: &mut String, max_bytes: usize) -> usize {
        let records = self.records.read();
        let start = out.len();
        for record in records.iter() {
            let mut line = String::new();
            if !(record.render)(&mut line) {
                continue;
            }
            if out.len() - start + line.len() > max_bytes {
                break;
            }
            out.push_str(&line);
        }
        out.len() - start
    }

    /// Drop every record. Test isolation only — production registries
    /// are append-only for the process lifetime.
    pub fn clear(&self) {
        let mut records = self.records.write();
        debug!(dropped = records.len(), "cleared mempool registry");
        records.clear();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("count", &self.count())
            .finish()
    }
}
