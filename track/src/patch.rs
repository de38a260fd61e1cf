//! Import table patching.
//!
//! A module calls into another module's exports through an import table, one slot per imported
//! symbol. Patching looks up the real address of each export listed in a [`PatchTable`], stores
//! it where the replacement can find it, and rewrites every slot holding that address to point at
//! the replacement instead. Slots not bound yet are matched by the symbol they will bind to.
//! Modules that never import the symbol are left alone, and slots that already hold the
//! replacement count as done, so patching twice is harmless.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Result;

/// How an export is identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportRef {
    Name(String),
    Ordinal(u16),
}

impl fmt::Display for ImportRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportRef::Name(name) => f.write_str(name),
            ImportRef::Ordinal(ordinal) => write!(f, "#{}", ordinal),
        }
    }
}

/// One export to redirect.
#[derive(Debug)]
pub struct PatchEntry {
    /// File name, or name prefix, of the exporting module.
    pub exporter: String,
    pub import: ImportRef,
    /// Receives the real address of the export before any slot is rewritten.
    pub original: &'static AtomicUsize,
    pub replacement: usize,
}

impl PatchEntry {
    /// Real address of the export, once any module has been patched.
    pub fn original(&self) -> Option<usize> {
        match self.original.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }
}

/// The list of redirections applied to every tracked module.
#[derive(Debug, Default)]
pub struct PatchTable {
    entries: Vec<PatchEntry>,
}

impl PatchTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn entry(
        mut self,
        exporter: &str,
        import: ImportRef,
        original: &'static AtomicUsize,
        replacement: usize,
    ) -> Self {
        self.entries.push(PatchEntry {
            exporter: exporter.to_owned(),
            import,
            original,
            replacement,
        });
        self
    }

    pub fn entries(&self) -> &[PatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The import slots of one module.
pub trait ImportTable {
    /// `true` if the module links against a module whose file name starts with `exporter`.
    fn imports_from(&self, exporter: &str) -> bool;

    fn slot_count(&self) -> usize;

    fn read_slot(&self, index: usize) -> usize;

    /// Overwrite a slot, lifting write protection for the duration of the write.
    fn write_slot(&mut self, index: usize, value: usize) -> Result<()>;

    /// Symbol a slot will be bound to on first call, while it still points into the module's
    /// own lazy-binding stubs instead of at the export.
    fn unbound_symbol(&self, _index: usize) -> Option<&str> {
        None
    }
}

/// Finds the real address of an export.
pub trait ExportResolver {
    fn resolve(&self, exporter: &str, import: &ImportRef) -> Option<usize>;
}

/// What one patching pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Slots rewritten.
    pub patched: usize,
    /// Entries whose slots already held the replacement.
    pub already: usize,
    /// Entries the module does not import or that could not be resolved.
    pub skipped: usize,
}

impl std::ops::AddAssign for PatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.patched += other.patched;
        self.already += other.already;
        self.skipped += other.skipped;
    }
}

/// Redirect every entry of `patches` the module imports.
pub fn patch_module(
    table: &mut dyn ImportTable,
    resolver: &dyn ExportResolver,
    patches: &PatchTable,
) -> Result<PatchOutcome> {
    let mut outcome = PatchOutcome::default();
    for entry in patches.entries() {
        if !table.imports_from(&entry.exporter) {
            outcome.skipped += 1;
            continue;
        }
        let real = match resolver.resolve(&entry.exporter, &entry.import) {
            Some(real) if real != entry.replacement => real,
            _ => {
                log::debug!("cannot resolve {}!{}", entry.exporter, entry.import);
                outcome.skipped += 1;
                continue;
            }
        };
        // The replacement forwards through `original`, so it must be set before any slot moves.
        let _ = entry
            .original
            .compare_exchange(0, real, Ordering::AcqRel, Ordering::Acquire);

        let mut rewritten = 0;
        let mut present = false;
        for index in 0..table.slot_count() {
            let value = table.read_slot(index);
            let unbound = match (&entry.import, table.unbound_symbol(index)) {
                (ImportRef::Name(name), Some(symbol)) => name == symbol,
                _ => false,
            };
            if value == entry.replacement {
                present = true;
            } else if value == real || unbound {
                table.write_slot(index, entry.replacement)?;
                rewritten += 1;
            }
        }
        if rewritten > 0 {
            outcome.patched += rewritten;
        } else if present {
            outcome.already += 1;
        } else {
            outcome.skipped += 1;
        }
    }
    Ok(outcome)
}

/// Point every slot holding a replacement back at the real export. Returns the slots restored.
pub fn restore_module(table: &mut dyn ImportTable, patches: &PatchTable) -> Result<usize> {
    let mut restored = 0;
    for entry in patches.entries() {
        let original = match entry.original() {
            Some(original) => original,
            None => continue,
        };
        for index in 0..table.slot_count() {
            if table.read_slot(index) == entry.replacement {
                table.write_slot(index, original)?;
                restored += 1;
            }
        }
    }
    Ok(restored)
}
