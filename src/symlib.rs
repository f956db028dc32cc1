//! Symbol resolution backend.
//!
//! The query front end only talks to a [`SymbolLibrary`].  [`Symbolizer`] is the implementation
//! used by the binary: it loads ELF and PE modules with `goblin` and reads DWARF line tables with
//! `addr2line`.  Every offset crossing this interface is relative to the module load base.

use std::path::Path;

use bitflags::bitflags;
use thiserror::Error;

mod lines;
mod module;
mod symbolizer;

pub use symbolizer::Symbolizer;

/// Failure of a single library call.
///
/// Discriminants are stable numeric codes, printed by the front end in verbose mode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymError {
    #[error("malformed debug information")]
    Generic = 1,

    #[error("invalid parameter")]
    InvalidParameter = 2,

    #[error("unable to load the module")]
    LoadFailed = 4,

    #[error("symbol not found")]
    SymbolNotFound = 5,

    #[error("line information not available")]
    LineNotAvailable = 6,

    #[error("feature not available")]
    FeatureNotAvailable = 8,
}

impl SymError {
    pub fn code(self) -> i32 {
        self as i32
    }
}

bitflags! {
    /// What kind of debug information a module carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DebugKind: u32 {
        /// At least one symbol is available.
        const SYMBOLS = 1 << 0;
        /// Line tables are available.
        const LINE_NUMS = 1 << 1;
        const ELF_SYMTAB = 1 << 8;
        const DWARF_LINE = 1 << 15;
        const PDB = 1 << 16;
        const PECOFF_SYMTAB = 1 << 17;
    }
}

/// A single symbol, as reported by enumeration and search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Demangled name.
    pub name: String,
    pub start: u64,
    /// One past the last byte.  Equal to `start` for symbols without a size.
    pub end: u64,
    /// Local to the module it is defined in.
    pub private: bool,
}

/// Source position of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineLocation {
    pub file: Option<String>,
    pub line: u64,
    /// Distance from the first address attributed to this line.
    pub offset: u64,
}

/// Result of a successful address lookup.
///
/// `line` is `None` when the enclosing symbol is known, but the module has no line information for
/// the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub name: String,
    pub start: u64,
    pub line: Option<LineLocation>,
    pub debug_kind: DebugKind,
}

/// One row of a module line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    /// Compilation unit name.
    pub cu: Option<String>,
    pub file: Option<String>,
    pub line: u64,
    pub addr: u64,
}

/// Visitor for symbol enumeration and search.  Returns `false` to stop the iteration.
pub type SymbolVisitor<'a> = dyn FnMut(&SymbolInfo) -> bool + 'a;

/// Visitor for line table enumeration.  Returns `false` to stop the iteration.
pub type LineVisitor<'a> = dyn FnMut(&LineInfo) -> bool + 'a;

/// Everything the query front end needs from a symbol resolution backend.
///
/// Modules are identified by path.  An implementation is free to cache whatever it loads for a
/// module until [`SymbolLibrary::shutdown`].
pub trait SymbolLibrary {
    fn debug_kind(&mut self, module: &Path) -> Result<DebugKind, SymError>;

    /// Finds the symbol that contains `offset`, along with its source line, when known.
    fn lookup_address(&mut self, module: &Path, offset: u64) -> Result<AddressInfo, SymError>;

    /// Finds the start offset of a symbol with the given name.
    fn lookup_symbol(&mut self, module: &Path, name: &str) -> Result<u64, SymError>;

    /// Calls `visit` for every symbol in the module.
    fn enumerate_symbols(
        &mut self,
        module: &Path,
        visit: &mut SymbolVisitor<'_>,
    ) -> Result<(), SymError>;

    /// Whether [`SymbolLibrary::search_symbols`] is implemented.
    fn supports_search(&self) -> bool;

    /// Calls `visit` for every symbol matching a glob `pattern`.  Private symbols are only
    /// considered when `include_private` is set.
    fn search_symbols(
        &mut self,
        module: &Path,
        pattern: &str,
        include_private: bool,
        visit: &mut SymbolVisitor<'_>,
    ) -> Result<(), SymError>;

    /// Calls `visit` for every line table row of the module.
    fn enumerate_lines(&mut self, module: &Path, visit: &mut LineVisitor<'_>)
        -> Result<(), SymError>;

    /// Releases everything the library holds.
    fn shutdown(self) -> Result<(), SymError>
    where
        Self: Sized;
}
