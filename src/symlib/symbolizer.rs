use std::{
    collections::{hash_map::Entry, HashMap},
    path::{Path, PathBuf},
};

use tracing::{debug, trace};

use super::{
    module::Module, AddressInfo, DebugKind, LineVisitor, SymError, SymbolLibrary, SymbolVisitor,
};

/// [`SymbolLibrary`] backed by `goblin` and `addr2line`.
///
/// Modules are loaded on first use and kept until [`SymbolLibrary::shutdown`].  A module that
/// failed to load is not remembered, so every query against it reports
/// [`SymError::LoadFailed`].
pub struct Symbolizer {
    modules: HashMap<PathBuf, Module>,
}

impl Symbolizer {
    pub fn init() -> Result<Self, SymError> {
        Ok(Self {
            modules: HashMap::new(),
        })
    }

    fn module(&mut self, path: &Path) -> Result<&Module, SymError> {
        match self.modules.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => {
                trace!("Cached module: {}", path.display());
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                let module = Module::load(path)?;
                debug!(
                    "Loaded {}: {} symbols, {:?}",
                    path.display(),
                    module.symbol_count(),
                    module.debug_kind(),
                );
                Ok(entry.insert(module))
            }
        }
    }
}

impl SymbolLibrary for Symbolizer {
    fn debug_kind(&mut self, module: &Path) -> Result<DebugKind, SymError> {
        Ok(self.module(module)?.debug_kind())
    }

    fn lookup_address(&mut self, module: &Path, offset: u64) -> Result<AddressInfo, SymError> {
        trace!("lookup_address({}, 0x{offset:x})", module.display());
        self.module(module)?.lookup_address(offset)
    }

    fn lookup_symbol(&mut self, module: &Path, name: &str) -> Result<u64, SymError> {
        trace!("lookup_symbol({}, {name})", module.display());
        self.module(module)?.lookup_symbol(name)
    }

    fn enumerate_symbols(
        &mut self,
        module: &Path,
        visit: &mut SymbolVisitor<'_>,
    ) -> Result<(), SymError> {
        self.module(module)?.enumerate_symbols(visit);
        Ok(())
    }

    fn supports_search(&self) -> bool {
        true
    }

    fn search_symbols(
        &mut self,
        module: &Path,
        pattern: &str,
        include_private: bool,
        visit: &mut SymbolVisitor<'_>,
    ) -> Result<(), SymError> {
        self.module(module)?
            .search_symbols(pattern, include_private, visit)
    }

    fn enumerate_lines(
        &mut self,
        module: &Path,
        visit: &mut LineVisitor<'_>,
    ) -> Result<(), SymError> {
        self.module(module)?.enumerate_lines(visit)
    }

    fn shutdown(mut self) -> Result<(), SymError> {
        debug!("Releasing {} modules", self.modules.len());
        self.modules.clear();
        Ok(())
    }
}

/// These tests use the test executable itself as the module under inspection.
#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::env;

    use pretty_assertions::assert_eq;

    use super::*;

    fn test_executable() -> PathBuf {
        env::current_exe().expect("Test executable path is known")
    }

    #[test]
    fn elf_debug_kind() {
        let mut library = Symbolizer::init().unwrap();
        let kind = library.debug_kind(&test_executable()).unwrap();
        assert!(kind.contains(DebugKind::ELF_SYMTAB | DebugKind::SYMBOLS));
        assert!(!kind.contains(DebugKind::PECOFF_SYMTAB));
    }

    #[test]
    fn symbol_and_address_agree() {
        let mut library = Symbolizer::init().unwrap();
        let exe = test_executable();

        let offset = library.lookup_symbol(&exe, "main").unwrap();
        let info = library.lookup_address(&exe, offset).unwrap();
        assert_eq!(info.start, offset);
        assert_eq!(library.lookup_symbol(&exe, &info.name), Ok(offset));
    }

    #[test]
    fn search_finds_main() {
        let mut library = Symbolizer::init().unwrap();
        let mut found = vec![];
        library
            .search_symbols(&test_executable(), "mai?", true, &mut |symbol| {
                found.push(symbol.name.clone());
                true
            })
            .unwrap();
        assert!(found.iter().any(|name| name == "main"), "Found: {found:?}");
    }

    #[test]
    fn elf_line_numbers() {
        let mut library = Symbolizer::init().unwrap();
        let kind = library.debug_kind(&test_executable()).unwrap();
        assert!(
            kind.contains(DebugKind::LINE_NUMS | DebugKind::DWARF_LINE),
            "Kind: {kind:?}"
        );
    }

    #[test]
    fn address_of_this_test_has_a_line() {
        let mut library = Symbolizer::init().unwrap();
        let exe = test_executable();

        let mut found = vec![];
        library
            .search_symbols(
                &exe,
                "symquery::symlib::symbolizer::tests::address_of_this_test_has_a_line*",
                true,
                &mut |symbol| {
                    found.push(symbol.start);
                    true
                },
            )
            .unwrap();
        let Some(&offset) = found.first() else {
            panic!("Test function symbol not found");
        };

        let info = library.lookup_address(&exe, offset).unwrap();
        let Some(line) = info.line else {
            panic!("No line for {}", info.name);
        };
        let file = line.file.unwrap_or_default();
        assert!(file.ends_with("symbolizer.rs"), "File: {file}");
        assert!(line.line > 0);
    }

    #[test]
    fn line_rows_name_their_files() {
        let mut library = Symbolizer::init().unwrap();
        let mut row = None;
        library
            .enumerate_lines(&test_executable(), &mut |info| {
                let ours = info
                    .file
                    .as_deref()
                    .is_some_and(|file| file.ends_with("symbolizer.rs"));
                if ours && info.line > 0 {
                    row = Some(info.clone());
                }
                row.is_none()
            })
            .unwrap();

        let Some(row) = row else {
            panic!("No line rows for this file");
        };
        let file = row.file.unwrap_or_default();
        assert!(Path::new(&file).is_absolute(), "File: {file}");
    }

    #[test]
    fn missing_module() {
        let mut library = Symbolizer::init().unwrap();
        let missing = Path::new("/nonexistent/module.so");
        assert_eq!(library.debug_kind(missing), Err(SymError::LoadFailed));
        assert_eq!(
            library.lookup_address(missing, 0x10),
            Err(SymError::LoadFailed)
        );
        library.shutdown().unwrap();
    }

    #[test]
    fn not_a_binary() {
        let mut library = Symbolizer::init().unwrap();
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        assert_eq!(
            library.lookup_symbol(&manifest, "main"),
            Err(SymError::LoadFailed)
        );
    }
}
