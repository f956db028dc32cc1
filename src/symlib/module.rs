//! Everything the library knows about one loaded module.

use std::{
    borrow::Cow,
    collections::HashSet,
    fs,
    path::Path,
};

use goblin::{
    elf::{program_header, sym, Elf},
    pe::PE,
    Object,
};
use tracing::debug;

use super::{
    lines::LineTable, AddressInfo, DebugKind, LineVisitor, SymError, SymbolInfo, SymbolVisitor,
};

/// A symbol together with the name it has in the symbol table.
#[derive(Debug)]
struct ModuleSymbol {
    info: SymbolInfo,
    raw_name: String,
}

pub struct Module {
    debug_kind: DebugKind,
    /// Virtual address the module offsets are relative to.
    base: u64,
    /// Sorted by start offset.
    symbols: Vec<ModuleSymbol>,
    lines: Option<LineTable>,
}

impl Module {
    pub fn load(path: &Path) -> Result<Self, SymError> {
        let bytes = fs::read(path).map_err(|err| {
            debug!("Failed to read {}: {err}", path.display());
            SymError::LoadFailed
        })?;

        match Object::parse(&bytes) {
            Ok(Object::Elf(elf)) => Ok(Self::from_elf(&bytes, &elf)),
            Ok(Object::PE(pe)) => Ok(Self::from_pe(&pe)),
            Ok(_) => {
                debug!("{}: unsupported object format", path.display());
                Err(SymError::LoadFailed)
            }
            Err(err) => {
                debug!("{}: {err}", path.display());
                Err(SymError::LoadFailed)
            }
        }
    }

    fn from_elf(bytes: &[u8], elf: &Elf) -> Self {
        let base = elf_load_base(elf);

        let mut symbols = vec![];
        let mut seen = HashSet::new();
        for (table, strtab) in [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)] {
            for symbol in table.iter() {
                // `st_shndx` of 0 is `SHN_UNDEF`: an import.
                if symbol.st_shndx == 0
                    || !matches!(symbol.st_type(), sym::STT_FUNC | sym::STT_OBJECT)
                    || symbol.st_value < base
                {
                    continue;
                }
                let Some(raw_name) = strtab.get_at(symbol.st_name) else {
                    continue;
                };
                if raw_name.is_empty() || !seen.insert((raw_name, symbol.st_value)) {
                    continue;
                }
                let start = symbol.st_value - base;
                symbols.push(ModuleSymbol {
                    info: SymbolInfo {
                        name: demangle(raw_name),
                        start,
                        end: start.saturating_add(symbol.st_size),
                        private: symbol.st_bind() == sym::STB_LOCAL,
                    },
                    raw_name: raw_name.to_owned(),
                });
            }
        }

        let lines = LineTable::from_elf(bytes, elf);

        let mut debug_kind = DebugKind::ELF_SYMTAB;
        if !symbols.is_empty() {
            debug_kind |= DebugKind::SYMBOLS;
        }
        if lines.is_some() {
            debug_kind |= DebugKind::LINE_NUMS | DebugKind::DWARF_LINE;
        }

        Self::new(debug_kind, base, symbols, lines)
    }

    fn from_pe(pe: &PE) -> Self {
        let mut exports = pe
            .exports
            .iter()
            .filter(|export| export.reexport.is_none())
            .filter_map(|export| Some((export.name?, export.rva as u64)))
            .collect::<Vec<_>>();
        exports.sort_by_key(|&(_, rva)| rva);

        // Export tables carry no sizes.  A symbol is assumed to extend up to the next export, or to
        // the end of the section it lives in.
        let section_end = |rva: u64| {
            pe.sections
                .iter()
                .map(|section| {
                    let start = u64::from(section.virtual_address);
                    (start, start + u64::from(section.virtual_size))
                })
                .find(|&(start, end)| start <= rva && rva < end)
                .map_or(rva, |(_, end)| end)
        };
        let symbols = exports
            .iter()
            .enumerate()
            .map(|(i, &(raw_name, start))| {
                let end = exports[i + 1..]
                    .iter()
                    .map(|&(_, next)| next)
                    .find(|&next| next > start)
                    .map_or_else(|| section_end(start), |next| next.min(section_end(start)));
                ModuleSymbol {
                    info: SymbolInfo {
                        name: demangle(raw_name),
                        start,
                        end,
                        private: false,
                    },
                    raw_name: raw_name.to_owned(),
                }
            })
            .collect::<Vec<_>>();

        let mut debug_kind = DebugKind::PECOFF_SYMTAB;
        if !symbols.is_empty() {
            debug_kind |= DebugKind::SYMBOLS;
        }
        let has_pdb = pe
            .debug_data
            .as_ref()
            .is_some_and(|debug| debug.codeview_pdb70_debug_info.is_some());
        if has_pdb {
            debug_kind |= DebugKind::PDB;
        }

        Self::new(debug_kind, 0, symbols, None)
    }

    fn new(
        debug_kind: DebugKind,
        base: u64,
        mut symbols: Vec<ModuleSymbol>,
        lines: Option<LineTable>,
    ) -> Self {
        symbols.sort_by_key(|symbol| symbol.info.start);
        Self {
            debug_kind,
            base,
            symbols,
            lines,
        }
    }

    pub fn debug_kind(&self) -> DebugKind {
        self.debug_kind
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn lookup_address(&self, offset: u64) -> Result<AddressInfo, SymError> {
        let count = self
            .symbols
            .partition_point(|symbol| symbol.info.start <= offset);
        let Some(ModuleSymbol { info, .. }) = count.checked_sub(1).map(|i| &self.symbols[i]) else {
            return Err(SymError::SymbolNotFound);
        };
        // Symbols without a size cover everything up to the next symbol.
        if info.end != info.start && offset >= info.end {
            return Err(SymError::SymbolNotFound);
        }

        Ok(AddressInfo {
            name: info.name.clone(),
            start: info.start,
            line: self
                .lines
                .as_ref()
                .and_then(|lines| lines.locate(self.base.wrapping_add(offset))),
            debug_kind: self.debug_kind,
        })
    }

    pub fn lookup_symbol(&self, name: &str) -> Result<u64, SymError> {
        self.symbols
            .iter()
            .find(|symbol| symbol.info.name == name || symbol.raw_name == name)
            .map(|symbol| symbol.info.start)
            .ok_or(SymError::SymbolNotFound)
    }

    pub fn enumerate_symbols(&self, visit: &mut SymbolVisitor<'_>) {
        for symbol in &self.symbols {
            if !visit(&symbol.info) {
                return;
            }
        }
    }

    pub fn search_symbols(
        &self,
        pattern: &str,
        include_private: bool,
        visit: &mut SymbolVisitor<'_>,
    ) -> Result<(), SymError> {
        let pattern = glob::Pattern::new(pattern).map_err(|err| {
            debug!("Invalid search pattern \"{pattern}\": {err}");
            SymError::InvalidParameter
        })?;
        for ModuleSymbol { info, .. } in &self.symbols {
            if (info.private && !include_private) || !pattern.matches(&info.name) {
                continue;
            }
            if !visit(info) {
                break;
            }
        }
        Ok(())
    }

    pub fn enumerate_lines(&self, visit: &mut LineVisitor<'_>) -> Result<(), SymError> {
        let Some(lines) = &self.lines else {
            return Err(SymError::LineNotAvailable);
        };
        lines.for_each_row(self.base, visit).map_err(|err| {
            debug!("Line table walk failed: {err}");
            SymError::Generic
        })
    }
}

/// Lowest address of a loadable segment, aligned down the way the loader maps it.  Zero for
/// position independent modules.
fn elf_load_base(elf: &Elf) -> u64 {
    elf.program_headers
        .iter()
        .filter(|header| header.p_type == program_header::PT_LOAD)
        .map(|header| header.p_vaddr & !(header.p_align.max(1) - 1))
        .min()
        .unwrap_or(0)
}

fn demangle(raw_name: &str) -> String {
    addr2line::demangle_auto(Cow::Borrowed(raw_name), None).into_owned()
}
