//! Text rendering of query results.
//!
//! Every function writes complete lines into `out`, and does nothing else, so the output of a run
//! only depends on the [`RunConfig`] and the library results.

use std::{io, path::Path};

use crate::{
    query::RunConfig,
    symlib::{AddressInfo, DebugKind, LineInfo, SymError, SymbolInfo},
};

pub fn write_debug_kind(out: &mut dyn io::Write, kind: DebugKind) -> io::Result<()> {
    let format = if kind.contains(DebugKind::ELF_SYMTAB) {
        "ELF symtab"
    } else if kind.contains(DebugKind::PECOFF_SYMTAB) {
        "PECOFF symtab"
    } else if kind.contains(DebugKind::PDB) {
        "PDB"
    } else {
        "no symbols"
    };
    let has = |flag: DebugKind| if kind.contains(flag) { "has" } else { "NO" };
    writeln!(
        out,
        "<debug info: type={format}, {} symbols, {} line numbers>",
        has(DebugKind::SYMBOLS),
        has(DebugKind::LINE_NUMS),
    )
}

/// Result of an address lookup.
///
/// The function line is only printed with `show_func`.  The source line is printed as `??:0` when
/// the library knows the function, but not the line.
pub fn write_address(
    out: &mut dyn io::Write,
    config: &RunConfig,
    offset: u64,
    result: &Result<AddressInfo, SymError>,
) -> io::Result<()> {
    let info = match result {
        Ok(info) => info,
        Err(err) => {
            if config.verbose {
                writeln!(out, "drsym_lookup_address error {}", err.code())?;
            } else if config.show_func {
                writeln!(out, "?")?;
            }
            return Ok(());
        }
    };

    if config.verbose {
        write_debug_kind(out, info.debug_kind)?;
    }
    if config.show_func {
        writeln!(out, "{}+0x{:x}", info.name, offset.wrapping_sub(info.start))?;
    }
    match &info.line {
        Some(line) => writeln!(
            out,
            "{}:{}+0x{:x}",
            line.file.as_deref().unwrap_or("??"),
            line.line,
            line.offset,
        ),
        None => writeln!(out, "??:0"),
    }
}

/// Result of an exact symbol lookup.
pub fn write_symbol_address(
    out: &mut dyn io::Write,
    config: &RunConfig,
    module: &Path,
    name: &str,
    result: Result<u64, SymError>,
) -> io::Result<()> {
    match result {
        Ok(offset) => writeln!(out, "+0x{offset:x}"),
        Err(err) if config.verbose => writeln!(
            out,
            "drsym error {} looking up \"{name}\" in \"{}\"",
            err.code(),
            module.display(),
        ),
        Err(_) => writeln!(out, "??"),
    }
}

/// A single match of a symbol enumeration or search.
pub fn write_symbol(out: &mut dyn io::Write, symbol: &SymbolInfo) -> io::Result<()> {
    let SymbolInfo {
        name, start, end, ..
    } = symbol;
    writeln!(out, "{name} +0x{start:x}-0x{end:x}")
}

pub fn write_enumeration_error(
    out: &mut dyn io::Write,
    config: &RunConfig,
    err: SymError,
) -> io::Result<()> {
    if config.verbose {
        writeln!(out, "search/enum error {}", err.code())?;
    }
    Ok(())
}

/// A single line table row.
pub fn write_line(out: &mut dyn io::Write, line: &LineInfo) -> io::Result<()> {
    const NULL: &str = "<null>";
    writeln!(
        out,
        "cu=\"{}\", file=\"{}\" line={}, addr={:#018x}",
        line.cu.as_deref().unwrap_or(NULL),
        line.file.as_deref().unwrap_or(NULL),
        line.line,
        line.addr,
    )
}

pub fn write_line_enumeration_error(
    out: &mut dyn io::Write,
    config: &RunConfig,
    err: SymError,
) -> io::Result<()> {
    if config.verbose {
        writeln!(out, "line enum error {}", err.code())?;
    }
    Ok(())
}
