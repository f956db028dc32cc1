//! Runs the queries selected on the command line against a [`SymbolLibrary`].
//!
//! Failures of individual queries are reported in the output and never stop the run.  Only
//! failures to write the output are returned as errors.

use std::{
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    format,
    query::{parse_batch_line, parse_hex_offset, Query, RunConfig, BATCH_EXIT},
    symlib::{SymError, SymbolInfo, SymbolLibrary},
};

/// What a single run does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Look up hexadecimal offsets in one module.
    Addresses { module: PathBuf, offsets: Vec<String> },

    /// Look up `<module>;<offset>` pairs read from the input.
    Batch,

    /// Look up symbol names or patterns in one module.
    Symbols {
        module: PathBuf,
        names: Vec<String>,
        lookup: Lookup,
    },

    /// Print every symbol of a module.
    List { module: PathBuf },

    /// Print every line table row of a module.
    Lines { module: PathBuf },
}

/// How symbol names given in [`Mode::Symbols`] are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    Search { include_private: bool },
}

pub fn run<Library, Input>(
    library: &mut Library,
    config: &RunConfig,
    mode: &Mode,
    input: Input,
    out: &mut dyn Write,
) -> io::Result<()>
where
    Library: SymbolLibrary,
    Input: BufRead,
{
    match mode {
        Mode::Addresses { module, offsets } => {
            for token in offsets {
                match parse_hex_offset(token) {
                    Some(offset) => execute(
                        library,
                        config,
                        Query::AddressLookup { module, offset },
                        out,
                    )?,
                    None => writeln!(out, "ERROR: unknown input {token}")?,
                }
            }
        }
        Mode::Batch => run_batch(library, config, input, out)?,
        Mode::Symbols {
            module,
            names,
            lookup,
        } => {
            for name in names {
                let query = match *lookup {
                    Lookup::Exact => Query::SymbolLookup { module, name },
                    Lookup::Search { include_private } => Query::SymbolSearch {
                        module,
                        pattern: name,
                        include_private,
                    },
                };
                execute(library, config, query, out)?;
            }
        }
        Mode::List { module } => execute(library, config, Query::FullEnumeration { module }, out)?,
        Mode::Lines { module } => execute(library, config, Query::LineEnumeration { module }, out)?,
    }
    out.flush()
}

/// Reads batch mode lines until the end of the input, or until [`BATCH_EXIT`].
///
/// Output is flushed after every resolved line, as the other end of a pipe might be waiting for it
/// before sending the next one.
fn run_batch<Library, Input>(
    library: &mut Library,
    config: &RunConfig,
    mut input: Input,
    out: &mut dyn Write,
) -> io::Result<()>
where
    Library: SymbolLibrary,
    Input: BufRead,
{
    let mut buf = vec![];
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if line == BATCH_EXIT {
            break;
        }

        match parse_batch_line(line) {
            Some((module, offset)) => {
                execute(library, config, Query::AddressLookup { module, offset }, out)?;
                out.flush()?;
            }
            None if config.verbose => writeln!(out, "Error: unknown input {line}")?,
            None => debug!("Ignoring malformed input: {line}"),
        }
    }
    Ok(())
}

/// Runs one query and writes its result.
pub fn execute<Library: SymbolLibrary>(
    library: &mut Library,
    config: &RunConfig,
    query: Query<'_>,
    out: &mut dyn Write,
) -> io::Result<()> {
    match query {
        Query::AddressLookup { module, offset } => {
            let result = library.lookup_address(module, offset);
            if let Err(err) = &result {
                debug!("{}: 0x{offset:x}: {err}", module.display());
            }
            format::write_address(out, config, offset, &result)
        }

        Query::SymbolLookup { module, name } if config.external_enum => {
            write_module_debug_kind(library, config, module, out)?;
            let result = write_each(
                out,
                |out, symbol: &SymbolInfo| {
                    if symbol.name == name {
                        format::write_symbol(out, symbol)
                    } else {
                        Ok(())
                    }
                },
                |visit| library.enumerate_symbols(module, visit),
            )?;
            report_enumeration(out, config, result)
        }

        Query::SymbolLookup { module, name } => {
            write_module_debug_kind(library, config, module, out)?;
            let result = library.lookup_symbol(module, name);
            if let Err(err) = &result {
                debug!("{}: \"{name}\": {err}", module.display());
            }
            format::write_symbol_address(out, config, module, name, result)
        }

        Query::SymbolSearch {
            module,
            pattern,
            include_private,
        } => {
            write_module_debug_kind(library, config, module, out)?;
            let result = if library.supports_search() {
                write_each(out, format::write_symbol, |visit| {
                    library.search_symbols(module, pattern, include_private, visit)
                })?
            } else {
                Err(SymError::FeatureNotAvailable)
            };
            report_enumeration(out, config, result)
        }

        Query::FullEnumeration { module } => {
            write_module_debug_kind(library, config, module, out)?;
            let result = write_each(out, format::write_symbol, |visit| {
                library.enumerate_symbols(module, visit)
            })?;
            report_enumeration(out, config, result)
        }

        Query::LineEnumeration { module } => {
            write_module_debug_kind(library, config, module, out)?;
            let result = write_each(out, format::write_line, |visit| {
                library.enumerate_lines(module, visit)
            })?;
            if let Err(err) = result {
                debug!("{}: line enumeration: {err}", module.display());
                format::write_line_enumeration_error(out, config, err)?;
            }
            Ok(())
        }
    }
}

fn report_enumeration(
    out: &mut dyn Write,
    config: &RunConfig,
    result: Result<(), SymError>,
) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!("Symbol enumeration: {err}");
            format::write_enumeration_error(out, config, err)
        }
    }
}

/// In verbose mode, describes the debug information of `module`.  Prints nothing if the library
/// can not tell.
fn write_module_debug_kind<Library: SymbolLibrary>(
    library: &mut Library,
    config: &RunConfig,
    module: &Path,
    out: &mut dyn Write,
) -> io::Result<()> {
    if !config.verbose {
        return Ok(());
    }
    match library.debug_kind(module) {
        Ok(kind) => format::write_debug_kind(out, kind),
        Err(err) => {
            debug!("{}: debug kind: {err}", module.display());
            Ok(())
        }
    }
}

/// Runs a library enumeration, writing every visited item with `write`.
///
/// The first write failure stops the enumeration and is returned as the outer error.  The inner
/// result is what the library reported.
fn write_each<Item>(
    out: &mut dyn Write,
    mut write: impl FnMut(&mut dyn Write, &Item) -> io::Result<()>,
    enumerate: impl FnOnce(&mut dyn FnMut(&Item) -> bool) -> Result<(), SymError>,
) -> io::Result<Result<(), SymError>> {
    let mut failure = None;
    let result = enumerate(&mut |item: &Item| match write(&mut *out, item) {
        Ok(()) => true,
        Err(err) => {
            failure = Some(err);
            false
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(result),
    }
}
