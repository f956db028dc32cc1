///! Queries against a module, and parsing of the textual query inputs.
use std::path::Path;

/// Batch mode input line that ends the read loop.
pub const BATCH_EXIT: &str = ";exit";

/// Output options, fixed for the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Print the function name in front of the source line of an address.
    pub show_func: bool,
    /// Print the module debug kind and the error codes of failed queries.
    pub verbose: bool,
    /// Resolve exact symbol names by enumerating all the module symbols, rather than by a direct
    /// lookup.
    pub external_enum: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query<'a> {
    AddressLookup {
        module: &'a Path,
        offset: u64,
    },
    SymbolLookup {
        module: &'a Path,
        name: &'a str,
    },
    SymbolSearch {
        module: &'a Path,
        pattern: &'a str,
        include_private: bool,
    },
    FullEnumeration {
        module: &'a Path,
    },
    LineEnumeration {
        module: &'a Path,
    },
}

/// Reads a hexadecimal number the way `scanf("%x")` does: leading whitespace, one optional sign
/// and an optional `0x` prefix are skipped, and anything after the last hex digit is ignored.  A
/// `-` sign negates the value modulo 2^64.
pub fn parse_hex_offset(input: &str) -> Option<u64> {
    let input = input.trim_start();
    let (negative, input) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_hexdigit()))
        .unwrap_or(input);
    let end = digits
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let value = u64::from_str_radix(&digits[..end], 16).ok()?;
    Some(if negative { value.wrapping_neg() } else { value })
}

/// Splits a batch mode line of the form `<module path>;<hex offset>`.
///
/// Module paths never contain `;`, as it is the `PATH` separator on Windows.
pub fn parse_batch_line(line: &str) -> Option<(&Path, u64)> {
    let (module, offset) = line.split_once(';')?;
    if module.is_empty() {
        return None;
    }
    Some((Path::new(module), parse_hex_offset(offset)?))
}
