use std::{
    ffi::OsString,
    fs::File,
    path::{self, PathBuf},
};

use clap::{error::ErrorKind, Parser};
use thiserror::Error;
use tracing::debug;

use crate::{
    dispatch::{Lookup, Mode},
    query::RunConfig,
};

/// Looks up symbols, addresses and source lines in ELF and PE modules.
///
/// Flags are case insensitive.  `-a` and `-s` must come last: everything after them is taken as
/// offsets or symbol names.
#[derive(Parser, Debug)]
#[command(version, about, args_override_self = true)]
pub struct Args {
    #[arg(short = 'e', value_name = "MODULE", allow_hyphen_values = true)]
    /// Module to query.
    pub module: Option<PathBuf>,

    #[arg(short = 'f')]
    /// Show function names of the looked up addresses.
    pub show_func: bool,

    #[arg(short = 'v')]
    /// Print debug information kinds and error codes.
    pub verbose: bool,

    #[arg(short = 'q')]
    /// Read `<module path>;<hex offset>` lines from stdin, until `;exit`.
    pub batch: bool,

    #[arg(long = "enum")]
    /// Match exact symbol names by enumerating all the symbols.
    pub external_enum: bool,

    #[arg(long)]
    /// List all symbols in the module.
    pub list: bool,

    #[arg(long)]
    /// Treat `-s` names as wildcard patterns (`*`, `?`).
    pub search: bool,

    #[arg(long)]
    /// Same as `--search`, but also match private symbols.
    pub searchall: bool,

    #[arg(long)]
    /// List all source lines in the module.
    pub lines: bool,

    #[arg(
        short = 'a',
        value_name = "OFFSET",
        num_args = 1..,
        allow_hyphen_values = true
    )]
    /// Hex offsets, relative to the module base, to look up.
    pub addresses: Option<Vec<String>>,

    #[arg(
        short = 's',
        value_name = "SYMBOL",
        num_args = 1..,
        allow_hyphen_values = true
    )]
    /// Symbol names, or patterns with `--search`, to look up.
    pub symbols: Option<Vec<String>>,
}

/// A fully validated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub config: RunConfig,
    pub mode: Mode,
}

#[derive(Error, Debug)]
pub enum InvocationError {
    /// `--help` or `--version` output.
    #[error("{0}")]
    Info(clap::Error),

    #[error("{0}")]
    Usage(String),

    #[error("ERROR: invalid path {0}")]
    InvalidPath(String),
}

pub fn parse<I>(args: I) -> Result<Invocation, InvocationError>
where
    I: IntoIterator<Item = OsString>,
{
    let args = Args::try_parse_from(normalize_flags(args)).map_err(|err| match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => InvocationError::Info(err),
        _ => InvocationError::Usage(err.to_string()),
    })?;
    args.into_invocation()
}

/// Lower cases every flag, so that `-E` and `--LIST` are accepted.  Module paths, offsets and
/// symbol names are kept as is.
fn normalize_flags<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    // Program name.
    let mut normalized = args.next().into_iter().collect::<Vec<_>>();

    while let Some(arg) = args.next() {
        let Some(flag) = arg
            .to_str()
            .filter(|arg| arg.starts_with('-'))
            .map(str::to_ascii_lowercase)
        else {
            normalized.push(arg);
            continue;
        };

        let takes_value = flag == "-e";
        let takes_rest = flag == "-a" || flag == "-s";
        normalized.push(flag.into());
        if takes_rest {
            normalized.extend(args.by_ref());
            break;
        }
        if takes_value {
            normalized.extend(args.next());
        }
    }

    normalized
}

impl Args {
    fn into_invocation(self) -> Result<Invocation, InvocationError> {
        let module = self.module.map(resolve_module).transpose()?;

        let modes = [
            self.addresses.is_some(),
            self.symbols.is_some(),
            self.batch,
            self.list,
            self.lines,
        ];
        if modes.into_iter().filter(|&selected| selected).count() != 1 {
            return Err(InvocationError::Usage(
                "Exactly one of -a, -s, -q, --list or --lines is required".to_owned(),
            ));
        }

        let config = RunConfig {
            show_func: self.show_func,
            verbose: self.verbose,
            external_enum: self.external_enum,
        };

        let module = match (module, self.batch) {
            (None, true) => {
                return Ok(Invocation {
                    config,
                    mode: Mode::Batch,
                })
            }
            (Some(_), true) => {
                return Err(InvocationError::Usage(
                    "-e can not be used with -q".to_owned(),
                ))
            }
            (None, false) => {
                return Err(InvocationError::Usage("-e <module> is required".to_owned()))
            }
            (Some(module), false) => module,
        };

        let mode = if let Some(offsets) = self.addresses {
            Mode::Addresses { module, offsets }
        } else if let Some(names) = self.symbols {
            let lookup = if self.search || self.searchall {
                Lookup::Search {
                    include_private: self.searchall,
                }
            } else {
                Lookup::Exact
            };
            Mode::Symbols {
                module,
                names,
                lookup,
            }
        } else if self.list {
            Mode::List { module }
        } else {
            Mode::Lines { module }
        };

        Ok(Invocation { config, mode })
    }
}

/// Makes the module path absolute, and checks that it is a readable file.
fn resolve_module(module: PathBuf) -> Result<PathBuf, InvocationError> {
    let invalid = |err: &dyn std::error::Error| {
        debug!("Module {}: {err}", module.display());
        InvocationError::InvalidPath(module.display().to_string())
    };

    let absolute = path::absolute(&module).map_err(|err| invalid(&err))?;
    let file = File::open(&absolute).map_err(|err| invalid(&err))?;
    let metadata = file.metadata().map_err(|err| invalid(&err))?;
    if !metadata.is_file() {
        debug!("Module {}: not a file", module.display());
        return Err(InvocationError::InvalidPath(module.display().to_string()));
    }

    Ok(absolute)
}

const USAGE: &[(&str, &str)] = &[
    (
        "Look up addresses for one module",
        "-e <module> [-f] [-v] -a [<address relative to module base> ...]",
    ),
    (
        "Look up addresses for multiple modules",
        "[-f] [-v] -q <pairs of [module_path;address relative to module base] on stdin>",
    ),
    (
        "Look up exact symbols for one module",
        "-e <module> [-v] [--enum] -s [<symbol1> <symbol2> ...]",
    ),
    (
        "Look up symbols matching wildcard patterns (glob-style: *,?) for one module",
        "-e <module> [-v] --search -s [<symbol1> <symbol2> ...]",
    ),
    (
        "Look up private symbols matching wildcard patterns (glob-style: *,?) for one module",
        "-e <module> [-v] --searchall -s [<symbol1> <symbol2> ...]",
    ),
    ("List all symbols in a module", "-e <module> [-v] --list"),
    ("List all source lines in a module", "-e <module> [-v] --lines"),
];

const OPTIONS: &str = "\
Optional parameters:
  -f = show function name
  -v = verbose
  --enum = look up via external enum rather than a direct symbol lookup
";

/// Usage message printed for any invalid command line.
pub fn usage(program: &str) -> String {
    let mut usage = String::from("Usage:\n");
    for (what, how) in USAGE {
        usage.push_str(&format!("{what}:\n  {program} {how}\n"));
    }
    usage.push_str(OPTIONS);
    usage
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use super::*;

    fn manifest() -> String {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("Cargo.toml")
            .to_string_lossy()
            .into_owned()
    }

    fn parse_strs(args: &[&str]) -> Result<Invocation, InvocationError> {
        parse(
            ["symquery"]
                .iter()
                .chain(args)
                .map(|arg| OsString::from(*arg)),
        )
    }

    fn parse_ok(args: &[&str]) -> Invocation {
        match parse_strs(args) {
            Ok(invocation) => invocation,
            Err(err) => panic!("Failed to parse {args:?}: {err}"),
        }
    }

    fn assert_usage(args: &[&str]) {
        let result = parse_strs(args);
        assert!(
            matches!(result, Err(InvocationError::Usage(_))),
            "Expected a usage error for {args:?}, got: {result:?}"
        );
    }

    #[test]
    fn addresses_take_the_rest() {
        let manifest = manifest();
        let Invocation { config, mode } = parse_ok(&["-e", &manifest, "-f", "-a", "100", "-v", "zz"]);
        assert_eq!(
            config,
            RunConfig {
                show_func: true,
                ..RunConfig::default()
            }
        );
        assert_eq!(
            mode,
            Mode::Addresses {
                module: PathBuf::from(&manifest),
                offsets: vec!["100".to_owned(), "-v".to_owned(), "zz".to_owned()],
            }
        );
    }

    #[test]
    fn flags_are_case_insensitive() {
        let manifest = manifest();
        let Invocation { config, mode } = parse_ok(&["-E", &manifest, "-V", "--LIST"]);
        assert!(config.verbose);
        assert_eq!(
            mode,
            Mode::List {
                module: PathBuf::from(&manifest)
            }
        );

        let Invocation { mode, .. } = parse_ok(&["-e", &manifest, "-S", "Foo", "-BAR"]);
        assert_eq!(
            mode,
            Mode::Symbols {
                module: PathBuf::from(&manifest),
                names: vec!["Foo".to_owned(), "-BAR".to_owned()],
                lookup: Lookup::Exact,
            }
        );
    }

    #[test]
    fn relative_module_is_made_absolute() {
        let Invocation { mode, .. } = parse_ok(&["-e", "Cargo.toml", "--lines"]);
        let Mode::Lines { module } = mode else {
            panic!("Expected line enumeration, got: {mode:?}");
        };
        assert!(module.is_absolute(), "Not absolute: {}", module.display());
        assert!(module.ends_with("Cargo.toml"));
    }

    #[test]
    fn symbol_lookups() {
        let manifest = manifest();
        let lookup = |flags: &[&str]| {
            let args: Vec<&str> = [&["-e", manifest.as_str()][..], flags, &["-s", "main"][..]].concat();
            parse_ok(&args)
        };

        let Invocation { config, mode } = lookup(&["--enum"]);
        assert!(config.external_enum);
        assert!(matches!(
            mode,
            Mode::Symbols {
                lookup: Lookup::Exact,
                ..
            }
        ));

        let Invocation { mode, .. } = lookup(&["--search"]);
        assert!(matches!(
            mode,
            Mode::Symbols {
                lookup: Lookup::Search {
                    include_private: false
                },
                ..
            }
        ));

        let Invocation { mode, .. } = lookup(&["--searchall"]);
        assert!(matches!(
            mode,
            Mode::Symbols {
                lookup: Lookup::Search {
                    include_private: true
                },
                ..
            }
        ));
    }

    #[test]
    fn batch_mode() {
        let Invocation { config, mode } = parse_ok(&["-F", "-q"]);
        assert!(config.show_func);
        assert_eq!(mode, Mode::Batch);
    }

    #[test]
    fn usage_errors() {
        let manifest = manifest();
        // No module and no batch mode.
        assert_usage(&[]);
        assert_usage(&["-a", "100"]);
        // Both a module and batch mode.
        assert_usage(&["-e", &manifest, "-q"]);
        // No mode.
        assert_usage(&["-e", &manifest]);
        assert_usage(&["-e", &manifest, "-f", "-v"]);
        // Missing values.
        assert_usage(&["-e"]);
        assert_usage(&["-e", &manifest, "-a"]);
        assert_usage(&["-e", &manifest, "-s"]);
        // Conflicting modes.
        assert_usage(&["-e", &manifest, "--list", "--lines"]);
        assert_usage(&["-q", "-a", "100"]);
        // Unknown flag.
        assert_usage(&["-e", &manifest, "--list", "--bogus"]);
    }

    #[test]
    fn repeated_flags() {
        let manifest = manifest();
        let Invocation { config, mode } =
            parse_ok(&["-v", "-V", "--enum", "--ENUM", "-e", &manifest, "--list", "--list"]);
        assert!(config.verbose);
        assert!(config.external_enum);
        assert_eq!(
            mode,
            Mode::List {
                module: PathBuf::from(&manifest)
            }
        );

        let Invocation { config, .. } = parse_ok(&["-f", "-F", "-e", &manifest, "-a", "1"]);
        assert!(config.show_func);

        // The last module wins.
        let Invocation { mode, .. } =
            parse_ok(&["-e", "/nonexistent/module.so", "-e", &manifest, "--lines"]);
        assert_eq!(
            mode,
            Mode::Lines {
                module: PathBuf::from(&manifest)
            }
        );
    }

    #[test]
    fn invalid_module_path() {
        let result = parse_strs(&["-e", "/nonexistent/module.so", "--list"]);
        let Err(err @ InvocationError::InvalidPath(_)) = result else {
            panic!("Expected an invalid path error, got: {result:?}");
        };
        assert_eq!(err.to_string(), "ERROR: invalid path /nonexistent/module.so");

        let result = parse_strs(&["-e", env!("CARGO_MANIFEST_DIR"), "--list"]);
        assert!(matches!(result, Err(InvocationError::InvalidPath(_))));
    }

    #[test]
    fn help() {
        assert!(matches!(
            parse_strs(&["--help"]),
            Err(InvocationError::Info(_))
        ));
        assert!(matches!(
            parse_strs(&["-H"]),
            Err(InvocationError::Info(_))
        ));
    }

    #[test]
    fn usage_text() {
        let usage = usage("symquery");
        assert!(usage.starts_with("Usage:\nLook up addresses for one module:\n  symquery -e <module>"));
        assert!(usage.contains("  symquery -e <module> [-v] --lines\n"));
        assert!(usage.ends_with("  -v = verbose\n  --enum = look up via external enum rather than a direct symbol lookup\n"));
    }
}
