//! DWARF line tables.

use std::{
    collections::HashMap,
    io::Read as _,
    num::NonZeroU64,
    path::PathBuf,
    rc::Rc,
};

use flate2::read::ZlibDecoder;
use gimli::RunTimeEndian;
use goblin::{
    container::{Container, Ctx, Endian},
    elf::{
        compression_header::{CompressionHeader, ELFCOMPRESS_ZLIB},
        section_header, Elf,
    },
};
use tracing::debug;

use super::{LineInfo, LineLocation, LineVisitor};

type Reader = gimli::EndianRcSlice<RunTimeEndian>;

/// Line information of a single module.
///
/// Section data is kept in reference counted buffers, so the table does not borrow the module
/// bytes.
pub struct LineTable {
    endian: RunTimeEndian,
    sections: HashMap<String, Rc<[u8]>>,
    context: addr2line::Context<Reader>,
}

impl LineTable {
    /// Collects the `.debug_*` sections of an ELF, inflating compressed ones.  Returns `None` if
    /// there is no `.debug_line` content to work with, or if a debug section can not be read.
    pub fn from_elf(bytes: &[u8], elf: &Elf) -> Option<Self> {
        let ctx = Ctx::new(
            if elf.is_64 {
                Container::Big
            } else {
                Container::Little
            },
            if elf.little_endian {
                Endian::Little
            } else {
                Endian::Big
            },
        );

        let mut sections: HashMap<String, Rc<[u8]>> = HashMap::new();
        for header in &elf.section_headers {
            if header.sh_type == section_header::SHT_NOBITS {
                continue;
            }
            let Some(name) = elf.shdr_strtab.get_at(header.sh_name) else {
                continue;
            };
            if !name.starts_with(".debug_") {
                continue;
            }
            let Some(data) = header.file_range().and_then(|range| bytes.get(range)) else {
                continue;
            };

            let data: Rc<[u8]> =
                if header.sh_flags & u64::from(section_header::SHF_COMPRESSED) != 0 {
                    // Line lookups need all of the sections, so one we can not read makes the
                    // rest useless.
                    let Some(inflated) = inflate(data, ctx) else {
                        debug!("Ignoring line information: unable to inflate {name}");
                        return None;
                    };
                    Rc::from(inflated)
                } else {
                    Rc::from(data)
                };
            sections.insert(name.to_owned(), data);
        }

        if sections.get(".debug_line").map_or(true, |data| data.is_empty()) {
            return None;
        }

        let endian = if elf.little_endian {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let dwarf = load_dwarf(endian, &sections).ok()?;
        let context = match addr2line::Context::from_dwarf(dwarf) {
            Ok(context) => context,
            Err(err) => {
                debug!("Ignoring unusable DWARF: {err}");
                return None;
            }
        };

        Some(Self {
            endian,
            sections,
            context,
        })
    }

    /// Finds the line containing the `probe` virtual address.
    pub fn locate(&self, probe: u64) -> Option<LineLocation> {
        let mut ranges = match self.context.find_location_range(probe, probe.saturating_add(1)) {
            Ok(ranges) => ranges,
            Err(err) => {
                debug!("Line lookup at 0x{probe:x} failed: {err}");
                return None;
            }
        };
        let (start, _len, location) =
            ranges.find(|(start, len, _)| *start <= probe && probe - start < *len)?;
        let line = location.line?;

        Some(LineLocation {
            file: location.file.map(str::to_owned),
            line: u64::from(line),
            offset: probe - start,
        })
    }

    /// Walks the line program of every compilation unit.  Row addresses are reported relative to
    /// `base`.
    ///
    /// Returns `Ok(())` both when all the rows have been visited and when `visit` asked to stop.
    pub fn for_each_row(&self, base: u64, visit: &mut LineVisitor<'_>) -> Result<(), gimli::Error> {
        let dwarf = load_dwarf(self.endian, &self.sections)?;

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let cu = unit.name.as_ref().map(reader_to_string).transpose()?;
            let Some(program) = unit.line_program.clone() else {
                continue;
            };

            let mut rows = program.rows();
            while let Some((header, row)) = rows.next_row()? {
                if row.end_sequence() {
                    continue;
                }
                let file = match row.file(header) {
                    Some(entry) => Some(file_path(&dwarf, &unit, header, entry)?),
                    None => None,
                };
                let info = LineInfo {
                    cu: cu.clone(),
                    file,
                    line: row.line().map_or(0, NonZeroU64::get),
                    addr: row.address().wrapping_sub(base),
                };
                if !visit(&info) {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

fn load_dwarf(
    endian: RunTimeEndian,
    sections: &HashMap<String, Rc<[u8]>>,
) -> Result<gimli::Dwarf<Reader>, gimli::Error> {
    gimli::Dwarf::load(|id| -> Result<Reader, gimli::Error> {
        let data = sections
            .get(id.name())
            .cloned()
            .unwrap_or_else(|| Rc::from(&[][..]));
        Ok(gimli::EndianRcSlice::new(data, endian))
    })
}

fn reader_to_string(value: &Reader) -> Result<String, gimli::Error> {
    Ok(gimli::Reader::to_string_lossy(value)?.into_owned())
}

/// Inflates the content of an `SHF_COMPRESSED` section.  Only zlib is supported.
fn inflate(data: &[u8], ctx: Ctx) -> Option<Vec<u8>> {
    let header = CompressionHeader::parse(data, 0, ctx).ok()?;
    if header.ch_type != ELFCOMPRESS_ZLIB {
        debug!("Unsupported section compression: {}", header.ch_type);
        return None;
    }
    let compressed = data.get(CompressionHeader::size(ctx)..)?;

    let mut inflated = Vec::new();
    if let Err(err) = ZlibDecoder::new(compressed).read_to_end(&mut inflated) {
        debug!("Corrupted compressed section: {err}");
        return None;
    }
    if u64::try_from(inflated.len()).ok() != Some(header.ch_size) {
        debug!(
            "Compressed section inflated to {} bytes, expected {}",
            inflated.len(),
            header.ch_size
        );
        return None;
    }
    Some(inflated)
}

/// Full path of a line table file entry.
fn file_path(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    header: &gimli::LineProgramHeader<Reader>,
    entry: &gimli::FileEntry<Reader>,
) -> Result<String, gimli::Error> {
    let name = reader_to_string(&dwarf.attr_string(unit, entry.path_name())?)?;
    let directory = match entry.directory(header) {
        Some(directory) => Some(reader_to_string(&dwarf.attr_string(unit, directory)?)?),
        None => None,
    };
    let comp_dir = unit.comp_dir.as_ref().map(reader_to_string).transpose()?;
    Ok(join_file_path(
        comp_dir.as_deref(),
        directory.as_deref(),
        &name,
    ))
}

/// Relative names are joined with their include directory, and relative include directories
/// with the compilation directory.
fn join_file_path(comp_dir: Option<&str>, directory: Option<&str>, name: &str) -> String {
    let mut path = PathBuf::new();
    // `push` replaces the path when given an absolute one.
    path.extend(comp_dir);
    path.extend(directory);
    path.push(name);
    path.to_string_lossy().into_owned()
}
