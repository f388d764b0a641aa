//! Independent re-derivation of CLI metadata physical layout (§4.5 implementation note).
//!
//! `cilforge_metadata`'s structured reader exposes a table's row count and per-row fields and a
//! heap's per-entry lookups, but never a heap's or table's whole byte range inside the file — there
//! is nothing to take apart, because the reader never needed to remember where its own bytes came
//! from once decoded. Growing a table means re-deriving that layout the same way the reader itself
//! derives it: from the metadata root's stream directory (a small, fixed ECMA-335 structure) and
//! each present table's `len()`/`row_size()`, walked in ascending `TableKind` order exactly as
//! `TableHeap::try_from` walks the `valid` bitmask.

use cilforge_metadata::raw::heaps::table::{
    AssemblyTable, AssemblyRefTable, ClassLayoutTable, ConstantTable, CustomAttributeTable, EventMapTable, EventTable, FieldLayoutTable,
    FieldRVATable, FieldTable, FieldMarshalTable, GenericParamConstraintTable, GenericParamTable, ImplMapTable, InterfaceImplTable,
    ManifestResourceTable, MemberRefTable, MethodDefTable, MethodImplTable, MethodSemanticsTable, MethodSpecTable, ModuleRefTable, ModuleTable,
    NestedClassTable, ParamTable, PropertyMapTable, PropertyTable, StandAloneSigTable, Table, TableHeap, TableKind, TypeDefTable, TypeRefTable,
    TypeSpecTable,
};
use cilforge_metadata::structured::module::LoadedModule;

use crate::error::{ServerError, ServerResult};

/// Byte range, relative to the start of whatever region it was located within.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub offset: usize,
    pub size: usize,
}

/// One present table's row data, in the order it is physically written (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct TableSpan {
    pub kind: TableKind,
    pub row_count: usize,
    pub row_size: usize,
    /// Offset relative to the start of table row data (i.e. past the fixed header and row-count
    /// array), not relative to the "#~" stream itself.
    pub start: usize,
}

pub struct MetadataLayout {
    /// Absolute file offset of the metadata root (the CLI header's `metadata` directory, resolved
    /// through the section that contains it).
    pub root_file_offset: usize,
    pub root_declared_size: usize,
    pub strings: Span,
    pub blob: Span,
    pub guid: Span,
    pub user_strings: Option<Span>,
    /// "#~" stream span, relative to `root_file_offset`.
    pub tables_stream: Span,
    pub table_header_size: usize,
    pub table_spans: Vec<TableSpan>,
    pub heap_sizes_byte: u8,
    /// Every stream's name and original span, in the order the original stream directory declared
    /// them, so a rebuilt root reproduces the same directory shape with freshly computed offsets
    /// (§4.5 implementation note: growing one stream shifts every later one, so the directory is
    /// always regenerated wholesale rather than patched). The span is kept even for the five
    /// recognized streams' entries (unused there, since those get a freshly built body) so a
    /// stream this rewriter has no special handling for — `#-`, `#Pdb`, anything else ECMA-335
    /// doesn't name — can still be copied through byte-for-byte instead of dropped.
    pub stream_order: Vec<(String, Span)>,
}

impl MetadataLayout {
    pub fn table_span(&self, kind: TableKind) -> Option<TableSpan> {
        self.table_spans.iter().copied().find(|t| t.kind == kind)
    }

    pub fn row_count(&self, kind: TableKind) -> usize {
        self.table_span(kind).map(|t| t.row_count).unwrap_or(0)
    }

    /// Width the on-disk encoding already uses for a simple index into one of the four
    /// variable-width heaps. A heap under 64KiB uses a 2-byte index; at/above that it uses 4.
    pub fn heap_index_width(heap_size: usize) -> usize {
        if heap_size < 0x1_0000 {
            2
        } else {
            4
        }
    }

    /// Width a coded index into `max_row_count` rows (the largest participating table) already
    /// uses, given it reserves `tag_bits` low bits for the table tag (ECMA-335 §II.24.2.6).
    pub fn coded_index_width(max_row_count: usize, tag_bits: u32) -> usize {
        if (max_row_count << tag_bits) < 0x1_0000 {
            2
        } else {
            4
        }
    }
}

/// Walks every concrete row type the reader knows how to parse and records which are present.
/// Order matches `TableKind`'s declared order, which is also the physical write order (§4.5).
fn present_tables(heap: &TableHeap) -> Vec<(TableKind, usize, usize)> {
    macro_rules! probe {
        ($out:expr, $heap:expr, $( $table:ty ),+ $(,)?) => {
            $(
                if let Some(t) = $heap.get_table::<$table>() {
                    $out.push((t.kind(), t.len(), t.row_size()));
                }
            )+
        };
    }

    let mut out = Vec::new();
    probe!(
        out,
        heap,
        ModuleTable,
        TypeRefTable,
        TypeDefTable,
        FieldTable,
        MethodDefTable,
        ParamTable,
        InterfaceImplTable,
        MemberRefTable,
        ConstantTable,
        CustomAttributeTable,
        FieldMarshalTable,
        ClassLayoutTable,
        FieldLayoutTable,
        StandAloneSigTable,
        EventMapTable,
        EventTable,
        PropertyMapTable,
        PropertyTable,
        MethodSemanticsTable,
        MethodImplTable,
        ModuleRefTable,
        TypeSpecTable,
        ImplMapTable,
        FieldRVATable,
        AssemblyTable,
        AssemblyRefTable,
        ManifestResourceTable,
        NestedClassTable,
        GenericParamTable,
        MethodSpecTable,
        GenericParamConstraintTable,
    );
    out.sort_by_key(|(kind, ..)| *kind as u32);
    out
}

/// Re-parses the metadata root's stream directory (ECMA-335 §II.24.2.2) directly from `file_bytes`
/// — the one piece of layout the structured reader discards once it has built its typed heaps.
pub fn reconstruct(file_bytes: &[u8], module: &LoadedModule) -> ServerResult<MetadataLayout> {
    let assembly = module.assembly();
    let cli_header = assembly.cli_header();
    let pe = assembly.pe_file();

    let (section, section_data, idx) = pe
        .resolve_rva(cli_header.metadata.virtual_address)
        .ok_or_else(|| ServerError::RewriteInternal("CLI metadata directory RVA does not resolve to a section".into()))?;
    let root_file_offset = section.header.pointer_to_raw_data as usize + idx;
    let root = &file_bytes[root_file_offset..];

    if root.len() < 20 || &root[0..4] != [0x42, 0x53, 0x4a, 0x42] {
        return Err(ServerError::RewriteInternal("metadata root signature mismatch".into()));
    }
    let version_len = u32::from_le_bytes(root[12..16].try_into().unwrap()) as usize;
    let mut pos = 16 + version_len;
    pos += 2; // flags
    let stream_count = u16::from_le_bytes(root[pos..pos + 2].try_into().unwrap()) as usize;
    pos += 2;

    let mut streams: Vec<(&str, Span)> = Vec::with_capacity(stream_count);
    for _ in 0..stream_count {
        let offset = u32::from_le_bytes(root[pos..pos + 4].try_into().unwrap()) as usize;
        let size = u32::from_le_bytes(root[pos + 4..pos + 8].try_into().unwrap()) as usize;
        pos += 8;
        let name_start = pos;
        let name_end = root[name_start..].iter().position(|&b| b == 0).map(|p| name_start + p).unwrap_or(name_start);
        let name = std::str::from_utf8(&root[name_start..name_end]).unwrap_or("");
        pos = (name_end + 1 + 3) & !3; // nul-terminated, padded to a 4-byte boundary
        streams.push((name, Span { offset, size }));
    }

    let find = |name: &str| streams.iter().find(|(n, _)| *n == name).map(|(_, s)| *s);
    let strings = find("#Strings").ok_or_else(|| ServerError::RewriteInternal("module has no #Strings heap".into()))?;
    let blob = find("#Blob").unwrap_or(Span { offset: 0, size: 0 });
    let guid = find("#GUID").unwrap_or(Span { offset: 0, size: 0 });
    let user_strings = find("#US");
    let tables_stream = find("#~").ok_or_else(|| ServerError::RewriteInternal("module has no #~ stream".into()))?;

    let heap = assembly
        .metadata_root()
        .get_heap::<TableHeap>()
        .ok_or_else(|| ServerError::RewriteInternal("module has no parsed #~ heap".into()))?;
    let tables = present_tables(heap);

    let table_header_size = 24 + 4 * tables.len();
    let mut table_spans = Vec::with_capacity(tables.len());
    let mut cursor = table_header_size;
    for (kind, row_count, row_size) in tables {
        table_spans.push(TableSpan { kind, row_count, row_size, start: cursor });
        cursor += row_count * row_size;
    }

    let mut heap_sizes_byte = 0u8;
    if MetadataLayout::heap_index_width(strings.size) == 4 {
        heap_sizes_byte |= 0x01;
    }
    if MetadataLayout::heap_index_width(guid.size) == 4 {
        heap_sizes_byte |= 0x02;
    }
    if MetadataLayout::heap_index_width(blob.size) == 4 {
        heap_sizes_byte |= 0x04;
    }

    let stream_order = streams.iter().map(|(n, s)| (n.to_string(), *s)).collect();

    Ok(MetadataLayout {
        root_file_offset,
        root_declared_size: cli_header.metadata.size as usize,
        strings,
        blob,
        guid,
        user_strings,
        tables_stream,
        table_header_size,
        table_spans,
        heap_sizes_byte,
        stream_order,
    })
}

/// Absolute file offset of a CLI `DataDirectory`'s `size` field (the one field this module ever
/// needs to patch in place once metadata growth is written into existing section padding).
pub fn metadata_directory_size_field_offset(module: &LoadedModule) -> ServerResult<usize> {
    let assembly = module.assembly();
    let pe = assembly.pe_file();

    let com_descriptor_rva = cli_directory_rva(pe)?;
    let (section, _, idx) = pe
        .resolve_rva(com_descriptor_rva)
        .ok_or_else(|| ServerError::RewriteInternal("CLI header RVA does not resolve to a section".into()))?;
    // CLIHeader layout: SizeInBytes(4) MajorRuntimeVersion(2) MinorRuntimeVersion(2)
    // MetaData{VirtualAddress(4) Size(4)} ... — the Size field starts at offset 8 + 4 = 12.
    Ok(section.header.pointer_to_raw_data as usize + idx + 12)
}

fn cli_directory_rva(pe: &cilforge_metadata::raw::pe::PEFile) -> ServerResult<u32> {
    use cilforge_metadata::raw::pe::ImageOptionalHeader;
    const COM_DESCRIPTOR_DIRECTORY: usize = 14;
    let directories = match &pe.pe_header.image_optional_header {
        ImageOptionalHeader::PE32(h) => &h.data_directories,
        ImageOptionalHeader::PE64(h) => &h.data_directories,
        ImageOptionalHeader::None => return Err(ServerError::RewriteInternal("module has no optional header".into())),
    };
    directories
        .get(COM_DESCRIPTOR_DIRECTORY)
        .map(|d| d.virtual_address)
        .filter(|rva| *rva != 0)
        .ok_or_else(|| ServerError::RewriteInternal("module has no CLI header data directory".into()))
}
