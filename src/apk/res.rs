//! Binary resource chunk layout shared by the manifest editors.
//!
//! Only the chunk kinds the editors touch are decoded: the string pool, the
//! XML resource map and the fixed part of start elements. Everything else is
//! carried as bytes.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Table = 0x0002,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            ty if ty == ChunkType::Null as u16 => ChunkType::Null,
            ty if ty == ChunkType::StringPool as u16 => ChunkType::StringPool,
            ty if ty == ChunkType::Table as u16 => ChunkType::Table,
            ty if ty == ChunkType::Xml as u16 => ChunkType::Xml,
            ty if ty == ChunkType::XmlStartNamespace as u16 => ChunkType::XmlStartNamespace,
            ty if ty == ChunkType::XmlEndNamespace as u16 => ChunkType::XmlEndNamespace,
            ty if ty == ChunkType::XmlStartElement as u16 => ChunkType::XmlStartElement,
            ty if ty == ChunkType::XmlEndElement as u16 => ChunkType::XmlEndElement,
            ty if ty == ChunkType::XmlCdata as u16 => ChunkType::XmlCdata,
            ty if ty == ChunkType::XmlResourceMap as u16 => ChunkType::XmlResourceMap,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResChunkHeader {
    /// Type identifier for this chunk. The meaning of this value depends
    /// on the containing chunk.
    pub ty: u16,
    /// Size of the chunk header (in bytes). Adding this value to the address
    /// of the chunk allows you to find its associated data (if any).
    pub header_size: u16,
    /// Total size of this chunk (in bytes). This is the header_size plus the
    /// size of any data associated with the chunk.
    pub size: u32,
}

impl ResChunkHeader {
    pub const SIZE: usize = 8;

    pub fn read(r: &mut impl ReadBytesExt) -> Result<Self> {
        let ty = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            ty,
            header_size,
            size,
        })
    }

    pub fn write(&self, w: &mut impl WriteBytesExt) -> Result<()> {
        w.write_u16::<LittleEndian>(self.ty)?;
        w.write_u16::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResStringPoolHeader {
    pub string_count: u32,
    pub style_count: u32,
    pub flags: u32,
    pub strings_start: u32,
    pub styles_start: u32,
}

impl ResStringPoolHeader {
    pub const SORTED_FLAG: u32 = 1 << 0;
    pub const UTF8_FLAG: u32 = 1 << 8;
    /// Chunk header plus the five fields above.
    pub const CHUNK_HEADER_SIZE: u16 = 28;

    pub fn read(r: &mut impl ReadBytesExt) -> Result<Self> {
        let string_count = r.read_u32::<LittleEndian>()?;
        let style_count = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let strings_start = r.read_u32::<LittleEndian>()?;
        let styles_start = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            string_count,
            style_count,
            flags,
            strings_start,
            styles_start,
        })
    }

    pub fn write(&self, w: &mut impl WriteBytesExt) -> Result<()> {
        w.write_u32::<LittleEndian>(self.string_count)?;
        w.write_u32::<LittleEndian>(self.style_count)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.strings_start)?;
        w.write_u32::<LittleEndian>(self.styles_start)?;
        Ok(())
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & Self::UTF8_FLAG > 0
    }
}

/// A length field in front of a pooled string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LenField {
    /// Offset of the field inside the pool chunk.
    pub at: usize,
    /// Two-unit form (high bit set in the first unit).
    pub wide: bool,
}

/// Location of one string inside a pool chunk, as needed for in-place edits.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StringCell {
    pub value: String,
    /// UTF-8 pools: character count then byte count. UTF-16 pools: unit count.
    pub len_fields: Vec<LenField>,
    /// Offset of the encoded string data inside the pool chunk.
    pub data: usize,
    /// Encoded length of the data, terminator excluded.
    pub byte_len: usize,
}

/// Decodes header and string locations of the pool chunk in `chunk`.
pub fn read_string_cells(chunk: &[u8]) -> Result<(ResStringPoolHeader, Vec<StringCell>)> {
    let mut r = Cursor::new(chunk);
    let header = ResChunkHeader::read(&mut r)?;
    anyhow::ensure!(
        header.ty == ChunkType::StringPool as u16,
        "expected string pool, found chunk 0x{:04x}",
        header.ty
    );
    anyhow::ensure!(
        header.size as usize <= chunk.len(),
        "string pool claims {} bytes, only {} available",
        header.size,
        chunk.len()
    );
    let pool = ResStringPoolHeader::read(&mut r)?;
    r.seek(SeekFrom::Start(header.header_size as u64))?;
    let mut offsets = Vec::with_capacity((pool.string_count as usize).min(chunk.len() / 4));
    for _ in 0..pool.string_count {
        offsets.push(r.read_u32::<LittleEndian>()?);
    }
    let strings_start = pool.strings_start as usize;
    let mut cells = Vec::with_capacity(offsets.len());
    for offset in offsets {
        let pos = strings_start + offset as usize;
        let cell = if pool.is_utf8() {
            read_utf8_cell(chunk, pos)
        } else {
            read_utf16_cell(chunk, pos)
        }
        .with_context(|| format!("While reading pooled string at 0x{:x}", pos))?;
        cells.push(cell);
    }
    Ok((pool, cells))
}

fn read_utf8_len(chunk: &[u8], at: usize) -> Result<(usize, LenField, usize)> {
    let first = *chunk.get(at).context("length out of bounds")? as usize;
    if first & 0x80 != 0 {
        let second = *chunk.get(at + 1).context("length out of bounds")? as usize;
        Ok((((first & 0x7f) << 8) | second, LenField { at, wide: true }, at + 2))
    } else {
        Ok((first, LenField { at, wide: false }, at + 1))
    }
}

fn read_utf8_cell(chunk: &[u8], pos: usize) -> Result<StringCell> {
    let (_chars, chars_field, next) = read_utf8_len(chunk, pos)?;
    let (byte_len, bytes_field, data) = read_utf8_len(chunk, next)?;
    let bytes = chunk
        .get(data..data + byte_len)
        .context("string data out of bounds")?;
    let value = String::from_utf8(bytes.to_vec()).context("invalid UTF-8 in string pool")?;
    Ok(StringCell {
        value,
        len_fields: vec![chars_field, bytes_field],
        data,
        byte_len,
    })
}

fn read_u16_at(chunk: &[u8], at: usize) -> Result<u16> {
    let bytes = chunk.get(at..at + 2).context("read out of bounds")?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_utf16_cell(chunk: &[u8], pos: usize) -> Result<StringCell> {
    let first = read_u16_at(chunk, pos)? as usize;
    let (units, field, data) = if first & 0x8000 != 0 {
        let second = read_u16_at(chunk, pos + 2)? as usize;
        (((first & 0x7fff) << 16) | second, LenField { at: pos, wide: true }, pos + 4)
    } else {
        (first, LenField { at: pos, wide: false }, pos + 2)
    };
    let byte_len = units * 2;
    let bytes = chunk
        .get(data..data + byte_len)
        .context("string data out of bounds")?;
    let code_units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let value = String::from_utf16(&code_units).context("invalid UTF-16 in string pool")?;
    Ok(StringCell {
        value,
        len_fields: vec![field],
        data,
        byte_len,
    })
}

/// Overwrites the string stored in `cell` without moving anything.
///
/// The replacement must encode to at most the cell's byte length. Length
/// fields keep their width; the freed tail is zero-filled. Returns `false` and
/// leaves `chunk` untouched when the replacement does not fit.
pub fn rewrite_cell(chunk: &mut [u8], cell: &StringCell, utf8: bool, value: &str) -> bool {
    let encoded = encode_plain(value, utf8);
    if encoded.len() > cell.byte_len || cell.data + cell.byte_len > chunk.len() {
        return false;
    }
    let units = value.encode_utf16().count();
    let lens: Vec<usize> = if utf8 {
        vec![units, encoded.len()]
    } else {
        vec![units]
    };
    if lens
        .iter()
        .zip(&cell.len_fields)
        .any(|(len, field)| !len_fits(*len, field.wide, utf8))
    {
        return false;
    }
    for (len, field) in lens.into_iter().zip(&cell.len_fields) {
        write_len_in_place(chunk, *field, len, utf8);
    }
    chunk[cell.data..cell.data + encoded.len()].copy_from_slice(&encoded);
    chunk[cell.data + encoded.len()..cell.data + cell.byte_len].fill(0);
    true
}

fn len_fits(len: usize, wide: bool, utf8: bool) -> bool {
    match (utf8, wide) {
        (true, false) => len <= 0x7f,
        (true, true) => len <= 0x7fff,
        (false, false) => len <= 0x7fff,
        (false, true) => len <= 0x7fff_ffff,
    }
}

fn write_len_in_place(chunk: &mut [u8], field: LenField, len: usize, utf8: bool) {
    let at = field.at;
    match (utf8, field.wide) {
        (true, false) => chunk[at] = len as u8,
        (true, true) => {
            chunk[at] = 0x80 | ((len >> 8) as u8 & 0x7f);
            chunk[at + 1] = len as u8;
        }
        (false, false) => chunk[at..at + 2].copy_from_slice(&(len as u16).to_le_bytes()),
        (false, true) => {
            let high = 0x8000 | ((len >> 16) as u16 & 0x7fff);
            chunk[at..at + 2].copy_from_slice(&high.to_le_bytes());
            chunk[at + 2..at + 4].copy_from_slice(&(len as u16).to_le_bytes());
        }
    }
}

/// String bytes without length prefix or terminator.
pub fn encode_plain(value: &str, utf8: bool) -> Vec<u8> {
    if utf8 {
        value.as_bytes().to_vec()
    } else {
        value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
    }
}

/// A decoded string pool that can be grown and serialized again.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StringPool {
    pub flags: u32,
    pub strings: Vec<String>,
    /// Style offsets, relative to the start of `styles`.
    pub style_offsets: Vec<u32>,
    /// Raw style span data.
    pub styles: Vec<u8>,
}

impl StringPool {
    pub fn read(chunk: &[u8]) -> Result<Self> {
        let (header, cells) = read_string_cells(chunk)?;
        let mut r = Cursor::new(chunk);
        let chunk_header = ResChunkHeader::read(&mut r)?;
        r.seek(SeekFrom::Start(
            chunk_header.header_size as u64 + header.string_count as u64 * 4,
        ))?;
        let mut style_offsets =
            Vec::with_capacity((header.style_count as usize).min(chunk.len() / 4));
        for _ in 0..header.style_count {
            style_offsets.push(r.read_u32::<LittleEndian>()?);
        }
        let styles = if header.style_count > 0 && header.styles_start > 0 {
            chunk
                .get(header.styles_start as usize..chunk_header.size as usize)
                .context("style data out of bounds")?
                .to_vec()
        } else {
            vec![]
        };
        Ok(Self {
            flags: header.flags,
            strings: cells.into_iter().map(|cell| cell.value).collect(),
            style_offsets,
            styles,
        })
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & ResStringPoolHeader::UTF8_FLAG > 0
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.strings.iter().position(|s| s == value).map(|i| i as u32)
    }

    /// Index of `value`, appending it when absent. Existing indices never move.
    pub fn get_or_insert(&mut self, value: &str) -> u32 {
        if let Some(index) = self.index_of(value) {
            return index;
        }
        self.strings.push(value.to_string());
        (self.strings.len() - 1) as u32
    }

    /// Serializes the pool from scratch: offsets, counts and sizes are all
    /// recomputed. The sorted flag is cleared since appended strings break
    /// any ordering.
    pub fn write(&self, w: &mut Vec<u8>) -> Result<()> {
        let utf8 = self.is_utf8();
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for string in &self.strings {
            offsets.push(data.len() as u32);
            if utf8 {
                write_utf8_string(&mut data, string)?;
            } else {
                write_utf16_string(&mut data, string)?;
            }
        }
        while data.len() % 4 != 0 {
            data.push(0);
        }
        let index_count = self.strings.len() + self.style_offsets.len();
        let strings_start = ResStringPoolHeader::CHUNK_HEADER_SIZE as usize + index_count * 4;
        let styles_start = if self.style_offsets.is_empty() {
            0
        } else {
            strings_start + data.len()
        };
        let size = strings_start + data.len() + self.styles.len();
        ResChunkHeader {
            ty: ChunkType::StringPool as u16,
            header_size: ResStringPoolHeader::CHUNK_HEADER_SIZE,
            size: size as u32,
        }
        .write(w)?;
        ResStringPoolHeader {
            string_count: self.strings.len() as u32,
            style_count: self.style_offsets.len() as u32,
            flags: self.flags & !ResStringPoolHeader::SORTED_FLAG,
            strings_start: strings_start as u32,
            styles_start: styles_start as u32,
        }
        .write(w)?;
        for offset in offsets {
            w.write_u32::<LittleEndian>(offset)?;
        }
        for offset in &self.style_offsets {
            w.write_u32::<LittleEndian>(*offset)?;
        }
        w.extend_from_slice(&data);
        w.extend_from_slice(&self.styles);
        Ok(())
    }
}

fn write_utf8_len(w: &mut Vec<u8>, len: usize) -> Result<()> {
    anyhow::ensure!(len <= 0x7fff, "string too long for UTF-8 pool: {}", len);
    if len > 0x7f {
        w.push(0x80 | (len >> 8) as u8);
        w.push(len as u8);
    } else {
        w.push(len as u8);
    }
    Ok(())
}

fn write_utf8_string(w: &mut Vec<u8>, s: &str) -> Result<()> {
    write_utf8_len(w, s.encode_utf16().count())?;
    write_utf8_len(w, s.len())?;
    w.extend_from_slice(s.as_bytes());
    w.push(0);
    Ok(())
}

fn write_utf16_string(w: &mut Vec<u8>, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len();
    anyhow::ensure!(len <= 0x7fff_ffff, "string too long for UTF-16 pool: {}", len);
    if len > 0x7fff {
        w.write_u16::<LittleEndian>(0x8000 | (len >> 16) as u16)?;
        w.write_u16::<LittleEndian>(len as u16)?;
    } else {
        w.write_u16::<LittleEndian>(len as u16)?;
    }
    for unit in units {
        w.write_u16::<LittleEndian>(unit)?;
    }
    w.write_u16::<LittleEndian>(0)?;
    Ok(())
}

/// Reads the resource id array of an XML resource map chunk.
pub fn read_resource_map(chunk: &[u8]) -> Result<Vec<u32>> {
    let mut r = Cursor::new(chunk);
    let header = ResChunkHeader::read(&mut r)?;
    anyhow::ensure!(
        header.ty == ChunkType::XmlResourceMap as u16,
        "expected resource map, found chunk 0x{:04x}",
        header.ty
    );
    anyhow::ensure!(header.size as usize <= chunk.len(), "resource map truncated");
    r.seek(SeekFrom::Start(header.header_size as u64))?;
    let count = (header.size as usize).saturating_sub(header.header_size as usize) / 4;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(r.read_u32::<LittleEndian>()?);
    }
    Ok(ids)
}

pub fn write_resource_map(ids: &[u32], w: &mut Vec<u8>) -> Result<()> {
    ResChunkHeader {
        ty: ChunkType::XmlResourceMap as u16,
        header_size: ResChunkHeader::SIZE as u16,
        size: (ResChunkHeader::SIZE + ids.len() * 4) as u32,
    }
    .write(w)?;
    for id in ids {
        w.write_u32::<LittleEndian>(*id)?;
    }
    Ok(())
}

/// Position of one chunk inside an XML document.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChunkSpan {
    pub ty: u16,
    pub offset: usize,
    pub size: usize,
}

impl ChunkSpan {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

/// Splits a binary XML document into its top-level chunks, returning the file
/// header size alongside.
pub fn xml_chunks(data: &[u8]) -> Result<(u16, Vec<ChunkSpan>)> {
    let mut r = Cursor::new(data);
    let header = ResChunkHeader::read(&mut r).context("binary XML header truncated")?;
    anyhow::ensure!(
        header.ty == ChunkType::Xml as u16,
        "not a binary XML document (type 0x{:04x})",
        header.ty
    );
    let end = (header.size as usize).min(data.len());
    let mut offset = header.header_size as usize;
    let mut spans = vec![];
    while offset + ResChunkHeader::SIZE <= end {
        r.seek(SeekFrom::Start(offset as u64))?;
        let chunk = ResChunkHeader::read(&mut r)?;
        let size = chunk.size as usize;
        anyhow::ensure!(
            size >= ResChunkHeader::SIZE && offset + size <= end,
            "chunk 0x{:04x} at 0x{:x} has invalid size {}",
            chunk.ty,
            offset,
            size
        );
        spans.push(ChunkSpan {
            ty: chunk.ty,
            offset,
            size,
        });
        offset += size;
    }
    Ok((header.header_size, spans))
}

/// Android framework attribute ids (`android:*`).
pub mod attr {
    pub const NAME: u32 = 0x0101_0003;
    pub const VERSION_CODE: u32 = 0x0101_021b;
    pub const VERSION_NAME: u32 = 0x0101_021c;
    pub const TEST_ONLY: u32 = 0x0101_0272;
}

/// `Res_value` data types the editors care about.
pub mod value_type {
    pub const STRING: u8 = 0x03;
    pub const INT_DEC: u8 = 0x10;
    pub const INT_BOOLEAN: u8 = 0x12;
}

// Start element chunk layout: 8 byte chunk header, line number (u32) and
// comment index (u32), then the element extension.
/// Offset of the element extension (`ns`, `name`, attribute table info).
const ELEMENT_EXT: usize = 16;
/// Element name string index.
const ELEMENT_NAME: usize = ELEMENT_EXT + 4;
/// `attributeStart`, relative to the element extension.
const ELEMENT_ATTR_START: usize = ELEMENT_EXT + 8;
/// `attributeSize`, bytes per attribute record.
const ELEMENT_ATTR_SIZE: usize = ELEMENT_EXT + 10;
/// `attributeCount`.
const ELEMENT_ATTR_COUNT: usize = ELEMENT_EXT + 12;
/// Smallest valid start element: header plus the 20 byte extension.
const ELEMENT_MIN_SIZE: usize = ELEMENT_EXT + 20;

// Attribute record layout.
/// Attribute name string index.
const ATTR_NAME: usize = 4;
/// Raw (string) value index, or -1.
const ATTR_RAW_VALUE: usize = 8;
/// `Res_value.dataType`.
const ATTR_VALUE_TYPE: usize = 15;
/// `Res_value.data`.
const ATTR_VALUE_DATA: usize = 16;
/// Size of one attribute record.
const ATTR_MIN_SIZE: usize = 20;

/// One attribute of a start element, located inside the element's chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Attribute {
    /// Offset of the attribute record inside the chunk.
    pub offset: usize,
    pub name: u32,
    pub raw_value: u32,
    pub value_type: u8,
    pub data: u32,
}

/// Fixed part of a start element chunk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartElement {
    pub name: u32,
    pub attributes: Vec<Attribute>,
}

impl StartElement {
    /// Decodes the start element at the beginning of `chunk`, checking that
    /// the attribute table lies within the chunk.
    pub fn parse(chunk: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(chunk);
        let header = ResChunkHeader::read(&mut r)?;
        anyhow::ensure!(
            header.ty == ChunkType::XmlStartElement as u16,
            "expected start element, found chunk 0x{:04x}",
            header.ty
        );
        anyhow::ensure!(
            header.header_size as usize == ELEMENT_EXT
                && chunk.len() >= ELEMENT_MIN_SIZE
                && header.size as usize <= chunk.len(),
            "malformed start element"
        );
        let u16_at = |at: usize| u16::from_le_bytes([chunk[at], chunk[at + 1]]) as usize;
        let u32_at = |at: usize| {
            u32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
        };
        let name = u32_at(ELEMENT_NAME);
        let attr_base = ELEMENT_EXT + u16_at(ELEMENT_ATTR_START);
        let attr_size = u16_at(ELEMENT_ATTR_SIZE);
        let attr_count = u16_at(ELEMENT_ATTR_COUNT);
        anyhow::ensure!(
            attr_count == 0 || attr_size >= ATTR_MIN_SIZE,
            "attribute records of {} bytes are too small",
            attr_size
        );
        anyhow::ensure!(
            attr_base + attr_size * attr_count <= header.size as usize,
            "attribute table exceeds start element"
        );
        let attributes = (0..attr_count)
            .map(|i| {
                let offset = attr_base + i * attr_size;
                Attribute {
                    offset,
                    name: u32_at(offset + ATTR_NAME),
                    raw_value: u32_at(offset + ATTR_RAW_VALUE),
                    value_type: chunk[offset + ATTR_VALUE_TYPE],
                    data: u32_at(offset + ATTR_VALUE_DATA),
                }
            })
            .collect();
        Ok(Self { name, attributes })
    }
}

/// Points a string attribute at pool index `index`, rewriting both the raw
/// value and the typed value.
pub fn set_string_attribute(chunk: &mut [u8], attr: &Attribute, index: u32) {
    chunk[attr.offset + ATTR_RAW_VALUE..attr.offset + ATTR_RAW_VALUE + 4]
        .copy_from_slice(&index.to_le_bytes());
    chunk[attr.offset + ATTR_VALUE_DATA..attr.offset + ATTR_VALUE_DATA + 4]
        .copy_from_slice(&index.to_le_bytes());
}

/// Overwrites the typed value data of an attribute.
pub fn set_attribute_data(chunk: &mut [u8], attr: &Attribute, data: u32) {
    chunk[attr.offset + ATTR_VALUE_DATA..attr.offset + ATTR_VALUE_DATA + 4]
        .copy_from_slice(&data.to_le_bytes());
}
