//! Weaving tar blocks through HTML, and reading them back.
//!
//! The layout trick: every pax extension header starts with a NUL byte, and
//! the bytes between that NUL and the numeric fields at offset 100 are
//! literal HTML. A tar reader sees fixed-width fields; a browser sees an
//! opening `<template class="wah_polyglot_data" data-a="` whose attribute
//! value swallows the numeric fields. The following file header carries the
//! entry name (doubling as the `data-wahtml_id` attribute value) and closes
//! the tag at the end of its prefix field, so the base64 payload that
//! follows is ordinary element text to the browser and ordinary entry data
//! to tar. Padding to the 512 boundary is NUL runs, which both parsers
//! tolerate.
//!
//! The logical tar ends with a sentinel pair of extension headers. The
//! second one opens an HTML comment so that whatever trails the archive is
//! invisible to the browser and unreachable for readers that honour the
//! sentinel.

use thiserror::Error;

use crate::base64;
use crate::tar::{
    align, AttributeSafeName, EntryAttributes, TarError, TarHeader, BLOCK, NAME_LEN,
    TYPE_EXTENSION, TYPE_EXTERNAL,
};

/// Opens a data template when no template is currently open.
const START_NAME: &[u8] = b"\0<template class=\"wah_polyglot_data\" data-a=\"";
/// Closes the open template, then opens the next data template.
const CONT_NAME: &[u8] = b"\0</template><template class=\"wah_polyglot_data\" data-a=\"";
/// Introduces the file-name attribute at the end of the extension header.
const ID_INTRO: &[u8] = b"\" data-wahtml_id=\"";
/// Introduces the header-tail attribute after the file name.
const DATA_B_INTRO: &[u8] = b"\" data-b=\"";
/// Closes the header-tail attribute and the template's start tag.
const DATA_START: &[u8] = b"\">";

/// First sentinel header: closes the last data template.
const SENTINEL_NAME: &[u8] = b"\0</template><template class=\"wah_polyglot_end\" data-a=\"";
/// Second sentinel header: closes the end template and opens a comment.
const SENTINEL_TAIL_NAME: &[u8] = b"\0</template><!--";

/// Longest file name that still leaves room for the `data-b` introducer
/// inside the name field. Longer names travel as a pax `path` record.
pub const INLINE_NAME_MAX: usize = NAME_LEN - 1 - DATA_B_INTRO.len();

/// The pax comment keyword that turns the skipped prefix into one record.
const COMMENT_INTRO: &[u8] = b" comment=\">";

#[derive(Debug, Error)]
pub enum EscapeError {
    #[error(transparent)]
    Tar(#[from] TarError),

    #[error("this does not look like a polyglot tar region")]
    NotAnEscape,

    #[error("the escape structure ends in an unexpected way")]
    UnexpectedEscape,

    #[error("decoded payload is {actual} bytes but the header declares {declared}")]
    PayloadSizeMismatch { declared: u64, actual: u64 },

    #[error("leading escape head must be exactly {NAME_LEN} bytes ending in an open attribute")]
    BadLeadingHead,

    #[error("external reference URL longer than {} bytes", NAME_LEN - 1)]
    ReferenceTooLong,
}

/// An inline file to embed.
pub struct Entry<'a> {
    pub name: AttributeSafeName<'a>,
    /// Raw bytes; the engine base64-encodes them.
    pub data: &'a [u8],
    pub attributes: EntryAttributes<'a>,
}

/// A file whose bytes live behind a URL, fetched at load time.
pub struct External<'a> {
    pub name: AttributeSafeName<'a>,
    /// Expected byte length of the fetched data.
    pub realsize: u64,
    pub reference: AttributeSafeName<'a>,
    pub attributes: EntryAttributes<'a>,
}

/// The header block transitioning the file prefix into tar semantics.
pub struct LeadingEscape {
    pub header: TarHeader,
    /// The pax comment record that doubles as the attribute/tag closer.
    /// Written immediately after the header block.
    pub extra: Vec<u8>,
}

/// One escaped entry: extension header, optional pax records, file header,
/// payload. Written in that order after `padding`.
pub struct EscapedEntry {
    pub padding: &'static [u8],
    pub extension: TarHeader,
    /// Pax records of the extension header, already padded to a block
    /// boundary. Empty unless the name needed a `path` record.
    pub records: Vec<u8>,
    pub file: TarHeader,
    pub data: Vec<u8>,
}

/// The two headers terminating the logical tar.
pub struct Sentinel {
    pub padding: &'static [u8],
    pub first: TarHeader,
    pub second: TarHeader,
}

/// Streaming writer state: tracks the byte position so headers always land
/// on block boundaries, and whether a template is currently open.
pub struct EscapeEngine {
    written: u64,
    in_template: bool,
}

impl EscapeEngine {
    /// Start at file offset zero with no template open.
    pub fn new() -> Self {
        EscapeEngine {
            written: 0,
            in_template: false,
        }
    }

    /// Resume at `offset` with a template already opened by earlier content
    /// (the stage-0 head leaves its tail template open over the wasm body).
    pub fn at_offset(offset: u64) -> Self {
        EscapeEngine {
            written: offset,
            in_template: true,
        }
    }

    /// Build the header block at offset zero. `head` becomes the name field
    /// verbatim and must leave a double-quoted attribute open; `skip` is
    /// the number of bytes following the comment record before the first
    /// aligned escape.
    pub fn leading(&mut self, head: &[u8], skip: usize) -> Result<LeadingEscape, EscapeError> {
        let opens_attribute = head.windows(2).any(|pair| pair == b"=\"");
        if head.len() > NAME_LEN || !opens_attribute {
            return Err(EscapeError::BadLeadingHead);
        }

        let mut header = TarHeader::EMPTY;
        header.name[..head.len()].copy_from_slice(head);
        header.typeflag = TYPE_EXTENSION;

        // The record length we announce excludes our own digits; readers of
        // this archive only need the size field to find the next block.
        let announced = COMMENT_INTRO.len() + skip;
        let mut extra = format!("{announced:010}").into_bytes();
        extra.extend_from_slice(COMMENT_INTRO);

        header.set_size(extra.len() + skip);
        header.apply_encoding_defaults();
        header.apply_checksum();

        self.written += BLOCK as u64;
        self.written += (extra.len() + skip) as u64;

        Ok(LeadingEscape { header, extra })
    }

    /// Escape an inline entry; the payload is stored base64-encoded with the
    /// decoded length recorded in the realsize slot.
    pub fn entry(&mut self, entry: Entry<'_>) -> Result<EscapedEntry, EscapeError> {
        let encoded = base64::encode(entry.data);
        let realsize = entry.data.len() as u64;
        let attributes = entry.attributes;

        self.continue_pair(entry.name, encoded, |file| {
            file.apply_attributes(&attributes);
            file.set_realsize(realsize);
        })
    }

    /// Escape an external reference: no payload, URL in the linkname.
    pub fn external(&mut self, external: External<'_>) -> Result<EscapedEntry, EscapeError> {
        let External {
            name,
            realsize,
            reference,
            attributes,
        } = external;

        let url = reference.as_str().as_bytes();
        if url.len() >= NAME_LEN {
            return Err(EscapeError::ReferenceTooLong);
        }

        self.continue_pair(name, Vec::new(), |file| {
            file.apply_attributes(&attributes);
            // Behind a leading NUL so the tar linkname keeps its terminator
            // convention while the bytes stay inside the data-b attribute.
            file.linkname[1..][..url.len()].copy_from_slice(url);
            file.typeflag = TYPE_EXTERNAL;
            file.set_realsize(realsize);
        })
    }

    fn continue_pair(
        &mut self,
        name: AttributeSafeName<'_>,
        data: Vec<u8>,
        hook: impl FnOnce(&mut TarHeader),
    ) -> Result<EscapedEntry, EscapeError> {
        let padding = self.pad_to_block();
        let qualname = name.as_str().as_bytes();

        let start = if self.in_template {
            CONT_NAME
        } else {
            self.in_template = true;
            START_NAME
        };

        let mut extension = TarHeader::EMPTY;
        extension.name[..start.len()].copy_from_slice(start);
        extension.typeflag = TYPE_EXTENSION;
        extension.apply_encoding_defaults();
        let id_at = extension.prefix.len() - ID_INTRO.len();
        extension.prefix[id_at..].copy_from_slice(ID_INTRO);

        let mut file = TarHeader::EMPTY;

        let records = if qualname.len() <= INLINE_NAME_MAX {
            file.name[..qualname.len()].copy_from_slice(qualname);

            // The data-b introducer sits at the very end of the name field,
            // past the terminating NUL, so the header tail is captured at a
            // consistent offset regardless of the name length.
            let rest = &mut file.name[qualname.len() + 1..];
            let intro_at = rest.len() - DATA_B_INTRO.len();
            rest[intro_at..].copy_from_slice(DATA_B_INTRO);

            extension.set_size(0);
            Vec::new()
        } else {
            // Long names travel as a pax path record; the template id
            // degrades but the tar view stays exact.
            let keep = &qualname[..INLINE_NAME_MAX];
            file.name[..keep.len()].copy_from_slice(keep);
            let rest = &mut file.name[keep.len() + 1..];
            let intro_at = rest.len() - DATA_B_INTRO.len();
            rest[intro_at..].copy_from_slice(DATA_B_INTRO);

            let record = pax_record("path", name.as_str());
            extension.set_size(record.len());
            let mut padded = record;
            padded.resize(align(padded.len() as u64) as usize, 0);
            padded
        };

        let data_at = file.prefix.len() - DATA_START.len();
        file.prefix[data_at..].copy_from_slice(DATA_START);
        file.typeflag = b'0';
        file.set_size(data.len());
        file.apply_encoding_defaults();

        hook(&mut file);

        extension.apply_checksum();
        file.apply_checksum();

        self.written += (BLOCK * 2 + records.len() + data.len()) as u64;

        Ok(EscapedEntry {
            padding,
            extension,
            records,
            file,
            data,
        })
    }

    /// Terminate the logical tar.
    pub fn sentinel(&mut self) -> Sentinel {
        let padding = self.pad_to_block();

        let mut first = TarHeader::EMPTY;
        first.name[..SENTINEL_NAME.len()].copy_from_slice(SENTINEL_NAME);
        first.typeflag = TYPE_EXTENSION;
        first.set_size(0);
        first.apply_encoding_defaults();
        let close_at = first.prefix.len() - DATA_START.len();
        first.prefix[close_at..].copy_from_slice(DATA_START);
        first.apply_checksum();

        let mut second = TarHeader::EMPTY;
        second.name[..SENTINEL_TAIL_NAME.len()].copy_from_slice(SENTINEL_TAIL_NAME);
        second.typeflag = TYPE_EXTENSION;
        second.set_size(0);
        second.apply_encoding_defaults();
        second.apply_checksum();

        self.in_template = false;
        self.written += (BLOCK * 2) as u64;

        Sentinel {
            padding,
            first,
            second,
        }
    }

    /// Record that the surrounding content opened a template the next
    /// escape must close (the stage-0 head leaves one open over the wasm
    /// body).
    pub fn mark_template_open(&mut self) {
        self.in_template = true;
    }

    fn pad_to_block(&mut self) -> &'static [u8] {
        static PADDING: [u8; BLOCK] = [0; BLOCK];
        let pad = align(self.written) - self.written;
        self.written += pad;
        &PADDING[..pad as usize]
    }
}

impl Default for EscapeEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// One pax record, `"%d %s=%s\n"` with the length covering itself.
fn pax_record(key: &str, value: &str) -> Vec<u8> {
    let payload = format!(" {key}={value}\n");
    let mut total = payload.len() + 1;
    while total != payload.len() + total.to_string().len() {
        total = payload.len() + total.to_string().len();
    }
    format!("{total}{payload}").into_bytes()
}

/// What the reader found at the cursor.
pub enum ParsedItem {
    /// A file entry: its header (name already resolved through any pax
    /// `path` record) and the byte range of its stored payload.
    Entry {
        header: TarHeader,
        name: String,
        data: core::ops::Range<usize>,
    },
    /// The sentinel pair; `trailing_at` is the first byte after it.
    Sentinel { trailing_at: usize },
    /// Classic zero-block end of archive.
    Eof { end: usize },
}

/// Decoded payload of an entry.
pub enum ParsedData {
    Inline(Vec<u8>),
    External { url: String, realsize: u64 },
}

/// Streaming reader over an artifact's tar view.
pub struct EscapeUnpacker {
    cursor: u64,
}

impl EscapeUnpacker {
    pub fn new() -> Self {
        EscapeUnpacker { cursor: 0 }
    }

    /// Parse the header block at offset zero and skip the non-tar prefix it
    /// declares. Returns the offset where escapes begin.
    pub fn leading(&mut self, data: &[u8]) -> Result<usize, EscapeError> {
        let header = TarHeader::read_at(data, 0)?;

        if header.typeflag != TYPE_EXTENSION {
            return Err(EscapeError::NotAnEscape);
        }

        let size = header.parse_size()?;
        self.cursor = BLOCK as u64 + size;
        Ok(align(self.cursor) as usize)
    }

    /// Advance to and classify the next escape.
    pub fn next(&mut self, data: &[u8]) -> Result<ParsedItem, EscapeError> {
        self.cursor = align(self.cursor);
        let at = self.cursor as usize;

        let extension = TarHeader::read_at(data, at)?;

        if extension.name.starts_with(SENTINEL_NAME) {
            let second = TarHeader::read_at(data, at + BLOCK)?;
            if !second.name.starts_with(SENTINEL_TAIL_NAME) {
                return Err(EscapeError::UnexpectedEscape);
            }
            self.cursor += (BLOCK * 2) as u64;
            return Ok(ParsedItem::Sentinel {
                trailing_at: self.cursor as usize,
            });
        }

        if extension.is_zero() {
            let second = TarHeader::read_at(data, at + BLOCK)?;
            if !second.is_zero() {
                return Err(EscapeError::UnexpectedEscape);
            }
            self.cursor += (BLOCK * 2) as u64;
            return Ok(ParsedItem::Eof {
                end: self.cursor as usize,
            });
        }

        if extension.typeflag != TYPE_EXTENSION {
            return Err(EscapeError::NotAnEscape);
        }

        // The extension may carry pax records (long names).
        let record_len = extension.parse_size()?;
        let records_end = align(self.cursor + BLOCK as u64 + record_len);
        let records = data
            .get(at + BLOCK..(self.cursor + BLOCK as u64 + record_len) as usize)
            .ok_or(TarError::TruncatedArchive)?;

        let file = TarHeader::read_at(data, records_end as usize)?;
        let size = file.parse_size()?;

        let data_start = records_end + BLOCK as u64;
        let data_end = data_start + size;
        if data_end as usize > data.len() {
            return Err(EscapeError::from(TarError::TruncatedArchive));
        }

        let name = match pax_record_value(records, "path") {
            Some(path) => path,
            None => file.name_str()?.to_owned(),
        };

        self.cursor = data_end;

        Ok(ParsedItem::Entry {
            header: file,
            name,
            data: data_start as usize..data_end as usize,
        })
    }

    /// Decode the stored payload of an entry header.
    pub fn file_data(header: &TarHeader, stored: &[u8]) -> Result<ParsedData, EscapeError> {
        if header.typeflag == TYPE_EXTERNAL {
            let url = core::ffi::CStr::from_bytes_until_nul(&header.linkname[1..])
                .map_err(|_| EscapeError::UnexpectedEscape)?
                .to_str()
                .map_err(|_| EscapeError::UnexpectedEscape)?
                .to_owned();
            let realsize = header.parse_realsize()?;
            return Ok(ParsedData::External { url, realsize });
        }

        let decoded = base64::decode(base64::trim_mangled(stored));

        let declared = header.parse_realsize()?;
        if declared != decoded.len() as u64 {
            return Err(EscapeError::PayloadSizeMismatch {
                declared,
                actual: decoded.len() as u64,
            });
        }

        Ok(ParsedData::Inline(decoded))
    }
}

impl Default for EscapeUnpacker {
    fn default() -> Self {
        Self::new()
    }
}

fn pax_record_value(records: &[u8], key: &str) -> Option<String> {
    let mut rest = records;
    while !rest.is_empty() && rest[0] != 0 {
        let space = rest.iter().position(|&b| b == b' ')?;
        let len: usize = core::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        let record = rest.get(..len)?;
        let body = &record[space + 1..];
        let eq = body.iter().position(|&b| b == b'=')?;
        if &body[..eq] == key.as_bytes() {
            let value = &body[eq + 1..body.len().saturating_sub(1)];
            return core::str::from_utf8(value).ok().map(str::to_owned);
        }
        rest = &rest[len..];
    }
    None
}
