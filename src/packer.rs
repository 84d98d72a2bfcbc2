//! Assembling and disassembling the polyglot artifact.
//!
//! Layout, by absolute offset:
//!
//! ```text
//! 0     wasm magic and version
//! 8     stage-0 custom section, fixed-width size LEB; its content is the
//!       HTML head. The tar header fields at 100..512 land inside the
//!       `data-a` attribute of the open `<html>` tag.
//! 512   pax comment record closing the attribute and the tag, then the
//!       rest of the stage-0 head, a tail template opener, NUL padding
//! 1024  remaining custom sections and the original module sections
//! W     end of the wasm view; NUL padding to the next block boundary
//! T0    escaped tar entries, sentinel pair, trailing HTML
//! ```
//!
//! The single size field written at offset 124 makes the three views
//! consistent: it tells a tar reader how many bytes separate the first
//! header from the first real entry.

use thiserror::Error;

use crate::config::Program;
use crate::escape::{
    Entry, EscapeEngine, EscapeError, EscapeUnpacker, EscapedEntry, External, ParsedData,
    ParsedItem,
};
use crate::section::{self, SectionError};
use crate::tar::{align, AttributeSafeName, EntryAttributes, TarError, BLOCK};
use crate::vfs::RootFs;

/// The stage-0 section, head included, ends exactly here.
pub const STAGE0_REGION: usize = 1024;

const DOCTYPE: &[u8] = b"<!DOCTYPE html>";
const HTML_OPEN: &[u8] = b"<html data-a=\"";
const HEAD_OPEN: &[u8] = b"<head><meta charset=utf-8><script>";
const HEAD_CLOSE: &[u8] = b"</script></head><body>";
/// Swallows the wasm body until the first escape closes it.
const TAIL_TEMPLATE: &[u8] = b"<template class=\"wah_polyglot_tail\">";
const TRAILING: &[u8] = b"-->\n</html>\n";

#[derive(Debug, Error)]
pub enum PackError {
    #[error("stage-0 script needs {need} bytes but only {available} fit in the sniffing window")]
    Stage0TooLarge { need: usize, available: usize },

    #[error(transparent)]
    Tar(#[from] TarError),

    #[error(transparent)]
    Escape(#[from] EscapeError),

    #[error(transparent)]
    Section(#[from] SectionError),

    #[error(transparent)]
    Vfs(#[from] crate::vfs::VfsError),
}

/// A file to embed.
pub enum PackFile<'a> {
    Inline {
        name: &'a str,
        data: &'a [u8],
        attributes: EntryAttributes<'a>,
    },
    External {
        name: &'a str,
        url: &'a str,
        realsize: u64,
        attributes: EntryAttributes<'a>,
    },
}

/// Everything the packer needs to emit an artifact.
pub struct BuildSpec<'a> {
    /// The kernel module the sandbox will run.
    pub wasm: &'a [u8],
    /// Stage-0 bootstrap script; must fit the sniffing window.
    pub stage0_script: &'a [u8],
    pub stage1: &'a [u8],
    pub stage1_html: Option<&'a [u8]>,
    pub stage2: &'a [u8],
    pub config: Option<&'a Program>,
    pub wasm_bindgen: Option<&'a [u8]>,
    pub files: Vec<PackFile<'a>>,
}

/// Build the polyglot artifact.
pub fn build(spec: &BuildSpec<'_>) -> Result<Vec<u8>, PackError> {
    // Step 1: the boot module: stage payloads in front of the kernel. This
    // module is also embedded as a file, so stage 1 can find its sections
    // again after a round-trip through the DOM.
    let mut stage_sections: Vec<(&str, &[u8])> = Vec::new();
    if let Some(html) = spec.stage1_html {
        stage_sections.push((section::STAGE1_HTML, html));
    }
    stage_sections.push((section::STAGE1, spec.stage1));
    stage_sections.push((section::STAGE2, spec.stage2));
    let config_bytes = spec.config.map(Program::to_section_bytes);
    if let Some(config) = &config_bytes {
        stage_sections.push((section::WASI_CONFIG, config));
    }
    if let Some(bindgen) = spec.wasm_bindgen {
        stage_sections.push((section::WASM_BINDGEN, bindgen));
    }

    let boot_module = section::prepend(spec.wasm, &stage_sections)?;

    // Step 2: sizing. The stage-0 region is fixed, so every offset after
    // it is known before a single byte is written.
    let wasm_end = STAGE0_REGION + (boot_module.len() - 8);
    // At least one NUL must separate the last section from the first tar
    // header, or the header bytes could scan as a further wasm section.
    let tar_start = align(wasm_end as u64 + 1) as usize;

    // Step 3: the first block. Magic, the padded section header, the
    // doctype and an `<html>` tag whose open attribute swallows the tar
    // fields. NULs fill the gap to offset 100.
    let mut head = Vec::with_capacity(100);
    head.extend_from_slice(&[0x00, b'a', b's', b'm', 0x01, 0x00, 0x00, 0x00]);
    let section_header = section::raw_section_header(
        section::STAGE0,
        STAGE0_REGION - 8 - section::raw_section_content_offset(section::STAGE0),
    );
    head.extend_from_slice(&section_header);
    head.extend_from_slice(DOCTYPE);
    head.extend_from_slice(HTML_OPEN);
    debug_assert!(head.len() <= 100);
    head.resize(100, 0);

    let mut engine = EscapeEngine::new();
    // The pax comment record is a fixed 21 bytes; everything from its end
    // to the first aligned escape is skipped as one comment.
    let lead = engine.leading(&head, tar_start - BLOCK - 21)?;
    debug_assert_eq!(lead.extra.len(), 21);

    let mut out = Vec::with_capacity(tar_start + BLOCK * 4);
    out.extend_from_slice(&lead.header.to_block());
    out.extend_from_slice(&lead.extra);

    // Step 4: the rest of the stage-0 head. Script, body, tail template,
    // NUL padding up to the fixed region end.
    let fixed = HEAD_OPEN.len() + HEAD_CLOSE.len() + TAIL_TEMPLATE.len();
    let available = STAGE0_REGION
        .checked_sub(out.len() + fixed)
        .unwrap_or(0);
    if spec.stage0_script.len() > available {
        return Err(PackError::Stage0TooLarge {
            need: spec.stage0_script.len(),
            available,
        });
    }

    out.extend_from_slice(HEAD_OPEN);
    out.extend_from_slice(spec.stage0_script);
    out.extend_from_slice(HEAD_CLOSE);
    out.extend_from_slice(TAIL_TEMPLATE);
    out.resize(STAGE0_REGION, 0);
    engine.mark_template_open();

    // Step 5: the boot module's sections, minus the magic the artifact
    // already starts with.
    out.extend_from_slice(&boot_module[8..]);
    debug_assert_eq!(out.len(), wasm_end);
    out.resize(tar_start, 0);

    // Step 6: the embedded filesystem. The boot module appears twice, as
    // the stage-0 lookup target and as the inner init binary.
    let mut emit = |escaped: EscapedEntry| {
        out.extend_from_slice(escaped.padding);
        out.extend_from_slice(&escaped.extension.to_block());
        out.extend_from_slice(&escaped.records);
        out.extend_from_slice(&escaped.file.to_block());
        out.extend_from_slice(&escaped.data);
    };

    emit(engine.entry(Entry {
        name: AttributeSafeName::new(crate::boot::BOOT_INIT)?,
        data: boot_module.as_slice(),
        attributes: Default::default(),
    })?);
    emit(engine.entry(Entry {
        name: AttributeSafeName::new(crate::boot::BOOT_MODULE)?,
        data: boot_module.as_slice(),
        attributes: Default::default(),
    })?);

    for file in &spec.files {
        match *file {
            PackFile::Inline {
                name,
                data,
                attributes,
            } => emit(engine.entry(Entry {
                name: AttributeSafeName::new(name)?,
                data,
                attributes,
            })?),
            PackFile::External {
                name,
                url,
                realsize,
                attributes,
            } => emit(engine.external(External {
                name: AttributeSafeName::new(name)?,
                realsize,
                reference: AttributeSafeName::new(url)?,
                attributes,
            })?),
        }
    }

    // Step 7: terminate the logical tar and close the page.
    let sentinel = engine.sentinel();
    out.extend_from_slice(sentinel.padding);
    out.extend_from_slice(&sentinel.first.to_block());
    out.extend_from_slice(&sentinel.second.to_block());
    out.extend_from_slice(TRAILING);

    Ok(out)
}

/// One recovered file.
#[derive(Debug, PartialEq)]
pub struct UnpackedFile {
    pub name: String,
    pub data: crate::boot::EntryData,
}

/// The artifact taken back apart.
pub struct Unpacked {
    /// The outer wasm view, stage-0 section included.
    pub module: Vec<u8>,
    pub files: Vec<UnpackedFile>,
}

/// Disassemble an artifact emitted by [`build`].
pub fn unbuild(artifact: &[u8]) -> Result<Unpacked, PackError> {
    let module_end = section::module_len(artifact)?;
    let module = artifact[..module_end].to_vec();

    let mut unpacker = EscapeUnpacker::new();
    unpacker.leading(artifact)?;

    let mut files = Vec::new();
    loop {
        match unpacker.next(artifact)? {
            ParsedItem::Entry { header, name, data } => {
                let data = match EscapeUnpacker::file_data(&header, &artifact[data])? {
                    ParsedData::Inline(bytes) => crate::boot::EntryData::Inline(bytes),
                    ParsedData::External { url, realsize } => {
                        crate::boot::EntryData::External { url, realsize }
                    }
                };
                files.push(UnpackedFile { name, data });
            }
            ParsedItem::Sentinel { .. } | ParsedItem::Eof { .. } => break,
        }
    }

    Ok(Unpacked { module, files })
}

/// Rebuild a filesystem from an unpacked artifact, the way stage 0 would.
pub fn unpacked_filesystem(unpacked: &Unpacked) -> Result<RootFs, PackError> {
    let mut fs = RootFs::new();
    for file in &unpacked.files {
        if let crate::boot::EntryData::Inline(bytes) = &file.data {
            fs.insert_file(&file.name, bytes.clone())?;
        }
    }
    Ok(fs)
}

/// Scrape `wah_polyglot_data` templates out of a saved document. A saved
/// page has been through the DOM, so this works on text rather than block
/// offsets; attribute values and text content get the stage-0 cleanup
/// treatment later.
pub fn scan_document(text: &str) -> Vec<crate::boot::ScannedElement> {
    const CLASS_MARK: &str = "class=\"wah_polyglot_data\"";
    let mut elements = Vec::new();
    let mut rest = text;

    while let Some(mark) = rest.find(CLASS_MARK) {
        // Bound the attribute search to this start tag.
        let tag_start = rest[..mark].rfind('<').unwrap_or(0);
        let Some(tag_len) = rest[mark..].find('>') else {
            break;
        };
        let tag = &rest[tag_start..mark + tag_len];

        let after_tag = &rest[mark + tag_len + 1..];
        let content_len = after_tag.find("</template>").unwrap_or(after_tag.len());

        if let (Some(id), Some(header_tail)) = (
            attribute_value(tag, "data-wahtml_id"),
            attribute_value(tag, "data-b"),
        ) {
            elements.push(crate::boot::ScannedElement {
                id: id.to_owned(),
                header_tail: header_tail.to_owned(),
                text: after_tag[..content_len].to_owned(),
            });
        }

        rest = &after_tag[content_len..];
    }

    elements
}

fn attribute_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=\"");
    let start = tag.find(&needle)? + needle.len();
    let len = tag[start..].find('"')?;
    Some(&tag[start..start + len])
}
