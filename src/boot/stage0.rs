//! Stage 0: from scanned document elements to a filesystem and a compiled
//! boot module.
//!
//! Browsers mangle saved documents in predictable ways (NUL becomes
//! U+FFFD or `&#65533;`, text nodes grow line breaks), so every recovered
//! attribute and text node is cleaned before decoding.

use crate::escape::{EscapeError, EscapeUnpacker, ParsedData};
use crate::section;
use crate::tar::{TarHeader, BLOCK, NAME_LEN, TYPE_EXTENSION};
use crate::vfs::RootFs;

use super::{BootError, BootHost, EntryData, FileEntry, ScannedElement, BOOT_MODULE};

/// Everything stage 1 needs.
pub struct Stage1Input<M> {
    pub boot_wasm: Vec<u8>,
    pub module: M,
    pub stage1: Vec<u8>,
    pub entries: Vec<FileEntry>,
    pub fs: RootFs,
    /// Document URL external references resolve against.
    pub stage_url: String,
}

pub enum Stage0Outcome<M> {
    Handoff(Stage1Input<M>),
    /// No boot executable: terminate quietly, clearing the document's
    /// stage-0 error slot and leaving the page intact.
    Idle,
}

/// Restore the NULs a saving browser rewrote, then strip them at the ends.
fn unmangle(text: &str) -> String {
    text.replace('\u{fffd}', "\0").replace("&#65533;", "\0")
}

/// Decode every scanned element into a file entry. Elements that cannot be
/// files (oversized fields, extension headers) are skipped; a payload whose
/// decoded length contradicts its header is a hard error.
pub fn decode_scan(elements: &[ScannedElement]) -> Result<Vec<FileEntry>, BootError> {
    let mut entries = Vec::new();

    for element in elements {
        let name = unmangle(&element.id);
        let name = name.trim_matches('\0');
        if name.is_empty() || name.len() > NAME_LEN {
            continue;
        }

        let tail = unmangle(&element.header_tail);
        let tail = tail.as_bytes();
        if tail.len() > BLOCK - NAME_LEN {
            continue;
        }

        let mut block = [0u8; BLOCK];
        block[NAME_LEN..][..tail.len()].copy_from_slice(tail);
        let mut header = TarHeader::from_block(&block);
        header.name[..name.len()].copy_from_slice(name.as_bytes());

        if header.typeflag == TYPE_EXTENSION {
            continue;
        }

        let text = unmangle(&element.text).replace(['\r', '\n'], "");
        let text = text.trim_matches(|c| c == '\0' || c == ' ');

        let data = match EscapeUnpacker::file_data(&header, text.as_bytes()) {
            Ok(ParsedData::Inline(bytes)) => EntryData::Inline(bytes),
            Ok(ParsedData::External { url, realsize }) => EntryData::External { url, realsize },
            Err(EscapeError::PayloadSizeMismatch { declared, actual }) => {
                return Err(BootError::BadFile {
                    name: name.to_owned(),
                    declared,
                    actual,
                })
            }
            Err(err) => return Err(err.into()),
        };

        entries.push(FileEntry {
            header,
            name: name.to_owned(),
            data,
        });
    }

    Ok(entries)
}

/// Materialise the inline entries. Externals stay pending until stage 1.
pub fn assemble(entries: &[FileEntry]) -> Result<RootFs, BootError> {
    let mut fs = RootFs::new();
    for entry in entries {
        if let EntryData::Inline(bytes) = &entry.data {
            fs.insert_file(&entry.name, bytes.clone())?;
        }
    }
    Ok(fs)
}

pub fn run<H: BootHost>(
    host: &mut H,
    elements: &[ScannedElement],
    stage_url: &str,
) -> Result<Stage0Outcome<H::Module>, BootError> {
    let entries = decode_scan(elements)?;
    let fs = assemble(&entries)?;

    let boot_wasm = match fs.read_path(BOOT_MODULE) {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return Ok(Stage0Outcome::Idle),
    };

    let module = host.compile(&boot_wasm)?;

    let stage1 = section::unique_section(&boot_wasm, section::STAGE1)?
        .ok_or(BootError::MissingStage1)?
        .to_vec();

    Ok(Stage0Outcome::Handoff(Stage1Input {
        boot_wasm,
        module,
        stage1,
        entries,
        fs,
        stage_url: stage_url.to_owned(),
    }))
}
