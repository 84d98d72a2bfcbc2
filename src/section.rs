//! Custom-section plumbing for the boot module.
//!
//! New sections go at the front of the module, right after the magic and
//! version, so the stage-0 payload lands inside the HTML sniffing window. A
//! conforming runtime skips unknown custom sections, which keeps the
//! augmented module semantically identical to the original.

use thiserror::Error;

use wasm_encoder::{CustomSection, Module, RawSection};
use wasmparser::{Parser, Payload};

/// Boot HTML head and escape table; must sit in the first KiB.
pub const STAGE0: &str = "wah_polyglot_stage0";
/// Optional replacement page body.
pub const STAGE1_HTML: &str = "wah_polyglot_stage1_html";
/// Module loader code driven by stage 0.
pub const STAGE1: &str = "wah_polyglot_stage1";
/// SPA-style init code driven by stage 1.
pub const STAGE2: &str = "wah_polyglot_stage2";
/// Configuration bytecode for the sandbox.
pub const WASI_CONFIG: &str = "wah_wasi_config";
/// Optional native-binding loader for the kernel.
pub const WASM_BINDGEN: &str = "wah_polyglot_wasm_bindgen";

#[derive(Debug, Error)]
pub enum SectionError {
    #[error("module carries more than one `{0}` section")]
    DuplicateSection(String),

    #[error("module carries more than one configuration section")]
    DuplicateConfig,

    #[error("no `{STAGE2}` section in the boot module")]
    MissingStage2,

    #[error("malformed module: {0}")]
    Parse(String),
}

impl From<wasmparser::BinaryReaderError> for SectionError {
    fn from(err: wasmparser::BinaryReaderError) -> Self {
        SectionError::Parse(err.message().to_owned())
    }
}

/// Re-encode `wasm` with `sections` prepended, original sections preserved
/// byte for byte.
pub fn prepend(wasm: &[u8], sections: &[(&str, &[u8])]) -> Result<Vec<u8>, SectionError> {
    let mut encoder = Module::new();

    for &(name, data) in sections {
        encoder.section(&CustomSection {
            name: name.into(),
            data: data.into(),
        });
    }

    for payload in Parser::new(0).parse_all(wasm) {
        if let Some((id, range)) = payload?.as_section() {
            encoder.section(&RawSection {
                id,
                data: &wasm[range],
            });
        }
    }

    Ok(encoder.finish())
}

/// All custom sections named `name`, in module order. The wasm view of a
/// polyglot artifact ends where the tar stream begins, so the scan stops
/// at the first byte that no longer parses; sections never follow it.
pub fn custom_sections<'a>(wasm: &'a [u8], name: &str) -> Result<Vec<&'a [u8]>, SectionError> {
    let mut found = Vec::new();

    for payload in Parser::new(0).parse_all(wasm) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(_) => break,
        };
        if let Payload::CustomSection(reader) = payload {
            if reader.name() == name {
                found.push(reader.data());
            }
        }
    }

    Ok(found)
}

/// The one section named `name`, or `None`. A second occurrence is an error:
/// `DuplicateConfig` for the configuration section, `DuplicateSection`
/// otherwise.
pub fn unique_section<'a>(wasm: &'a [u8], name: &str) -> Result<Option<&'a [u8]>, SectionError> {
    let sections = custom_sections(wasm, name)?;

    match sections.len() {
        0 => Ok(None),
        1 => Ok(Some(sections[0])),
        _ if name == WASI_CONFIG => Err(SectionError::DuplicateConfig),
        _ => Err(SectionError::DuplicateSection(name.to_owned())),
    }
}

/// The stage-2 section; zero occurrences is `MissingStage2`.
pub fn stage2_section(wasm: &[u8]) -> Result<&[u8], SectionError> {
    unique_section(wasm, STAGE2)?.ok_or(SectionError::MissingStage2)
}

/// Byte length of the module starting at `bytes[0]`, ignoring trailing
/// non-wasm content. Lets the packer find where the tar stream may begin.
pub fn module_len(bytes: &[u8]) -> Result<usize, SectionError> {
    let mut end = 8;

    for payload in Parser::new(0).parse_all(bytes) {
        match payload {
            Ok(payload) => {
                if matches!(payload, Payload::End(_)) {
                    break;
                }
                if let Some((_, range)) = payload.as_section() {
                    end = end.max(range.end);
                }
            }
            // parse_all insists on consuming every input byte; the first
            // error past the last well-formed section is the tar stream.
            Err(_) => break,
        }
    }

    Ok(end)
}

/// Hand-encoded custom-section header with a fixed-width (5-byte) size LEB,
/// declaring `content_len` bytes of content to follow. Writing the header
/// separately lets the packer interleave the content with the other views.
pub fn raw_section_header(name: &str, content_len: usize) -> Vec<u8> {
    let name_bytes = name.as_bytes();
    assert!(name_bytes.len() < 0x80);

    let payload_len = 1 + name_bytes.len() + content_len;

    let mut out = Vec::with_capacity(7 + name_bytes.len());
    out.push(0x00);
    out.extend_from_slice(&padded_leb(payload_len as u32));
    out.push(name_bytes.len() as u8);
    out.extend_from_slice(name_bytes);
    out
}

/// Hand-encoded custom section with a fixed-width size LEB, so the caller
/// can rely on the content starting at a stable offset no matter the
/// content length.
pub fn raw_section_padded(name: &str, content: &[u8]) -> Vec<u8> {
    let mut out = raw_section_header(name, content.len());
    out.extend_from_slice(content);
    out
}

/// Offset of the content inside a `raw_section_padded` emission.
pub fn raw_section_content_offset(name: &str) -> usize {
    1 + 5 + 1 + name.len()
}

/// Non-minimal 5-byte LEB128; the encoding is redundant but valid.
fn padded_leb(mut value: u32) -> [u8; 5] {
    let mut out = [0u8; 5];
    for byte in out.iter_mut().take(4) {
        *byte = (value as u8 & 0x7f) | 0x80;
        value >>= 7;
    }
    out[4] = value as u8 & 0x7f;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest valid module: magic and version only.
    const EMPTY_MODULE: [u8; 8] = [0x00, b'a', b's', b'm', 0x01, 0x00, 0x00, 0x00];

    #[test]
    fn prepend_then_read_back() {
        let wasm = prepend(&EMPTY_MODULE, &[(STAGE1, b"one"), (STAGE2, b"two")]).unwrap();

        assert_eq!(&wasm[..8], &EMPTY_MODULE);
        assert_eq!(custom_sections(&wasm, STAGE1).unwrap(), vec![&b"one"[..]]);
        assert_eq!(stage2_section(&wasm).unwrap(), b"two");
    }

    #[test]
    fn duplicate_stage2_is_an_error() {
        let wasm = prepend(&EMPTY_MODULE, &[(STAGE2, b"a"), (STAGE2, b"b")]).unwrap();
        assert!(matches!(
            stage2_section(&wasm),
            Err(SectionError::DuplicateSection(name)) if name == STAGE2
        ));
    }

    #[test]
    fn duplicate_config_is_its_own_error() {
        let wasm = prepend(&EMPTY_MODULE, &[(WASI_CONFIG, b"a"), (WASI_CONFIG, b"b")]).unwrap();
        assert!(matches!(
            unique_section(&wasm, WASI_CONFIG),
            Err(SectionError::DuplicateConfig)
        ));
    }

    #[test]
    fn missing_stage2() {
        assert!(matches!(
            stage2_section(&EMPTY_MODULE),
            Err(SectionError::MissingStage2)
        ));
    }

    #[test]
    fn padded_leb_is_accepted_by_the_parser() {
        let section = raw_section_padded(STAGE0, b"<!DOCTYPE html>");
        let mut wasm = EMPTY_MODULE.to_vec();
        wasm.extend_from_slice(&section);

        assert_eq!(
            custom_sections(&wasm, STAGE0).unwrap(),
            vec![&b"<!DOCTYPE html>"[..]]
        );
        assert_eq!(
            &wasm[8 + raw_section_content_offset(STAGE0)..],
            b"<!DOCTYPE html>"
        );
    }

    #[test]
    fn module_len_stops_at_trailing_garbage() {
        let wasm = prepend(&EMPTY_MODULE, &[(STAGE1, b"payload")]).unwrap();
        let clean_len = wasm.len();

        let mut with_tail = wasm;
        with_tail.extend_from_slice(&[0u8; 512]);
        assert_eq!(module_len(&with_tail).unwrap(), clean_len);
    }
}
