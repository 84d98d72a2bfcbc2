//! The artifact must satisfy all three parsers at once, and taking it
//! apart must return the original inputs.

use wah::packer::{build, unbuild, BuildSpec, PackFile, STAGE0_REGION};
use wah::section;
use wah::tar::{TarHeader, BLOCK, TYPE_EXTENSION};

/// A module with real non-custom sections: one function type, one function,
/// one export.
fn kernel_module() -> Vec<u8> {
    use wasm_encoder::{
        CodeSection, ExportKind, ExportSection, Function, FunctionSection, Instruction, Module,
        TypeSection,
    };

    let mut module = Module::new();

    let mut types = TypeSection::new();
    let no_params: Vec<wasm_encoder::ValType> = Vec::new();
    types.ty().function(no_params, Vec::new());
    module.section(&types);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("start", ExportKind::Func, 0);
    module.section(&exports);

    let mut code = CodeSection::new();
    let mut body = Function::new(vec![]);
    body.instruction(&Instruction::End);
    code.function(&body);
    module.section(&code);

    module.finish()
}

fn spec<'a>(wasm: &'a [u8], files: Vec<PackFile<'a>>) -> BuildSpec<'a> {
    BuildSpec {
        wasm,
        stage0_script: b"fetch(document.location)/*decode*/",
        stage1: b"export default (wasm, module, files) => {};",
        stage1_html: None,
        stage2: b"export default (wasm, fs, url) => {};",
        config: None,
        wasm_bindgen: None,
        files,
    }
}

fn three_file_tree<'a>() -> Vec<PackFile<'a>> {
    vec![
        PackFile::Inline {
            name: "hello.txt",
            data: b"hi",
            attributes: Default::default(),
        },
        PackFile::Inline {
            name: "dir/a.bin",
            data: &[0x01, 0x02],
            attributes: Default::default(),
        },
        PackFile::Inline {
            name: "bin/exe",
            data: b"\0asm\x01\0\0\0",
            attributes: Default::default(),
        },
    ]
}

/// Non-custom sections as `(id, bytes)` pairs.
fn core_sections(wasm: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut sections = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(wasm) {
        let payload = payload.unwrap();
        if matches!(payload, wasmparser::Payload::CustomSection(_)) {
            continue;
        }
        if let Some((id, range)) = payload.as_section() {
            sections.push((id, wasm[range].to_vec()));
        }
    }
    sections
}

#[test]
fn wasm_view_preserves_core_sections() {
    let kernel = kernel_module();
    let artifact = build(&spec(&kernel, three_file_tree())).unwrap();

    assert_eq!(&artifact[..8], b"\0asm\x01\0\0\0");

    // The outer module and the embedded boot module both carry exactly the
    // kernel's non-custom sections.
    let unpacked = unbuild(&artifact).unwrap();
    assert_eq!(core_sections(&unpacked.module), core_sections(&kernel));

    let boot = unpacked
        .files
        .iter()
        .find(|f| f.name == "boot/wah-init.wasm")
        .unwrap();
    let wah::boot::EntryData::Inline(boot) = &boot.data else {
        panic!("boot module must be inline");
    };
    assert_eq!(core_sections(boot), core_sections(&kernel));
}

#[test]
fn tar_view_recovers_the_tree_byte_exact() {
    let kernel = kernel_module();
    let artifact = build(&spec(&kernel, three_file_tree())).unwrap();

    let unpacked = unbuild(&artifact).unwrap();
    let mut recovered = std::collections::BTreeMap::new();
    for file in &unpacked.files {
        if let wah::boot::EntryData::Inline(bytes) = &file.data {
            recovered.insert(file.name.clone(), bytes.clone());
        }
    }

    assert_eq!(recovered["hello.txt"], b"hi");
    assert_eq!(recovered["dir/a.bin"], vec![0x01, 0x02]);
    assert_eq!(recovered["bin/exe"], b"\0asm\x01\0\0\0");
}

#[test]
fn every_tar_header_sits_on_a_block_boundary() {
    let kernel = kernel_module();
    let artifact = build(&spec(&kernel, three_file_tree())).unwrap();

    // Walk the tar view the way a pax reader would.
    let lead = TarHeader::read_at(&artifact, 0).unwrap();
    assert_eq!(lead.typeflag, TYPE_EXTENSION);
    let mut at = wah::tar::align(BLOCK as u64 + lead.parse_size().unwrap()) as usize;
    assert_eq!(at % BLOCK, 0);

    let mut entries = 0;
    loop {
        let extension = TarHeader::read_at(&artifact, at).unwrap();
        assert_eq!(at % BLOCK, 0, "header off the block grid at {at}");
        if extension.name_str().unwrap_or("").is_empty() && extension.typeflag == 0 {
            break;
        }
        assert_eq!(extension.typeflag, TYPE_EXTENSION);
        if extension.name_str().is_err() {
            break;
        }

        // Sentinel pair ends the walk.
        let name_bytes = &extension.name[..];
        if name_bytes.starts_with(b"\0</template><template class=\"wah_polyglot_end\"") {
            break;
        }

        let records = extension.parse_size().unwrap();
        let file_at = wah::tar::align(at as u64 + BLOCK as u64 + records) as usize;
        let file = TarHeader::read_at(&artifact, file_at).unwrap();
        let size = file.parse_size().unwrap();
        at = wah::tar::align(file_at as u64 + BLOCK as u64 + size) as usize;
        entries += 1;
    }

    // boot/init, boot/wah-init.wasm and the three files.
    assert_eq!(entries, 5);
}

#[test]
fn html_view_has_doctype_and_markers_in_the_window() {
    let kernel = kernel_module();
    let artifact = build(&spec(&kernel, three_file_tree())).unwrap();

    let window = String::from_utf8_lossy(&artifact[..STAGE0_REGION]);
    assert!(window.contains("<!DOCTYPE html>"));
    assert!(window.contains("<html data-a=\""));
    assert!(window.contains("<script>"));

    let text = String::from_utf8_lossy(&artifact);
    assert!(text.contains("class=\"wah_polyglot_data\""));
    // The id attribute value opens with block padding before the name.
    assert!(text.contains("data-wahtml_id=\""));
    assert!(text.contains("hello.txt"));
    assert!(text.contains("</html>"));
}

#[test]
fn payload_sizes_match_their_headers() {
    let kernel = kernel_module();
    let artifact = build(&spec(&kernel, three_file_tree())).unwrap();

    let mut unpacker = wah::EscapeUnpacker::new();
    unpacker.leading(&artifact).unwrap();
    loop {
        match unpacker.next(&artifact).unwrap() {
            wah::escape::ParsedItem::Entry { header, data, .. } => {
                // Stored length is the base64 text; the realsize slot names
                // the decoded length. file_data cross-checks them.
                assert_eq!(header.parse_size().unwrap() as usize, data.len());
                wah::EscapeUnpacker::file_data(&header, &artifact[data]).unwrap();
            }
            _ => break,
        }
    }
}

#[test]
fn duplicate_config_sections_are_refused() {
    let kernel = kernel_module();
    // Sneak a config section into the kernel, then have the packer add a
    // second one.
    let poisoned = section::prepend(&kernel, &[(section::WASI_CONFIG, b"\0\0\0\0")]).unwrap();

    let program = wah::config::Program::empty();
    let mut doubled = spec(&poisoned, Vec::new());
    doubled.config = Some(&program);

    let artifact = build(&doubled).unwrap();
    let unpacked = unbuild(&artifact).unwrap();
    let boot = unpacked
        .files
        .iter()
        .find_map(|f| match (&f.name[..], &f.data) {
            ("boot/wah-init.wasm", wah::boot::EntryData::Inline(bytes)) => Some(bytes.clone()),
            _ => None,
        })
        .unwrap();

    assert!(matches!(
        section::unique_section(&boot, section::WASI_CONFIG),
        Err(wah::SectionError::DuplicateConfig)
    ));
}

#[test]
fn stage0_section_must_fit_the_sniffing_window() {
    let kernel = kernel_module();
    let mut oversized = spec(&kernel, Vec::new());
    let big = vec![b'x'; STAGE0_REGION];
    oversized.stage0_script = &big;

    assert!(matches!(
        build(&oversized),
        Err(wah::PackError::Stage0TooLarge { .. })
    ));
}
