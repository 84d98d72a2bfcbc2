//! Driving the stage 0/1/2 protocol end to end against a stub host.

use std::collections::HashMap;

use wah::boot::{stage0, stage1, stage2, BootError, BootHost, EntryData, EXIT_SENTINEL};
use wah::config::Assembler;
use wah::packer::{build, scan_document, BuildSpec, PackFile};
use wah::section;

/// Host stub: compilation copies bytes, fetches come from a table, starts
/// and init invocations settle with configured messages.
struct StubHost {
    fetches: HashMap<String, Vec<u8>>,
    fetch_log: Vec<String>,
    start_message: Option<String>,
    init_message: Option<String>,
    started: usize,
    init_invoked: usize,
}

impl StubHost {
    fn new() -> Self {
        StubHost {
            fetches: HashMap::new(),
            fetch_log: Vec::new(),
            start_message: Some(EXIT_SENTINEL.to_owned()),
            init_message: None,
            started: 0,
            init_invoked: 0,
        }
    }
}

impl BootHost for StubHost {
    type Module = Vec<u8>;

    fn compile(&mut self, wasm: &[u8]) -> Result<Vec<u8>, BootError> {
        if !wasm.starts_with(b"\0asm") {
            return Err(BootError::Compile("bad magic".to_owned()));
        }
        Ok(wasm.to_vec())
    }

    fn fetch(&mut self, url: &str) -> Result<Vec<u8>, BootError> {
        self.fetch_log.push(url.to_owned());
        self.fetches
            .get(url)
            .cloned()
            .ok_or_else(|| BootError::Fetch {
                url: url.to_owned(),
                reason: "not in stub table".to_owned(),
            })
    }

    fn start(
        &mut self,
        _module: &Vec<u8>,
        _config: &wah::Configuration,
        _fs: &mut wah::RootFs,
    ) -> Result<(), String> {
        self.started += 1;
        match self.start_message.take() {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }

    fn invoke_init(
        &mut self,
        _source: &[u8],
        _config: &wah::Configuration,
    ) -> Result<(), String> {
        self.init_invoked += 1;
        match self.init_message.take() {
            Some(message) => Err(message),
            None => Ok(()),
        }
    }
}

fn kernel_module() -> Vec<u8> {
    use wasm_encoder::{ExportKind, ExportSection, Module};
    // Only the export section matters for these tests; the stages treat
    // the module as opaque bytes.
    let mut module = Module::new();
    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    module.section(&exports);
    module.finish()
}

fn build_artifact(files: Vec<PackFile<'_>>, config: Option<&wah::Program>) -> Vec<u8> {
    let kernel = kernel_module();
    build(&BuildSpec {
        wasm: &kernel,
        stage0_script: b"/*s0*/",
        stage1: b"/*s1*/",
        stage1_html: None,
        stage2: b"/*s2*/",
        config,
        wasm_bindgen: None,
        files,
    })
    .unwrap()
}

fn scan(artifact: &[u8]) -> Vec<wah::ScannedElement> {
    let text = String::from_utf8_lossy(artifact).into_owned();
    scan_document(&text)
}

#[test]
fn full_boot_reaches_init() {
    let config = Assembler::standard(&["hello".to_owned()], &["TERM=dumb".to_owned()]);
    let artifact = build_artifact(
        vec![
            PackFile::Inline {
                name: "hello.txt",
                data: b"hi",
                attributes: Default::default(),
            },
            PackFile::Inline {
                name: "init.mjs",
                data: b"export default () => {};",
                attributes: Default::default(),
            },
        ],
        Some(&config),
    );

    let mut host = StubHost::new();
    let elements = scan(&artifact);

    let stage0::Stage0Outcome::Handoff(handoff) =
        stage0::run(&mut host, &elements, "https://example/doc.html").unwrap()
    else {
        panic!("expected a handoff");
    };
    assert_eq!(handoff.stage1, b"/*s1*/");
    assert_eq!(handoff.fs.read_path("hello.txt").unwrap(), b"hi");

    let input = stage1::run(&mut host, handoff).unwrap();
    assert_eq!(input.stage2, b"/*s2*/");

    let outcome = stage2::run(&mut host, input).unwrap();
    let stage2::Stage2Outcome::Launched { configuration } = outcome else {
        panic!("expected a launch");
    };

    // The inner init ran once and its exit sentinel did not count as a
    // crash; init.mjs ran after it.
    assert_eq!(host.started, 1);
    assert_eq!(host.init_invoked, 1);
    assert_eq!(configuration.args, vec!["hello"]);
    assert_eq!(configuration.env, vec!["TERM=dumb"]);

    // Descriptor invariants: stdio bound, fd 3 a preopen.
    assert!(matches!(
        configuration.fds[3],
        Some(wah::config::FdBinding::Preopen(_))
    ));
    for fd in 0..3 {
        assert!(configuration.fds[fd].is_some());
    }
}

#[test]
fn external_references_resolve_during_stage1() {
    let payload: Vec<u8> = (0x00..0x10).collect();
    let artifact = build_artifact(
        vec![
            PackFile::External {
                name: "asset",
                url: "https://example/asset",
                realsize: 16,
                attributes: Default::default(),
            },
            PackFile::Inline {
                name: "init.mjs",
                data: b"export default () => {};",
                attributes: Default::default(),
            },
        ],
        None,
    );

    let mut host = StubHost::new();
    host.fetches
        .insert("https://example/asset".to_owned(), payload.clone());

    let elements = scan(&artifact);
    let stage0::Stage0Outcome::Handoff(handoff) =
        stage0::run(&mut host, &elements, "https://example/doc.html").unwrap()
    else {
        panic!("expected a handoff");
    };

    // Not materialised yet.
    assert!(handoff.fs.read_path("asset").is_err());

    let input = stage1::run(&mut host, handoff).unwrap();
    assert_eq!(host.fetch_log, vec!["https://example/asset"]);
    assert_eq!(input.fs.read_path("asset").unwrap(), payload.as_slice());
}

#[test]
fn external_size_mismatch_is_bad_file() {
    let artifact = build_artifact(
        vec![PackFile::External {
            name: "asset",
            url: "https://example/asset",
            realsize: 16,
            attributes: Default::default(),
        }],
        None,
    );

    let mut host = StubHost::new();
    host.fetches
        .insert("https://example/asset".to_owned(), vec![0u8; 4]);

    let elements = scan(&artifact);
    let stage0::Stage0Outcome::Handoff(handoff) =
        stage0::run(&mut host, &elements, "url").unwrap()
    else {
        panic!("expected a handoff");
    };

    assert!(matches!(
        stage1::run(&mut host, handoff),
        Err(BootError::BadFile {
            declared: 16,
            actual: 4,
            ..
        })
    ));
}

#[test]
fn missing_boot_module_terminates_quietly() {
    let artifact = build_artifact(Vec::new(), None);
    let mut elements = scan(&artifact);
    // Raw-scan ids still carry their NUL padding.
    elements.retain(|element| !element.id.trim_matches('\0').starts_with("boot/"));

    let mut host = StubHost::new();
    assert!(matches!(
        stage0::run(&mut host, &elements, "url").unwrap(),
        stage0::Stage0Outcome::Idle
    ));
}

#[test]
fn corrupted_payload_fails_with_bad_file() {
    let artifact = build_artifact(
        vec![PackFile::Inline {
            name: "hello.txt",
            data: b"hi",
            attributes: Default::default(),
        }],
        None,
    );

    let mut elements = scan(&artifact);
    let hello = elements
        .iter_mut()
        .find(|element| element.id.trim_matches('\0') == "hello.txt")
        .unwrap();
    // Three bytes of payload against a header that declares two.
    hello.text = "QUJD".to_owned();

    let mut host = StubHost::new();
    assert!(matches!(
        stage0::run(&mut host, &elements, "url"),
        Err(BootError::BadFile {
            declared: 2,
            actual: 3,
            ..
        })
    ));
}

#[test]
fn missing_stage2_section_is_reported() {
    let kernel = kernel_module();
    // A boot module assembled without a stage-2 payload.
    let boot_wasm = section::prepend(&kernel, &[(section::STAGE1, b"/*s1*/")]).unwrap();

    let mut host = StubHost::new();
    let module = host.compile(&boot_wasm).unwrap();

    let handoff = stage0::Stage1Input {
        boot_wasm,
        module,
        stage1: b"/*s1*/".to_vec(),
        entries: Vec::new(),
        fs: wah::RootFs::new(),
        stage_url: "url".to_owned(),
    };

    assert!(matches!(
        stage1::run(&mut host, handoff),
        Err(BootError::Section(wah::SectionError::MissingStage2))
    ));
}

#[test]
fn missing_init_module_falls_back_with_listing() {
    // No init.mjs in the tree.
    let artifact = build_artifact(
        vec![PackFile::Inline {
            name: "hello.txt",
            data: b"hi",
            attributes: Default::default(),
        }],
        None,
    );

    let mut host = StubHost::new();
    let elements = scan(&artifact);
    let stage0::Stage0Outcome::Handoff(handoff) =
        stage0::run(&mut host, &elements, "url").unwrap()
    else {
        panic!("expected a handoff");
    };
    let input = stage1::run(&mut host, handoff).unwrap();

    let stage2::Stage2Outcome::Fallback(rescue) = stage2::run(&mut host, input).unwrap() else {
        panic!("expected the fallback shell");
    };

    assert!(rescue.error.contains("no init module"));
    let names: Vec<&str> = rescue.listing.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"hello.txt"));
}

#[test]
fn crashing_user_program_falls_back() {
    let artifact = build_artifact(
        vec![PackFile::Inline {
            name: "init.mjs",
            data: b"export default () => {};",
            attributes: Default::default(),
        }],
        None,
    );

    let mut host = StubHost::new();
    host.start_message = Some("RuntimeError: unreachable".to_owned());

    let elements = scan(&artifact);
    let stage0::Stage0Outcome::Handoff(handoff) =
        stage0::run(&mut host, &elements, "url").unwrap()
    else {
        panic!("expected a handoff");
    };
    let input = stage1::run(&mut host, handoff).unwrap();

    let stage2::Stage2Outcome::Fallback(rescue) = stage2::run(&mut host, input).unwrap() else {
        panic!("expected the fallback shell");
    };
    assert!(rescue.error.contains("unreachable"));
    assert_eq!(host.init_invoked, 0);
}

#[test]
fn config_failure_surfaces_partial_progress() {
    // const 1, then an unknown opcode.
    let program = wah::Program {
        words: vec![4, 1, 1, 99, 0],
        data: Vec::new(),
    };
    let artifact = build_artifact(Vec::new(), Some(&program));

    let mut host = StubHost::new();
    let elements = scan(&artifact);
    let stage0::Stage0Outcome::Handoff(handoff) =
        stage0::run(&mut host, &elements, "url").unwrap()
    else {
        panic!("expected a handoff");
    };
    let input = stage1::run(&mut host, handoff).unwrap();

    let stage2::Stage2Outcome::Fallback(rescue) = stage2::run(&mut host, input).unwrap() else {
        panic!("expected the fallback shell");
    };
    assert_eq!(rescue.partial_ops, Some(1));
    assert_eq!(host.started, 0, "no user code runs after a config failure");
}
