//! wah CLI - build and inspect polyglot documents
//!
//! Commands:
//!   wah build              - assemble the artifact from a project file
//!   wah rebuild <file>     - re-emit an artifact from a saved document
//!   wah inspect <file>     - list sections and embedded files

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use wah::boot::EntryData;
use wah::config::Assembler;
use wah::packer::{self, BuildSpec, PackFile};
use wah::project::Project;
use wah::section;
use wah::tar::EntryAttributes;

#[derive(Parser)]
#[command(name = "wah")]
#[command(about = "Polyglot wasm/html/tar document packer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the polyglot artifact described by a project file
    Build {
        /// Path of the project file, default ./WahDocument.toml
        #[arg(long)]
        project: Option<PathBuf>,

        /// Output path, overrides the project file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Re-emit an artifact from a document a browser saved back to disk
    Rebuild {
        #[arg(long)]
        project: Option<PathBuf>,

        /// The saved document
        file: PathBuf,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List the sections and embedded files of an artifact
    Inspect { file: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { project, out } => build_command(project.as_deref(), out),
        Commands::Rebuild { project, file, out } => rebuild_command(project.as_deref(), &file, out),
        Commands::Inspect { file } => inspect_command(&file),
    }
}

fn build_command(project: Option<&std::path::Path>, out: Option<PathBuf>) -> anyhow::Result<()> {
    let project = Project::load(project)
        .map_err(|err| anyhow::anyhow!("failed to load project: {err}"))?;

    let wasm = std::fs::read(&project.machine.kernel)?;
    let stage0_script = std::fs::read(&project.machine.stage0_script)?;
    let stage1 = std::fs::read(&project.machine.stage1)?;
    let stage2 = std::fs::read(&project.machine.stage2)?;
    let stage1_html = project
        .machine
        .stage1_html
        .as_ref()
        .map(std::fs::read)
        .transpose()?;
    let wasm_bindgen = project
        .machine
        .wasm_bindgen
        .as_ref()
        .map(std::fs::read)
        .transpose()?;

    let tree = collect_roots(&project.document.root)?;
    let files = tree
        .iter()
        .map(|(name, data)| PackFile::Inline {
            name: name.as_str(),
            data: data.as_slice(),
            attributes: EntryAttributes::default(),
        })
        .collect();

    let config = Assembler::standard(&project.machine.args, &project.machine.env);

    let artifact = packer::build(&BuildSpec {
        wasm: &wasm,
        stage0_script: &stage0_script,
        stage1: &stage1,
        stage1_html: stage1_html.as_deref(),
        stage2: &stage2,
        config: Some(&config),
        wasm_bindgen: wasm_bindgen.as_deref(),
        files,
    })?;

    let out = out
        .or(project.document.out)
        .unwrap_or_else(|| PathBuf::from("wah-document.html"));
    std::fs::write(&out, &artifact)?;
    eprintln!("{} bytes -> {}", artifact.len(), out.display());

    Ok(())
}

/// Walk the configured root directories into `(name, bytes)` pairs.
fn collect_roots(roots: &[PathBuf]) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut tree = Vec::new();

    for root in roots {
        for entry in walkdir::WalkDir::new(root).same_file_system(true) {
            let entry = entry?;
            if !entry.metadata()?.is_file() {
                continue;
            }

            let Ok(path) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Some(name) = path.to_str() else {
                continue;
            };

            tree.push((name.to_owned(), std::fs::read(entry.path())?));
        }
    }

    Ok(tree)
}

fn rebuild_command(
    project: Option<&std::path::Path>,
    file: &std::path::Path,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    let project = Project::load(project)
        .map_err(|err| anyhow::anyhow!("failed to load project: {err}"))?;
    let stage0_script = std::fs::read(&project.machine.stage0_script)?;

    let saved = std::fs::read_to_string(file)?;
    let elements = packer::scan_document(&saved);
    let entries = wah::boot::stage0::decode_scan(&elements)?;

    // The embedded boot module carries the kernel and the stage payloads;
    // taking it apart routes the rebuild through the same path as a build.
    let boot = entries
        .iter()
        .find(|entry| entry.name == wah::boot::BOOT_MODULE)
        .and_then(|entry| match &entry.data {
            EntryData::Inline(bytes) => Some(bytes.clone()),
            EntryData::External { .. } => None,
        })
        .ok_or_else(|| anyhow::anyhow!("saved document carries no boot module"))?;

    let stage1 = section::unique_section(&boot, section::STAGE1)?
        .ok_or_else(|| anyhow::anyhow!("boot module carries no stage1 section"))?
        .to_vec();
    let stage2 = section::stage2_section(&boot)?.to_vec();
    let stage1_html = section::unique_section(&boot, section::STAGE1_HTML)?.map(<[u8]>::to_vec);
    let wasm_bindgen = section::unique_section(&boot, section::WASM_BINDGEN)?.map(<[u8]>::to_vec);
    let config = section::unique_section(&boot, section::WASI_CONFIG)?
        .map(wah::config::Program::from_section_bytes)
        .transpose()
        .map_err(|err| anyhow::anyhow!("configuration section: {err}"))?;

    // The kernel alone, so the rebuilt boot module does not nest the old
    // stage sections twice.
    let kernel = strip_stage_sections(&boot)?;

    let mut files: Vec<(String, Vec<u8>, Option<(String, u64)>)> = Vec::new();
    for entry in &entries {
        if entry.name == wah::boot::BOOT_MODULE || entry.name == wah::boot::BOOT_INIT {
            continue;
        }
        match &entry.data {
            EntryData::Inline(bytes) => files.push((entry.name.clone(), bytes.clone(), None)),
            EntryData::External { url, realsize } => files.push((
                entry.name.clone(),
                Vec::new(),
                Some((url.clone(), *realsize)),
            )),
        }
    }

    let pack_files = files
        .iter()
        .map(|(name, data, external)| match external {
            None => PackFile::Inline {
                name: name.as_str(),
                data: data.as_slice(),
                attributes: EntryAttributes::default(),
            },
            Some((url, realsize)) => PackFile::External {
                name: name.as_str(),
                url: url.as_str(),
                realsize: *realsize,
                attributes: EntryAttributes::default(),
            },
        })
        .collect();

    let artifact = packer::build(&BuildSpec {
        wasm: &kernel,
        stage0_script: &stage0_script,
        stage1: &stage1,
        stage1_html: stage1_html.as_deref(),
        stage2: &stage2,
        config: config.as_ref(),
        wasm_bindgen: wasm_bindgen.as_deref(),
        files: pack_files,
    })?;

    let out = out.unwrap_or_else(|| PathBuf::from("wah-rebuilt.html"));
    std::fs::write(&out, &artifact)?;
    eprintln!("{} bytes -> {}", artifact.len(), out.display());

    Ok(())
}

/// Drop the stage sections from a boot module, leaving the kernel.
fn strip_stage_sections(boot: &[u8]) -> anyhow::Result<Vec<u8>> {
    use wasm_encoder::{Module, RawSection};
    use wasmparser::{Parser, Payload};

    let stage_names = [
        section::STAGE0,
        section::STAGE1_HTML,
        section::STAGE1,
        section::STAGE2,
        section::WASI_CONFIG,
        section::WASM_BINDGEN,
    ];

    let mut encoder = Module::new();
    for payload in Parser::new(0).parse_all(boot) {
        let payload = payload?;
        if let Payload::CustomSection(reader) = &payload {
            if stage_names.contains(&reader.name()) {
                continue;
            }
        }
        if let Some((id, range)) = payload.as_section() {
            encoder.section(&RawSection {
                id,
                data: &boot[range],
            });
        }
    }

    Ok(encoder.finish())
}

fn inspect_command(file: &std::path::Path) -> anyhow::Result<()> {
    let artifact = std::fs::read(file)?;
    let unpacked = packer::unbuild(&artifact)?;

    println!("module: {} bytes", unpacked.module.len());
    for name in [
        section::STAGE0,
        section::STAGE1_HTML,
        section::STAGE1,
        section::STAGE2,
        section::WASI_CONFIG,
        section::WASM_BINDGEN,
    ] {
        for data in section::custom_sections(&unpacked.module, name)? {
            println!("  section {name}: {} bytes", data.len());
        }
    }

    println!("files:");
    for file in &unpacked.files {
        match &file.data {
            EntryData::Inline(bytes) => {
                println!("  {} ({} bytes)", file.name, bytes.len());
            }
            EntryData::External { url, realsize } => {
                println!("  {} -> {url} ({realsize} bytes external)", file.name);
            }
        }
    }

    Ok(())
}
