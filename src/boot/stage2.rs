//! Stage 2: evaluate the configuration, bind descriptors, run init.
//!
//! Failures past this point do not tear the page down silently: the
//! fallback shell gets the current filesystem listing and the error, so
//! the user can inspect what the boot got done.

use crate::config::{Configuration, Evaluator, FdBinding, Program};
use crate::section;
use crate::vfs::RootFs;

use super::stage1::Stage2Input;
use super::{BootError, BootHost, BOOT_INIT, EXIT_SENTINEL, INIT_MODULE};

/// What the fallback shell renders.
#[derive(Debug)]
pub struct Rescue {
    /// Why boot fell over.
    pub error: String,
    /// Files present at the time of the failure.
    pub listing: Vec<(String, usize)>,
    /// Operand slots the configuration program managed to fill before
    /// aborting, if it was the program that failed.
    pub partial_ops: Option<usize>,
}

pub enum Stage2Outcome {
    /// Init ran; the launched process owns the page now.
    Launched { configuration: Configuration },
    /// Boot fell over; show the rescue view.
    Fallback(Rescue),
}

pub fn run<H: BootHost>(
    host: &mut H,
    input: Stage2Input<H::Module>,
) -> Result<Stage2Outcome, BootError> {
    let Stage2Input {
        boot_wasm,
        module: _,
        stage2: _,
        mut fs,
        stage_url: _,
    } = input;

    // An absent configuration section is an empty program; a duplicated one
    // is refused before any user code runs.
    let program = match section::unique_section(&boot_wasm, section::WASI_CONFIG)? {
        Some(bytes) => Program::from_section_bytes(bytes).map_err(|err| {
            BootError::Compile(format!("configuration section: {err}"))
        })?,
        None => Program::empty(),
    };

    let outcome = match Evaluator::new(&program, &boot_wasm, &mut fs).run() {
        Ok(outcome) => outcome,
        Err(failure) => {
            let filled = failure.partial_ops.len() - crate::config::RESERVED_OPS;
            return Ok(Stage2Outcome::Fallback(Rescue {
                error: failure.to_string(),
                listing: fs.listing(),
                partial_ops: Some(filled),
            }));
        }
    };

    let mut configuration = match Configuration::from_ops(&outcome.ops) {
        Ok(configuration) => configuration,
        Err(err) => {
            return Ok(Stage2Outcome::Fallback(Rescue {
                error: err.to_string(),
                listing: fs.listing(),
                partial_ops: Some(outcome.executed),
            }))
        }
    };

    // Lay out proc/0 before binding descriptors so the stdio defaults open
    // the conventional files.
    let setup = crate::vfs::process_zero_layout(
        &mut fs,
        &configuration.args,
        &configuration.env,
        None,
    )
    .map_err(BootError::from)
    .and_then(|()| bind_default_fds(&mut configuration, &mut fs));

    if let Err(err) = setup {
        return Ok(Stage2Outcome::Fallback(Rescue {
            error: err.to_string(),
            listing: fs.listing(),
            partial_ops: None,
        }));
    }

    // The inner init binary signals end-of-boot; the sentinel string is a
    // clean exit, not a failure.
    match run_boot_init(host, &configuration, &mut fs) {
        Ok(()) => {}
        Err(err) => {
            return Ok(Stage2Outcome::Fallback(Rescue {
                error: err.to_string(),
                listing: fs.listing(),
                partial_ops: None,
            }))
        }
    }

    let init_source = match fs.read_path(INIT_MODULE) {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return Ok(Stage2Outcome::Fallback(Rescue {
                error: BootError::NoInitModule.to_string(),
                listing: fs.listing(),
                partial_ops: None,
            }))
        }
    };

    match host.invoke_init(&init_source, &configuration) {
        Ok(()) => {}
        Err(message) if message == EXIT_SENTINEL => {}
        Err(message) => {
            return Ok(Stage2Outcome::Fallback(Rescue {
                error: BootError::UserProgramCrash(message).to_string(),
                listing: fs.listing(),
                partial_ops: None,
            }))
        }
    }

    Ok(Stage2Outcome::Launched { configuration })
}

/// Descriptor invariants: 0..2 are stdio open files, 3 is the root preopen.
/// Slots the configuration program left unbound get the defaults.
fn bind_default_fds(
    configuration: &mut Configuration,
    fs: &mut RootFs,
) -> Result<(), BootError> {
    if configuration.fds.len() < 4 {
        configuration.fds.resize(4, None);
    }

    for fd in 0..3 {
        if configuration.fds[fd].is_none() {
            let path = format!("proc/0/fd/{fd}");
            let node = match fs.lookup(&path) {
                Ok(node) => node,
                Err(_) => fs.insert_file(&path, Vec::new())?,
            };
            configuration.fds[fd] = Some(FdBinding::Open(fs.open_file(node)?));
        }
    }

    if configuration.fds[3].is_none() {
        let root = fs.root();
        configuration.fds[3] = Some(FdBinding::Preopen(fs.preopen("/", root)?));
    }

    Ok(())
}

fn run_boot_init<H: BootHost>(
    host: &mut H,
    configuration: &Configuration,
    fs: &mut RootFs,
) -> Result<(), BootError> {
    let init_wasm = fs
        .read_path(BOOT_INIT)
        .map_err(|_| BootError::NoBootExecutable)?
        .to_vec();

    let module = host.compile(&init_wasm)?;

    match host.start(&module, configuration, fs) {
        Ok(()) => Ok(()),
        Err(message) if message == EXIT_SENTINEL => Ok(()),
        Err(message) => Err(BootError::UserProgramCrash(message)),
    }
}
