//! Stage 1: locate the stage-2 payload and pull in external references.

use crate::section;
use crate::vfs::RootFs;

use super::stage0::Stage1Input;
use super::{BootError, BootHost, EntryData, FileEntry};

/// Everything stage 2 needs; all entries are inline by now.
pub struct Stage2Input<M> {
    pub boot_wasm: Vec<u8>,
    pub module: M,
    pub stage2: Vec<u8>,
    pub fs: RootFs,
    pub stage_url: String,
}

pub fn run<H: BootHost>(
    host: &mut H,
    input: Stage1Input<H::Module>,
) -> Result<Stage2Input<H::Module>, BootError> {
    let Stage1Input {
        boot_wasm,
        module,
        stage1: _,
        mut entries,
        mut fs,
        stage_url,
    } = input;

    let stage2 = section::stage2_section(&boot_wasm)?.to_vec();

    resolve_externals(host, &mut entries, &mut fs)?;

    Ok(Stage2Input {
        boot_wasm,
        module,
        stage2,
        fs,
        stage_url,
    })
}

/// Fetch every external reference and write the bytes back so later stages
/// see only inline files. All fetches settle before the first failure is
/// reported; a half-fetched boot would be harder to debug than a late
/// error.
fn resolve_externals<H: BootHost>(
    host: &mut H,
    entries: &mut [FileEntry],
    fs: &mut RootFs,
) -> Result<(), BootError> {
    let mut first_error = None;

    for entry in entries.iter_mut() {
        let EntryData::External { url, realsize } = &entry.data else {
            continue;
        };

        match host.fetch(url) {
            Ok(bytes) => {
                if bytes.len() as u64 != *realsize {
                    first_error.get_or_insert(BootError::BadFile {
                        name: entry.name.clone(),
                        declared: *realsize,
                        actual: bytes.len() as u64,
                    });
                    continue;
                }

                fs.insert_file(&entry.name, bytes.clone())?;
                entry.data = EntryData::Inline(bytes);
            }
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
