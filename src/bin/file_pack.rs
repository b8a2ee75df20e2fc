//! CLI wrapper around [`luatt::packer`]: pack a list of files into a C
//! header/source pair.
//!
//! ```text
//! file_pack --h=include/packed_files.h --cpp=src/packed_files.cpp FILE...
//! ```

use std::fs;
use std::process::ExitCode;

use luatt::packer::{emit_header, emit_source, PackedFile};

fn main() -> ExitCode {
    let mut header_path: Option<String> = None;
    let mut source_path: Option<String> = None;
    let mut inputs: Vec<String> = Vec::new();

    for arg in std::env::args().skip(1) {
        if let Some(rest) = arg.strip_prefix("--h=") {
            header_path = Some(rest.to_string());
        } else if let Some(rest) = arg.strip_prefix("--cpp=") {
            source_path = Some(rest.to_string());
        } else {
            inputs.push(arg);
        }
    }

    let mut files = Vec::with_capacity(inputs.len());
    for path in &inputs {
        if !std::path::Path::new(path).is_file() {
            eprintln!("Can't find file {path}.");
            return ExitCode::from(2);
        }
        match PackedFile::load(path) {
            Ok(f) => files.push(f),
            Err(e) => {
                eprintln!("error reading {path}: {e}");
                return ExitCode::from(2);
            }
        }
    }

    let header = emit_header(&files);
    let source = emit_source(&files);

    match header_path {
        Some(path) => {
            if let Err(e) = fs::write(&path, header) {
                eprintln!("error writing {path}: {e}");
                return ExitCode::from(2);
            }
        }
        None => print!("{header}"),
    }

    match source_path {
        Some(path) => {
            if let Err(e) = fs::write(&path, source) {
                eprintln!("error writing {path}: {e}");
                return ExitCode::from(2);
            }
        }
        None => print!("{source}"),
    }

    ExitCode::SUCCESS
}
