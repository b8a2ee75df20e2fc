//! Script loader (C9): resolves a bare `.lua` path, a plain-text `.cmd`
//! manifest, or a `.zip`/`.luaz` archive into an ordered list of
//! `(logical name, source bytes)` pairs, strips comments, and sends each
//! one to the device as a blocking `load`/`compile` request.
//!
//! Ported from `original_source/luatt.py`'s `split_lua_name`,
//! `load_loader_cmd`, `load_luaz`, `find_loader_cmd`, and `cmd_load`.

use std::io::Read;
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::frame::Frame;
use crate::issuer::{self, IssuerError};
use crate::router::Router;
use crate::strip;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}: Loader.cmd not found")]
    NoManifest(String),
    #[error("{0}: multiple Loader.cmd files found")]
    AmbiguousManifest(String),
    #[error("{path}: {source}")]
    Zip {
        path: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error(transparent)]
    Issuer(#[from] IssuerError),
}

/// One resolved script: its logical name and raw (unstripped) source.
pub struct ScriptSource {
    pub name: String,
    pub data: Vec<u8>,
}

/// Split the `NAME=PATH` shorthand. The `=` is only recognized as the
/// shorthand's separator when the left-hand side contains no `/` — that
/// rules out a plain path that happens to contain `=`. Otherwise the name
/// is the path's basename with its final extension removed.
pub fn split_lua_name(s: &str) -> (String, String) {
    if let Some((name, path)) = s.split_once('=') {
        if !name.contains('/') {
            return (name.to_string(), path.to_string());
        }
    }
    let name = Path::new(s)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| s.to_string());
    (name, s.to_string())
}

/// Resolve `arg` into its ordered list of scripts, dispatching on
/// extension: `.zip`/`.luaz` archives, `.cmd` manifests, or a bare
/// (possibly `NAME=PATH`) source file.
pub fn resolve(arg: &str) -> Result<Vec<ScriptSource>, LoaderError> {
    match Path::new(arg).extension().and_then(|e| e.to_str()) {
        Some("zip") | Some("luaz") => resolve_zip(arg),
        Some("cmd") => resolve_manifest(arg),
        _ => {
            let (name, path) = split_lua_name(arg);
            let data = std::fs::read(&path).map_err(|e| LoaderError::Io {
                path: path.clone(),
                source: e,
            })?;
            Ok(vec![ScriptSource { name, data }])
        }
    }
}

/// Per spec.md §7, a single entry failing to read is logged and skipped —
/// the rest of the manifest is still attempted — rather than aborting the
/// whole batch.
fn resolve_manifest(path: &str) -> Result<Vec<ScriptSource>, LoaderError> {
    let text = std::fs::read_to_string(path).map_err(|e| LoaderError::Io {
        path: path.to_string(),
        source: e,
    })?;
    let dir = Path::new(path).parent().unwrap_or_else(|| Path::new(""));
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, rel) = split_lua_name(line);
        let src_path = dir.join(&rel);
        match std::fs::read(&src_path) {
            Ok(data) => out.push(ScriptSource { name, data }),
            Err(e) => warn!("{}: {e}", src_path.display()),
        }
    }
    Ok(out)
}

fn resolve_zip(path: &str) -> Result<Vec<ScriptSource>, LoaderError> {
    let file = std::fs::File::open(path).map_err(|e| LoaderError::Io {
        path: path.to_string(),
        source: e,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| LoaderError::Zip {
        path: path.to_string(),
        source: e,
    })?;

    let loader_name = find_loader_cmd(&mut archive, path)?;
    let loader_dir = Path::new(&loader_name)
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();

    let manifest_text = {
        let mut entry = archive
            .by_name(&loader_name)
            .map_err(|e| LoaderError::Zip {
                path: loader_name.clone(),
                source: e,
            })?;
        let mut buf = String::new();
        entry.read_to_string(&mut buf).map_err(|e| LoaderError::Io {
            path: loader_name.clone(),
            source: e,
        })?;
        buf
    };

    // As in `resolve_manifest`, one unreadable entry is logged and
    // skipped rather than aborting the rest of the archive's manifest.
    let mut out = Vec::new();
    for line in manifest_text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, rel) = split_lua_name(line);
        let entry_name = zip_join(&loader_dir, &rel);
        let mut entry = match archive.by_name(&entry_name) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("{entry_name}: {e}");
                continue;
            }
        };
        let mut data = Vec::new();
        if let Err(e) = entry.read_to_end(&mut data) {
            warn!("{entry_name}: {e}");
            continue;
        }
        out.push(ScriptSource { name, data });
    }
    Ok(out)
}

/// Join a zip-internal directory and a relative path using `/`
/// unconditionally — zip entry names are always `/`-separated regardless
/// of host platform.
fn zip_join(dir: &Path, rel: &str) -> String {
    if dir.as_os_str().is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir.to_string_lossy(), rel)
    }
}

/// Find `Loader.cmd` at the archive root, or the sole candidate exactly
/// one directory level deep. Errors if more than one depth-1 candidate
/// exists, or none at all.
fn find_loader_cmd<R: std::io::Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    label: &str,
) -> Result<String, LoaderError> {
    let mut subdir_candidate: Option<String> = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| LoaderError::Zip {
            path: label.to_string(),
            source: e,
        })?;
        let name = entry.name().to_string();
        if name == "Loader.cmd" {
            return Ok(name);
        }
        let p = Path::new(&name);
        if p.file_name().and_then(|f| f.to_str()) != Some("Loader.cmd") {
            continue;
        }
        // only look one directory level deep
        if p.components().count() != 2 {
            continue;
        }
        if subdir_candidate.is_some() {
            return Err(LoaderError::AmbiguousManifest(label.to_string()));
        }
        subdir_candidate = Some(name);
    }
    subdir_candidate.ok_or_else(|| LoaderError::NoManifest(label.to_string()))
}

/// Resolve `arg`, strip comments from every script, and send a blocking
/// `load` (or `compile`, if `compile` is set) request for each in order.
/// Intermediate reply frames are printed, matching the issuer's normal
/// streamed-output behavior.
pub async fn load(router: &Router, arg: &str, compile: bool) -> Result<(), LoaderError> {
    let scripts = resolve(arg)?;
    let verb = if compile { "compile" } else { "load" };
    for script in scripts {
        let stripped = strip::strip(&script.data);
        issuer::request(
            router,
            verb,
            &[Bytes::from(script.name.into_bytes()), Bytes::from(stripped)],
            print_intermediate,
        )
        .await?;
    }
    Ok(())
}

fn print_intermediate(frame: &Frame) {
    let body: Vec<String> = frame.fields[1..]
        .iter()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect();
    println!("{}", body.join("|"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    #[test]
    fn split_lua_name_recognizes_shorthand_only_without_slash() {
        assert_eq!(
            split_lua_name("a=main.lua"),
            ("a".to_string(), "main.lua".to_string())
        );
        assert_eq!(
            split_lua_name("dir/a=main.lua"),
            ("a=main".to_string(), "dir/a=main.lua".to_string())
        );
        assert_eq!(
            split_lua_name("scripts/main.lua"),
            ("main".to_string(), "scripts/main.lua".to_string())
        );
    }

    #[test]
    fn resolve_bare_lua_file_uses_basename_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.lua");
        std::fs::write(&path, b"print(1)\n").unwrap();

        let scripts = resolve(path.to_str().unwrap()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "hello");
        assert_eq!(scripts[0].data, b"print(1)\n");
    }

    #[test]
    fn resolve_manifest_reads_paths_relative_to_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.lua"), b"print(2)\n").unwrap();
        let manifest = dir.path().join("Loader.cmd");
        std::fs::write(&manifest, "a=main.lua\n\nb=main.lua\n").unwrap();

        let scripts = resolve(manifest.to_str().unwrap()).unwrap();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].name, "a");
        assert_eq!(scripts[1].name, "b");
        assert_eq!(scripts[0].data, b"print(2)\n");
    }

    #[test]
    fn resolve_manifest_skips_unreadable_entry_and_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.lua"), b"print(2)\n").unwrap();
        let manifest = dir.path().join("Loader.cmd");
        std::fs::write(&manifest, "a=missing.lua\nb=main.lua\n").unwrap();

        let scripts = resolve(manifest.to_str().unwrap()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "b");
        assert_eq!(scripts[0].data, b"print(2)\n");
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = ZipWriter::new(cursor);
            let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn zip_loader_finds_root_manifest_and_strips_short_comment() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.luaz");
        let bytes = build_zip(&[
            ("pkg/Loader.cmd", b"a=main.lua\n"),
            ("pkg/main.lua", b"-- c\nprint(1)\n"),
        ]);
        std::fs::write(&zip_path, bytes).unwrap();

        let scripts = resolve(zip_path.to_str().unwrap()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "a");
        let stripped = strip::strip(&scripts[0].data);
        assert_eq!(stripped, b"\nprint(1)\n");
    }

    #[test]
    fn zip_loader_at_archive_root_is_found_directly() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let bytes = build_zip(&[("Loader.cmd", b"a=main.lua\n"), ("main.lua", b"print(1)\n")]);
        std::fs::write(&zip_path, bytes).unwrap();

        let scripts = resolve(zip_path.to_str().unwrap()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].data, b"print(1)\n");
    }

    #[test]
    fn zip_with_two_depth_one_manifests_is_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let bytes = build_zip(&[
            ("a/Loader.cmd", b"x=x.lua\n"),
            ("b/Loader.cmd", b"x=x.lua\n"),
        ]);
        std::fs::write(&zip_path, bytes).unwrap();

        let err = resolve(zip_path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, LoaderError::AmbiguousManifest(_)));
    }

    #[test]
    fn zip_loader_skips_entry_missing_from_archive_and_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let bytes = build_zip(&[
            ("Loader.cmd", b"a=missing.lua\nb=main.lua\n"),
            ("main.lua", b"print(1)\n"),
        ]);
        std::fs::write(&zip_path, bytes).unwrap();

        let scripts = resolve(zip_path.to_str().unwrap()).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].name, "b");
        assert_eq!(scripts[0].data, b"print(1)\n");
    }

    #[test]
    fn zip_missing_manifest_errors() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pkg.zip");
        let bytes = build_zip(&[("main.lua", b"print(1)\n")]);
        std::fs::write(&zip_path, bytes).unwrap();

        let err = resolve(zip_path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, LoaderError::NoManifest(_)));
    }
}
