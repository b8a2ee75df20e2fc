//! Packs a set of files into a C translation unit: a `Packed_File_t` struct
//! per file, holding its path, base name, size, and byte contents as an
//! octal-escaped string literal.
//!
//! `.lua` sources are run through [`crate::strip`] before packing, matching
//! the loader's own behavior so a packed script matches what would have
//! been sent over the wire had it been loaded live.

use std::fmt::Write as _;
use std::path::Path;

/// One file staged for packing.
pub struct PackedFile {
    pub path: String,
    pub name: String,
    pub c_name: String,
    pub data: Vec<u8>,
}

impl PackedFile {
    /// Load `path` from disk, stripping comments first if it's a `.lua`
    /// file.
    pub fn load(path: &str) -> std::io::Result<Self> {
        let mut data = std::fs::read(path)?;
        if path.ends_with(".lua") {
            data = crate::strip::strip(&data);
        }
        let file_name = Path::new(path)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(file_name.clone());
        Ok(PackedFile {
            path: path.to_string(),
            name,
            c_name: path_to_c_name(&file_name),
            data,
        })
    }
}

/// Replace every run of non-alphanumeric characters in `file_name` with a
/// single underscore, yielding a valid C identifier fragment.
fn path_to_c_name(file_name: &str) -> String {
    let mut out = String::with_capacity(file_name.len());
    let mut in_run = false;
    for ch in file_name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Escape a single byte as it would appear inside a packed-file's string
/// literal: printable ASCII (plus a small set of named escapes) is emitted
/// as-is or via its short escape, everything else as `\ooo` (octal, 3
/// digits).
fn escape_byte(b: u8) -> String {
    match b {
        b'"' => "\\\"".into(),
        b'\'' => "\\'".into(),
        b'?' => "\\?".into(),
        b'\\' => "\\\\".into(),
        0x07 => "\\a".into(),
        0x08 => "\\b".into(),
        0x0c => "\\f".into(),
        b'\n' => "\\n".into(),
        b'\r' => "\\r".into(),
        b'\t' => "\\t".into(),
        0x0b => "\\v".into(),
        0x20..=0x7e => (b as char).to_string(),
        _ => format!("\\{b:03o}"),
    }
}

/// Escape a plain (non-file-content) string for use as a C string literal
/// body, used for the `path`/`name` fields — these are short UTF-8 strings
/// rather than arbitrary file bytes, so non-ASCII is escaped as `\xHH` per
/// byte rather than octal.
fn escape_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\'' => out.push_str("\\'"),
            b'?' => out.push_str("\\?"),
            b'\\' => out.push_str("\\\\"),
            0x07 => out.push_str("\\a"),
            0x08 => out.push_str("\\b"),
            0x0c => out.push_str("\\f"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x0b => out.push_str("\\v"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out
}

/// Render the header (`.h`) translation unit declaring every packed file.
pub fn emit_header(files: &[PackedFile]) -> String {
    let mut out = String::new();
    out.push_str("#ifndef PACKED_FILES_H\n");
    out.push_str("#define PACKED_FILES_H\n\n");
    out.push_str("#include <stddef.h>\n\n");
    out.push_str("#ifdef __cplusplus\n");
    out.push_str("extern \"C\" {\n");
    out.push_str("#endif\n\n");
    out.push_str("struct Packed_File_t {\n");
    out.push_str("    const char* path;\n");
    out.push_str("    const char* name;\n");
    out.push_str("    size_t size;\n");
    out.push_str("    const char* data;\n");
    out.push_str("};\n\n");
    for f in files {
        let _ = writeln!(out, "extern const struct Packed_File_t File_{};", f.c_name);
    }
    out.push('\n');
    out.push_str("#ifdef __cplusplus\n");
    out.push_str("}\n");
    out.push_str("#endif\n");
    out.push_str("#endif\n\n");
    out
}

/// Render the source (`.cpp`) translation unit defining every packed file,
/// including a null-terminated `File_LIST[]` array of pointers.
pub fn emit_source(files: &[PackedFile]) -> String {
    let mut out = String::new();
    out.push_str("#include \"packed_files.h\"\n\n");

    for f in files {
        let _ = writeln!(out, "const struct Packed_File_t File_{} = {{", f.c_name);
        let _ = writeln!(out, "    \"{}\", /* path */", escape_literal(&f.path));
        let _ = writeln!(out, "    \"{}\", /* name */", escape_literal(&f.name));
        let _ = writeln!(out, "    {}, /* size */", f.data.len());

        let mut line = String::from("    \"");
        for &b in &f.data {
            let esc = escape_byte(b);
            line.push_str(&esc);
            if line.len() >= 72 {
                line.push('"');
                out.push_str(&line);
                out.push('\n');
                line = String::from("    \"");
            }
        }
        line.push('"');
        out.push_str(&line);
        out.push('\n');
        out.push_str("};\n\n");
    }

    out.push_str("const struct Packed_File_t* const File_LIST[] = {\n");
    for f in files {
        let _ = writeln!(out, "    &File_{},", f.c_name);
    }
    out.push_str("    NULL,\n");
    out.push_str("};\n");

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_name_replaces_runs_of_non_alnum() {
        assert_eq!(path_to_c_name("my-script.v2.lua"), "my_script_v2_lua");
        assert_eq!(path_to_c_name("plain"), "plain");
        assert_eq!(path_to_c_name("a__b"), "a_b");
    }

    #[test]
    fn escape_byte_uses_named_escapes_and_octal_fallback() {
        assert_eq!(escape_byte(b'A'), "A");
        assert_eq!(escape_byte(b'\n'), "\\n");
        assert_eq!(escape_byte(b'"'), "\\\"");
        assert_eq!(escape_byte(0x00), "\\000");
        assert_eq!(escape_byte(0xff), "\\377");
    }

    #[test]
    fn emit_header_declares_every_file_and_is_idempotent_guarded() {
        let files = vec![PackedFile {
            path: "a/b.lua".into(),
            name: "b".into(),
            c_name: "b_lua".into(),
            data: b"x".to_vec(),
        }];
        let header = emit_header(&files);
        assert!(header.contains("PACKED_FILES_H"));
        assert!(header.contains("extern const struct Packed_File_t File_b_lua;"));
    }

    #[test]
    fn emit_source_wraps_long_data_lines_and_lists_files() {
        let files = vec![PackedFile {
            path: "s.lua".into(),
            name: "s".into(),
            c_name: "s_lua".into(),
            data: vec![b'a'; 200],
        }];
        let source = emit_source(&files);
        assert!(source.contains("const struct Packed_File_t File_s_lua = {"));
        assert!(source.contains("200, /* size */"));
        assert!(source.contains("&File_s_lua,"));
        assert!(source.contains("NULL,"));
        // line wrapping: no single data line should run unreasonably long
        for line in source.lines() {
            if line.trim_start().starts_with('"') && line.contains('a') {
                assert!(line.len() < 90, "line too long: {line:?}");
            }
        }
    }
}
