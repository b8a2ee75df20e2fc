//! Lua comment/whitespace stripping that preserves newline count.
//!
//! Ported behaviorally from the original's single MULTILINE regex
//! (`'...'|"..."|[ \t]*(--)?\[=*\[...\]=*\][ \t]*|[ \t]*--...$|^[ \t]+|[ \t]+$|
//! [ \t]{2,}`) as an explicit left-to-right scanner rather than one composite
//! regex. Note that the comment/long-bracket alternative's `[ \t]*` on
//! either side folds any adjacent whitespace into *that* match rather than
//! letting it collapse on its own — see `consume_bracket_or_comment` below.

/// Strip comments from Lua source, collapsing runs of whitespace, while
/// preserving every `\n` byte in the input.
pub fn strip(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    let n = src.len();
    let mut at_line_start = true;

    while i < n {
        let b = src[i];

        if b == b' ' || b == b'\t' {
            let ws_start = i;
            while i < n && (src[i] == b' ' || src[i] == b'\t') {
                i += 1;
            }
            if i >= n || src[i] == b'\n' {
                // Trailing whitespace on the line (or a blank line's
                // tail): dropped unconditionally.
                continue;
            }
            if is_dash_comment_start(src, i) || long_bracket_level(src, i).is_some() {
                // This run directly precedes a comment or a long-bracket
                // literal; fold it into that token's own match instead of
                // collapsing it here.
                i = consume_bracket_or_comment(src, i, &src[ws_start..i], &mut out);
                at_line_start = false;
                continue;
            }
            if !at_line_start {
                out.push(b' ');
            }
            at_line_start = false;
            continue;
        }

        at_line_start = false;

        match b {
            b'\n' => {
                out.push(b'\n');
                i += 1;
                at_line_start = true;
            }
            b'\'' | b'"' => {
                let quote = b;
                let start = i;
                i += 1;
                while i < n {
                    if src[i] == b'\\' && i + 1 < n {
                        i += 2;
                        continue;
                    }
                    if src[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                out.extend_from_slice(&src[start..i]);
            }
            b'-' if is_dash_comment_start(src, i) => {
                i = consume_bracket_or_comment(src, i, b"", &mut out);
            }
            b'[' if long_bracket_level(src, i).is_some() => {
                i = consume_bracket_or_comment(src, i, b"", &mut out);
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    out
}

fn is_dash_comment_start(src: &[u8], i: usize) -> bool {
    src.get(i) == Some(&b'-') && src.get(i + 1) == Some(&b'-')
}

/// Consume a long comment (`--[=*[...]=*]`), a bare long-bracket literal
/// (`[=*[...]=*]`), or — if `i` starts a `--` not followed by a valid
/// long-bracket opener — a short comment running to end of line. `i` points
/// at the first byte of the token (the `-` of `--`, or the `[`); `leading_ws`
/// is whitespace already scanned past that belongs to this token's match.
///
/// Mirrors the original regex's `[ \t]*(--)?\[=*\[...\]=*\][ \t]*` /
/// `[ \t]*(--)...$` alternatives: a comment's surrounding whitespace is
/// swallowed along with it (dropped, for a short comment; collapsed into
/// the body's own newline-or-space rule, for a long one), while a bare
/// literal's surrounding whitespace is reproduced verbatim together with
/// it, since the whole match is emitted unchanged.
///
/// Returns the index just past the consumed token.
fn consume_bracket_or_comment(src: &[u8], i: usize, leading_ws: &[u8], out: &mut Vec<u8>) -> usize {
    let n = src.len();
    let is_dash = src[i] == b'-';
    let bracket_at = if is_dash { i + 2 } else { i };

    let Some(level) = long_bracket_level(src, bracket_at) else {
        // "--" not followed by a valid long-bracket opener: a short
        // comment, collapsed (along with any leading whitespace) to
        // nothing, up to (not including) the line's terminating '\n'.
        let mut end = i;
        while end < n && src[end] != b'\n' {
            end += 1;
        }
        return end;
    };

    let open_len = if is_dash { 2 } else { 0 } + 1 + level + 1;
    let close = find_long_bracket_close(src, i + open_len, level);
    let mut end = close.unwrap_or(n);
    // Trailing `[ \t]*` absorbed into the same match.
    while end < n && (src[end] == b' ' || src[end] == b'\t') {
        end += 1;
    }

    if is_dash {
        let body = &src[i..end];
        let newlines = body.iter().filter(|&&c| c == b'\n').count();
        if newlines == 0 {
            out.push(b' ');
        } else {
            out.extend(std::iter::repeat(b'\n').take(newlines));
        }
    } else {
        out.extend_from_slice(leading_ws);
        out.extend_from_slice(&src[i..end]);
    }

    end
}

/// If `src[at..]` begins a long-bracket opener `[=*[`, return the number of
/// `=` signs. `at` must point at the first `[`.
fn long_bracket_level(src: &[u8], at: usize) -> Option<usize> {
    if src.get(at) != Some(&b'[') {
        return None;
    }
    let mut j = at + 1;
    let mut level = 0;
    while src.get(j) == Some(&b'=') {
        level += 1;
        j += 1;
    }
    if src.get(j) == Some(&b'[') {
        Some(level)
    } else {
        None
    }
}

/// Find the index just past a matching `]=*]` closer with the given level,
/// searching from `from`. Returns `None` if unterminated (runs to EOF).
fn find_long_bracket_close(src: &[u8], from: usize, level: usize) -> Option<usize> {
    let n = src.len();
    let mut i = from;
    while i < n {
        if src[i] == b']' {
            let mut j = i + 1;
            let mut eqs = 0;
            while src.get(j) == Some(&b'=') {
                eqs += 1;
                j += 1;
            }
            if eqs == level && src.get(j) == Some(&b']') {
                return Some(j + 1);
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(src: &str) -> String {
        String::from_utf8(strip(src.as_bytes())).unwrap()
    }

    #[test]
    fn newline_count_preserved_for_assorted_inputs() {
        let samples = [
            "",
            "\n\n\n",
            "print(1)\n",
            "-- comment\nprint(1)\n",
            "--[[ long\ncomment ]]\nprint(1)\n",
            "x = '-- not a comment'\n",
            "  leading\ntrailing  \nmid   dle\n",
            "a = [==[ raw\n]] still in ]==]\nb = 2\n",
        ];
        for src in samples {
            let stripped = strip(src.as_bytes());
            let count_in = src.bytes().filter(|&b| b == b'\n').count();
            let count_out = stripped.iter().filter(|&&b| b == b'\n').count();
            assert_eq!(count_out, count_in, "input: {src:?}");
        }
    }

    #[test]
    fn preserves_string_literals() {
        // Lone (non-repeated) whitespace runs around `=` don't precede a
        // comment or long-bracket opener, so they survive as single spaces —
        // only runs of 2+ whitespace bytes collapse.
        assert_eq!(s("x = \"-- not a comment\"\n"), "x = \"-- not a comment\"\n");
    }

    #[test]
    fn short_comment_dropped_terminator_kept() {
        assert_eq!(s("-- c\nprint(1)\n"), "\nprint(1)\n");
    }

    #[test]
    fn long_comment_with_no_newlines_becomes_one_space() {
        let out = s("a--[[x]]b\n");
        assert_eq!(out, "a b\n");
    }

    #[test]
    fn long_comment_with_newlines_collapses_to_just_those_newlines() {
        let out = strip(b"a--[[\n\n]]b\n");
        assert_eq!(out, b"a\n\nb\n");
    }

    #[test]
    fn mid_line_whitespace_collapses_to_one_space() {
        assert_eq!(s("a    b\n"), "a b\n");
    }

    #[test]
    fn leading_and_trailing_whitespace_trimmed() {
        assert_eq!(s("   a = 1   \n"), "a = 1\n");
    }

    #[test]
    fn long_bracket_literal_preserved_verbatim() {
        assert_eq!(s("x = [==[hi]==]\n"), "x=[==[hi]==]\n");
    }

    #[test]
    fn leading_whitespace_folds_into_long_comment_match() {
        // The run of spaces before `--[[c]]` is part of the comment's own
        // match, not a separate whitespace collapse, so it contributes a
        // single space rather than surviving as two.
        assert_eq!(s("a  --[[c]]b\n"), "a b\n");
    }

    #[test]
    fn leading_whitespace_before_bare_long_bracket_literal_is_kept_verbatim() {
        assert_eq!(s("a  [[lit]]b\n"), "a  [[lit]]b\n");
    }

    #[test]
    fn leading_whitespace_before_short_comment_vanishes_with_it() {
        assert_eq!(s("a  -- comment\nb\n"), "a\nb\n");
    }

    #[test]
    fn zip_loader_example_short_comment() {
        // from the zip-loader end-to-end scenario
        assert_eq!(strip(b"-- c\nprint(1)\n"), b"\nprint(1)\n");
    }
}
