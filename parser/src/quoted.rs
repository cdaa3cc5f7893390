/// Quoted literal bodies: the escape table, interpolation splitting and
/// heredoc indentation handling.
///
/// The lexer only finds where a literal ends; the raw text between the
/// delimiters is decoded here. Double-quoted strings, `%Q`, and plain or
/// `"`-quoted heredocs go through [`interpolate`]; single-quoted strings and
/// `%q` through [`unescape_single`].
use crate::span::Pos;
use crate::token::StrPart;

/// Decode the escape sequence whose first byte (the one after the
/// backslash) is at `src[i]`. Returns the produced bytes and the index just
/// past the sequence.
pub fn decode_escape(src: &[u8], i: usize) -> Result<(Vec<u8>, usize), &'static str> {
    let Some(&c) = src.get(i) else {
        return Err("unterminated escape sequence");
    };
    let byte = |b: u8| Ok((vec![b], i + 1));
    match c {
        b'\n' => Ok((Vec::new(), i + 1)),
        b'n' => byte(b'\n'),
        b't' => byte(b'\t'),
        b'r' => byte(b'\r'),
        b'e' => byte(0x1b),
        b's' => byte(b' '),
        b'a' => byte(0x07),
        b'b' => byte(0x08),
        b'f' => byte(0x0c),
        b'v' => byte(0x0b),
        b'0'..=b'7' => {
            let mut value: u32 = 0;
            let mut j = i;
            while j < src.len() && j < i + 3 && (b'0'..=b'7').contains(&src[j]) {
                value = value * 8 + u32::from(src[j] - b'0');
                j += 1;
            }
            Ok((vec![(value & 0xff) as u8], j))
        }
        b'x' => {
            let mut value: u32 = 0;
            let mut j = i + 1;
            while j < src.len() && j < i + 3 && src[j].is_ascii_hexdigit() {
                value = value * 16 + hex_value(src[j]);
                j += 1;
            }
            if j == i + 1 {
                return Err("invalid hex escape");
            }
            Ok((vec![value as u8], j))
        }
        b'u' => decode_unicode(src, i + 1),
        b'M' => {
            if src.get(i + 1) != Some(&b'-') {
                return Err("invalid meta escape");
            }
            let (b, next) = escaped_char(src, i + 2)?;
            Ok((vec![b | 0x80], next))
        }
        b'C' => {
            if src.get(i + 1) != Some(&b'-') {
                return Err("invalid control escape");
            }
            let (b, next) = escaped_char(src, i + 2)?;
            Ok((vec![control(b)], next))
        }
        b'c' => {
            let (b, next) = escaped_char(src, i + 1)?;
            Ok((vec![control(b)], next))
        }
        _ => {
            // Unknown escapes stand for the character itself.
            let len = utf8_len(c);
            let end = (i + len).min(src.len());
            Ok((src[i..end].to_vec(), end))
        }
    }
}

/// The single byte operand of `\M-`, `\C-` and `\c`, which may itself be
/// an escape (`\M-\C-x`).
fn escaped_char(src: &[u8], i: usize) -> Result<(u8, usize), &'static str> {
    match src.get(i) {
        None => Err("unterminated escape sequence"),
        Some(b'\\') => {
            let (bytes, next) = decode_escape(src, i + 1)?;
            match bytes.as_slice() {
                [b] => Ok((*b, next)),
                _ => Err("invalid escape operand"),
            }
        }
        Some(&b) => Ok((b, i + 1)),
    }
}

fn control(b: u8) -> u8 {
    if b == b'?' { 0x7f } else { b & 0x9f }
}

fn hex_value(b: u8) -> u32 {
    match b {
        b'0'..=b'9' => u32::from(b - b'0'),
        b'a'..=b'f' => u32::from(b - b'a' + 10),
        _ => u32::from(b - b'A' + 10),
    }
}

fn decode_unicode(src: &[u8], i: usize) -> Result<(Vec<u8>, usize), &'static str> {
    let (digits, next) = if src.get(i) == Some(&b'{') {
        let close = src[i..]
            .iter()
            .position(|&b| b == b'}')
            .ok_or("unterminated unicode escape")?;
        (&src[i + 1..i + close], i + close + 1)
    } else {
        let end = (i + 4).min(src.len());
        (&src[i..end], end)
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err("invalid unicode escape");
    }
    let value = digits.iter().fold(0u32, |acc, &d| acc * 16 + hex_value(d));
    let ch = char::from_u32(value).ok_or("invalid unicode escape")?;
    let mut buf = [0u8; 4];
    Ok((ch.encode_utf8(&mut buf).as_bytes().to_vec(), next))
}

fn utf8_len(first: u8) -> usize {
    match first {
        0xf0..=0xff => 4,
        0xe0..=0xef => 3,
        0xc0..=0xdf => 2,
        _ => 1,
    }
}

/// Decode the body of a single-quoted literal: only `\\` and an escaped
/// closing delimiter are special.
pub fn unescape_single(raw: &str, close: u8) -> Vec<u8> {
    let src = raw.as_bytes();
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] == b'\\' && matches!(src.get(i + 1), Some(&b) if b == b'\\' || b == close) {
            out.push(src[i + 1]);
            i += 2;
        } else {
            out.push(src[i]);
            i += 1;
        }
    }
    out
}

/// Error from [`interpolate`]: message and position inside the literal.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteError {
    pub message: &'static str,
    pub pos: Pos,
}

/// Decode a double-quoted body into literal and code parts. `base` is the
/// position of the first byte of `raw` in the source file.
pub fn interpolate(raw: &str, base: Pos) -> Result<Vec<StrPart>, QuoteError> {
    let src = raw.as_bytes();
    let mut parts = Vec::new();
    let mut lit = Vec::new();
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'\\' => {
                let (bytes, next) = decode_escape(src, i + 1).map_err(|message| QuoteError {
                    message,
                    pos: advance(base, &src[..i]),
                })?;
                lit.extend(bytes);
                i = next;
            }
            b'#' if src.get(i + 1) == Some(&b'{') => {
                let start = i + 2;
                let end = matching_brace(src, start).ok_or(QuoteError {
                    message: "unterminated interpolation",
                    pos: advance(base, &src[..i]),
                })?;
                flush(&mut parts, &mut lit);
                parts.push(StrPart::Code {
                    source: raw[start..end].to_string(),
                    pos: advance(base, &src[..start]),
                });
                i = end + 1;
            }
            b'#' if matches!(src.get(i + 1), Some(b'@') | Some(b'$')) => {
                let start = i + 1;
                let mut end = start + 1;
                if src.get(end) == Some(&b'@') {
                    end += 1;
                }
                let name_start = end;
                while end < src.len() && (src[end].is_ascii_alphanumeric() || src[end] == b'_') {
                    end += 1;
                }
                if end == name_start || src[name_start].is_ascii_digit() {
                    lit.push(b'#');
                    i += 1;
                    continue;
                }
                flush(&mut parts, &mut lit);
                parts.push(StrPart::Code {
                    source: raw[start..end].to_string(),
                    pos: advance(base, &src[..start]),
                });
                i = end;
            }
            b => {
                lit.push(b);
                i += 1;
            }
        }
    }
    flush(&mut parts, &mut lit);
    Ok(parts)
}

fn flush(parts: &mut Vec<StrPart>, lit: &mut Vec<u8>) {
    if !lit.is_empty() {
        parts.push(StrPart::Lit(std::mem::take(lit)));
    }
}

/// Index of the `}` closing an interpolation whose code starts at `start`.
/// Nested braces and quoted strings inside the code are skipped.
pub fn matching_brace(src: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i < src.len() {
        match src[i] {
            b'{' => depth += 1,
            b'}' if depth == 0 => return Some(i),
            b'}' => depth -= 1,
            b'\\' => i += 1,
            q @ (b'"' | b'\'') => {
                i += 1;
                while i < src.len() && src[i] != q {
                    if src[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Position reached after reading `consumed` starting at `base`.
pub fn advance(base: Pos, consumed: &[u8]) -> Pos {
    let mut pos = base;
    for &b in consumed {
        pos.offset += 1;
        if b == b'\n' {
            pos.line += 1;
            pos.column = 1;
        } else {
            pos.column += 1;
        }
    }
    pos
}

/// Join literal parts; `None` when any part is code.
pub fn plain(parts: &[StrPart]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for part in parts {
        match part {
            StrPart::Lit(bytes) => out.extend_from_slice(bytes),
            StrPart::Code { .. } => return None,
        }
    }
    Some(out)
}

/// Remove the common leading indentation of a squiggly heredoc body.
/// Whitespace-only lines do not count towards the minimum; tabs advance
/// to the next multiple of eight columns.
pub fn strip_common_indent(body: &str) -> String {
    let width = |line: &str| {
        let mut col = 0;
        for c in line.chars() {
            match c {
                ' ' => col += 1,
                '\t' => col = (col / 8 + 1) * 8,
                _ => break,
            }
        }
        col
    };
    let min = body
        .split_inclusive('\n')
        .filter(|line| !line.trim().is_empty())
        .map(width)
        .min()
        .unwrap_or(0);

    let mut out = String::with_capacity(body.len());
    for line in body.split_inclusive('\n') {
        let mut col = 0;
        let mut cut = 0;
        for (idx, c) in line.char_indices() {
            if col >= min {
                break;
            }
            match c {
                ' ' => col += 1,
                '\t' => {
                    let next = (col / 8 + 1) * 8;
                    if next > min {
                        break;
                    }
                    col = next;
                }
                _ => break,
            }
            cut = idx + 1;
        }
        out.push_str(&line[cut..]);
    }
    out
}

/// Render bytes as the inside of a double-quoted literal that decodes back
/// to the same bytes. The escapes used are also valid in a GNU `as`
/// `.ascii` directive.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            b'#' => out.push_str("\\043"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\{b:03o}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esc(s: &str) -> Vec<u8> {
        decode_escape(s.as_bytes(), 0).unwrap().0
    }

    // ── Escape table ──────────────────────────────────────────

    #[test]
    fn simple_escapes() {
        assert_eq!(esc("n"), b"\n");
        assert_eq!(esc("t"), b"\t");
        assert_eq!(esc("r"), b"\r");
        assert_eq!(esc("\\"), b"\\");
        assert_eq!(esc("e"), vec![27]);
    }

    #[test]
    fn unknown_escape_is_the_letter() {
        assert_eq!(esc("q"), b"q");
        assert_eq!(esc("\""), b"\"");
    }

    #[test]
    fn meta_and_control() {
        assert_eq!(esc("M-a"), vec![b'a' | 0x80]);
        assert_eq!(esc("C-a"), vec![1]);
        assert_eq!(esc("ca"), vec![1]);
        assert_eq!(esc("M-\\C-a"), vec![0x81]);
        assert_eq!(esc("C-?"), vec![0x7f]);
    }

    #[test]
    fn control_clears_bits_0x60() {
        // `\C-\` would start a nested escape.
        for b in (b'@'..=b'~').filter(|&b| b != b'\\') {
            let got = esc(&format!("C-{}", char::from(b)));
            assert_eq!(got, vec![b & !0x60], "C-{}", char::from(b));
        }
    }

    #[test]
    fn octal_hex_unicode() {
        assert_eq!(esc("101"), b"A");
        assert_eq!(esc("0"), vec![0]);
        assert_eq!(esc("x41"), b"A");
        assert_eq!(esc("u00e9"), "é".as_bytes());
        assert_eq!(esc("u{1F600}"), "😀".as_bytes());
    }

    #[test]
    fn backslash_newline_is_empty() {
        assert_eq!(decode_escape(b"\nabc", 0), Ok((Vec::new(), 1)));
    }

    #[test]
    fn malformed_meta_is_an_error() {
        assert!(decode_escape(b"Mx", 0).is_err());
    }

    // ── Interpolation ─────────────────────────────────────────

    #[test]
    fn interpolation_splits_code() {
        let parts = interpolate("a#{x + 1}b", Pos::origin()).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], StrPart::Lit(b"a".to_vec()));
        match &parts[1] {
            StrPart::Code { source, pos } => {
                assert_eq!(source, "x + 1");
                assert_eq!(pos.column, 4);
            }
            other => panic!("expected code, got {other:?}"),
        }
        assert_eq!(parts[2], StrPart::Lit(b"b".to_vec()));
    }

    #[test]
    fn escaped_hash_suppresses_interpolation() {
        let parts = interpolate("\\#{x}", Pos::origin()).unwrap();
        assert_eq!(plain(&parts), Some(b"#{x}".to_vec()));
    }

    #[test]
    fn short_ivar_interpolation() {
        let parts = interpolate("v=#@value!", Pos::origin()).unwrap();
        assert!(matches!(&parts[1], StrPart::Code { source, .. } if source == "@value"));
    }

    #[test]
    fn nested_braces_in_code() {
        let parts = interpolate("#{h.map { |k| k }}", Pos::origin()).unwrap();
        assert!(matches!(&parts[0], StrPart::Code { source, .. } if source == "h.map { |k| k }"));
    }

    #[test]
    fn unterminated_interpolation() {
        assert!(interpolate("#{x", Pos::origin()).is_err());
    }

    // ── Heredoc helpers ───────────────────────────────────────

    #[test]
    fn squiggly_strips_minimum_indent() {
        let body = "    a\n      b\n\n    c\n";
        assert_eq!(strip_common_indent(body), "a\n  b\n\nc\n");
    }

    #[test]
    fn squiggly_ignores_whitespace_only_lines() {
        let body = "   x\n \n   y\n";
        assert_eq!(strip_common_indent(body), "x\n\ny\n");
    }

    #[test]
    fn single_quoted_only_unescapes_backslash_and_quote() {
        assert_eq!(unescape_single(r"a\'b\\c\n", b'\''), b"a'b\\c\\n".to_vec());
    }

    #[test]
    fn escape_bytes_decodes_back() {
        let samples: [&[u8]; 4] = [b"plain", b"tab\there\n", b"q\"#{x}\\", &[0, 0x81, 0xff, 27]];
        for sample in samples {
            let text = escape_bytes(sample);
            let parts = interpolate(&text, Pos::origin()).unwrap();
            assert_eq!(plain(&parts).unwrap_or_default(), sample.to_vec());
        }
    }
}
