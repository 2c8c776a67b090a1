//! Source preparation: normalize client-submitted LaTeX before compilation.
//!
//! Two rewrites run in order on every request:
//! 1. guard `glyphtounicode` usage so sources written for pdfTeX survive
//!    other engines,
//! 2. wrap bare fragments in a minimal document preamble.
//!
//! Both are idempotent, so running the pipeline over already-prepared
//! source changes nothing.

use once_cell::sync::Lazy;
use regex::Regex;

static DOCUMENT_CLASS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\documentclass\b").expect("valid pattern"));

/// A whole line consisting of `\input glyphtounicode` in any of its
/// spellings: optional braces, optional `.tex` suffix, any case.
static GLYPH_INPUT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*\\input\s*\{?\s*glyphtounicode(?:\.tex)?\s*\}?\s*$").expect("valid pattern")
});

/// A whole line consisting of `\pdfgentounicode=1`.
static PDFGEN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\\pdfgentounicode\s*=\s*1\s*$").expect("valid pattern"));

/// Marker left by a previous guarding pass.
const GUARD_TOKEN: &str = r"\ifdefined\pdfgentounicode";

const GUARD_BLOCK: &str = "% guarded glyphtounicode for pdfTeX only\n\\ifdefined\\pdfgentounicode\n\\input glyphtounicode.tex\n\\pdfgentounicode=1\n\\fi";

/// Runs the full preparation pipeline. Total: any input string yields a
/// compilable candidate, never an error.
pub fn prepare(source: &str) -> String {
    wrap_if_partial(&guard_glyph_to_unicode(source))
}

/// Wraps a fragment in a standalone `article` document unless the source
/// already declares a document class.
pub fn wrap_if_partial(source: &str) -> String {
    if DOCUMENT_CLASS.is_match(source) {
        return source.to_string();
    }
    format!(
        "\\documentclass{{article}}\n\\usepackage[utf8]{{inputenc}}\n\\begin{{document}}\n{source}\n\\end{{document}}"
    )
}

/// Replaces unconditional `glyphtounicode` lines with a block that only
/// runs them under engines that define `\pdfgentounicode`.
///
/// Sources that already carry the conditional, or that never touch
/// `glyphtounicode`, pass through untouched.
pub fn guard_glyph_to_unicode(source: &str) -> String {
    if source.contains(GUARD_TOKEN) {
        return source.to_string();
    }
    let is_hazard = |line: &str| GLYPH_INPUT_LINE.is_match(line) || PDFGEN_LINE.is_match(line);
    if !source.lines().any(is_hazard) {
        return source.to_string();
    }

    let kept: Vec<&str> = source.lines().filter(|line| !is_hazard(line)).collect();
    let mut out: Vec<&str> = Vec::with_capacity(kept.len() + 1);
    match kept.iter().position(|line| DOCUMENT_CLASS.is_match(line)) {
        Some(idx) => {
            out.extend(&kept[..=idx]);
            out.push(GUARD_BLOCK);
            out.extend(&kept[idx + 1..]);
        }
        None => {
            out.push(GUARD_BLOCK);
            out.extend(&kept);
        }
    }
    out.join("\n")
}
