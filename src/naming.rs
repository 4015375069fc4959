//! Deterministic, collision-free file names for archived recordings.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::content_id::ContentId;

/// Bytes kept free for a `_NNN` collision suffix, a `_partNN` suffix and the
/// extension.
const SUFFIX_RESERVE: usize = 16;
const ALLOWED_PUNCTUATION: &[char] = &[' ', '-', '_', '.', ',', '(', ')', '&'];
const EDGE_SEPARATORS: &[char] = &[' ', '-', '_', '.'];

#[derive(Debug, Clone, Copy)]
pub struct NameBuilder {
    max_len: usize,
}

impl NameBuilder {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// `{date}-{title}-{id}`, dropping the title segment when it sanitizes to
    /// nothing. Only the title is shortened to respect the length cap.
    pub fn base_name(&self, title: &str, date: NaiveDate, id: &ContentId) -> String {
        let date = date.format("%Y-%m-%d").to_string();
        let fixed = date.len() + id.as_str().len() + 2;
        let budget = self
            .max_len
            .saturating_sub(SUFFIX_RESERVE)
            .saturating_sub(fixed);

        let title = sanitize_title(title);
        let title = truncate_at_char_boundary(&title, budget).trim_end_matches(EDGE_SEPARATORS);
        if title.is_empty() {
            format!("{date}-{id}")
        } else {
            format!("{date}-{title}-{id}")
        }
    }
}

/// Keeps alphanumerics and a small punctuation allow-list, turns other
/// whitespace into spaces and collapses runs of spaces and underscores.
pub fn sanitize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = if ch.is_whitespace() { ' ' } else { ch };
        if !(ch.is_alphanumeric() || ALLOWED_PUNCTUATION.contains(&ch)) {
            continue;
        }
        if (ch == ' ' || ch == '_') && out.ends_with(ch) {
            continue;
        }
        out.push(ch);
    }
    out.trim_matches(EDGE_SEPARATORS).to_string()
}

fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// First of `{base}.{ext}`, `{base}_1.{ext}`, `{base}_2.{ext}`, … that does
/// not exist yet.
pub fn unique_path(dir: &Path, base: &str, ext: &str) -> PathBuf {
    let stem = unique_stem(base, |stem| !dir.join(file_name(stem, ext)).exists());
    dir.join(file_name(&stem, ext))
}

/// First of `base`, `base_1`, `base_2`, … accepted by `is_free`. Used when a
/// set of sibling files must all share one stem.
pub fn unique_stem(base: &str, mut is_free: impl FnMut(&str) -> bool) -> String {
    if is_free(base) {
        return base.to_string();
    }
    let mut counter = 1u32;
    loop {
        let candidate = format!("{base}_{counter}");
        if is_free(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

pub fn file_name(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// `{stem}_part{k}.{ext}`
pub fn part_path(dir: &Path, stem: &str, part: u32, ext: &str) -> PathBuf {
    dir.join(file_name(&format!("{stem}_part{part}"), ext))
}

/// File name without its extension and without a trailing `_part{k}`.
pub fn set_stem(name: &str) -> &str {
    let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
    strip_numbered(stem, "_part").unwrap_or(stem)
}

/// `base` for a `{base}_{N}` stem produced by [`unique_stem`].
pub fn strip_counter(stem: &str) -> Option<&str> {
    strip_numbered(stem, "_")
}

fn strip_numbered<'a>(stem: &'a str, marker: &str) -> Option<&'a str> {
    let (base, number) = stem.rsplit_once(marker)?;
    (!base.is_empty() && !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()))
        .then_some(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::tempdir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    fn id() -> ContentId {
        ContentId::new("1AbCdEf").unwrap()
    }

    #[test]
    fn base_name_sanitizes_title() {
        let builder = NameBuilder::new(255);
        assert_eq!(
            builder.base_name("Weekly: Update!", date(), &id()),
            "2024-03-05-Weekly Update-1AbCdEf"
        );
    }

    #[test]
    fn sanitize_collapses_and_trims() {
        assert_eq!(sanitize_title("  a\t\tb__c / d  "), "a b_c d");
        assert_eq!(sanitize_title("Rock & Roll (live), pt. 2"), "Rock & Roll (live), pt. 2");
        assert_eq!(sanitize_title("日本語 タイトル"), "日本語 タイトル");
        assert_eq!(sanitize_title("--._hello_.--"), "hello");
        assert_eq!(sanitize_title("🎙️🔥"), "");
    }

    #[test]
    fn empty_title_is_omitted() {
        let builder = NameBuilder::new(255);
        assert_eq!(builder.base_name("???", date(), &id()), "2024-03-05-1AbCdEf");
    }

    #[test]
    fn long_titles_are_truncated_but_id_survives() {
        let builder = NameBuilder::new(255);
        let title = "é".repeat(300);
        let name = builder.base_name(&title, date(), &id());
        assert!(name.len() + SUFFIX_RESERVE <= 255);
        assert!(name.ends_with("-1AbCdEf"));
        assert!(name.starts_with("2024-03-05-é"));
    }

    #[test]
    fn unique_path_never_reuses_existing_names() {
        let dir = tempdir().unwrap();
        let mut seen = HashSet::new();
        for _ in 0..5 {
            let path = unique_path(dir.path(), "2024-03-05-Weekly-1AbCdEf", "m4a");
            assert!(!path.exists());
            fs::write(&path, "x").unwrap();
            assert!(seen.insert(path));
        }
        assert!(seen.contains(&dir.path().join("2024-03-05-Weekly-1AbCdEf_4.m4a")));
    }

    #[test]
    fn unique_stem_checks_every_sibling() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("base.mp3"), "x").unwrap();
        let stem = unique_stem("base", |stem| {
            ["m4a", "mp3"]
                .iter()
                .all(|ext| !dir.path().join(file_name(stem, ext)).exists())
        });
        assert_eq!(stem, "base_1");
    }

    #[test]
    fn part_paths_follow_the_stem() {
        assert_eq!(
            part_path(Path::new("/a"), "stem", 2, "m4a"),
            PathBuf::from("/a/stem_part2.m4a")
        );
    }

    #[test]
    fn set_stem_strips_extension_and_part_suffix() {
        assert_eq!(set_stem("2024-03-05-A-1AbCdEf_part2.m4a"), "2024-03-05-A-1AbCdEf");
        assert_eq!(set_stem("2024-03-05-A-1AbCdEf.mp3"), "2024-03-05-A-1AbCdEf");
        assert_eq!(set_stem("2024-03-05-A-1AbCdEf_1.m4a"), "2024-03-05-A-1AbCdEf_1");
        assert_eq!(set_stem("x_party.m4a"), "x_party");
    }

    #[test]
    fn counter_suffix_is_stripped_only_when_numeric() {
        assert_eq!(strip_counter("2024-03-05-A-1AbCdEf_12"), Some("2024-03-05-A-1AbCdEf"));
        assert_eq!(strip_counter("2024-03-05-A-1Ab_CdEf"), None);
        assert_eq!(strip_counter("_3"), None);
    }
}
