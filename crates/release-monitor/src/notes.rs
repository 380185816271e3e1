//! Release-notes extraction from archive members.
//!
//! Looks for conventional notes files inside the archive, then slices out
//! the section whose version heading matches the release tag. A candidate
//! file with no version headings at all is remembered as a whole-file
//! fallback. Everything here is best-effort: malformed archives and I/O
//! failures yield "no notes", never an error.

use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::artifacts::open_archive;

static VERSION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s{0,3}#{1,6}\s*v?(\d+(?:\.\d+){1,3}(?:-[0-9A-Za-z][0-9A-Za-z.-]*)?)\s*$")
        .expect("static regex")
});

const NOTES_FILENAMES: &[&str] = &[
    "release_notes.txt",
    "release-notes.txt",
    "releasenotes.txt",
    "changelog.md",
    "changes.md",
];

const MAX_NOTE_CHARS: usize = 40_000;

const TRUNCATION_MARKER: &str =
    "\n\n[release notes truncated for webhook payload size; full notes available in artifact]";

/// Notes text selected for one release, and the member it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedReleaseNotes {
    pub text: String,
    pub source_member: String,
}

/// Find the notes section for `release_tag` inside the archive.
pub fn extract_release_notes_for_tag_from_archive(
    archive_path: &Path,
    release_tag: &str,
) -> Option<ExtractedReleaseNotes> {
    let mut members = read_notes_members(archive_path)?;
    members.sort_by_key(|(name, _)| notes_member_priority(name));

    let mut fallback: Option<ExtractedReleaseNotes> = None;
    for (name, data) in members {
        if data.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(&data);

        let (section, has_version_sections) = extract_section_for_tag(&text, release_tag);
        if let Some(section) = section {
            return Some(ExtractedReleaseNotes {
                text: section,
                source_member: name,
            });
        }
        if !has_version_sections && fallback.is_none() {
            fallback = Some(ExtractedReleaseNotes {
                text: truncate_notes(&text),
                source_member: name,
            });
        }
    }
    fallback
}

/// Slice the section under the heading matching `release_tag`.
///
/// Returns the section (trimmed, truncated) and whether the text contains any
/// version headings at all; a headingless file is returned whole so the
/// caller can use it as a fallback.
pub fn extract_section_for_tag(notes_text: &str, release_tag: &str) -> (Option<String>, bool) {
    let lines: Vec<&str> = notes_text.lines().collect();
    let mut headings: Vec<(usize, &str)> = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        if let Some(captures) = VERSION_HEADING.captures(line) {
            headings.push((index, captures.get(1).expect("version group").as_str()));
        }
    }

    if headings.is_empty() {
        let text = notes_text.trim();
        if text.is_empty() {
            return (None, false);
        }
        return (Some(truncate_notes(text)), false);
    }

    let normalized_target = normalize_tag(release_tag);
    for (position, (start, version)) in headings.iter().enumerate() {
        if normalize_tag(version) != normalized_target {
            continue;
        }
        let end = headings
            .get(position + 1)
            .map(|(line, _)| *line)
            .unwrap_or(lines.len());
        let section = lines[*start..end].join("\n");
        let section = section.trim();
        if section.is_empty() {
            return (None, true);
        }
        return (Some(truncate_notes(section)), true);
    }

    (None, true)
}

/// Collect `(member name, content)` for members whose basename looks like a
/// notes file. `None` for non-tar archives or read failures.
fn read_notes_members(archive_path: &Path) -> Option<Vec<(String, Vec<u8>)>> {
    let mut archive = open_archive(archive_path).ok()??;
    let mut members = Vec::new();
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if !looks_like_notes_file(&name) {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).ok()?;
        members.push((name, data));
    }
    Some(members)
}

fn looks_like_notes_file(member_name: &str) -> bool {
    let filename = basename(member_name).to_lowercase();
    NOTES_FILENAMES.contains(&filename.as_str())
}

/// Sort key: release-prefixed files first, then changelogs, then the rest;
/// shallower and shorter paths win ties.
fn notes_member_priority(member_name: &str) -> (u8, usize, usize) {
    let filename = basename(member_name).to_lowercase();
    let base_priority = if filename.starts_with("release") {
        0
    } else if filename.contains("change") {
        1
    } else {
        2
    };
    let depth = member_name.split('/').count();
    (base_priority, depth, member_name.len())
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase().trim_start_matches('v').to_string()
}

fn truncate_notes(text: &str) -> String {
    if text.chars().count() <= MAX_NOTE_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_NOTE_CHARS).collect();
    format!("{truncated}{TRUNCATION_MARKER}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn write_archive(dir: &Path, members: &[(&str, &str)]) -> PathBuf {
        let path = dir.join("release.tar.gz");
        let file = fs::File::create(&path).expect("create");
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .expect("append");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");
        path
    }

    const VERSIONED_NOTES: &str = "\
# v2.0.15\n\
- faster sync\n\
- fixed peer scoring\n\
\n\
# v2.0.14\n\
- initial mainnet support\n";

    #[test]
    fn section_for_matching_tag_excludes_other_versions() {
        let (section, has_versions) = extract_section_for_tag(VERSIONED_NOTES, "v2.0.15");
        assert!(has_versions);
        let section = section.expect("section");
        assert!(section.starts_with("# v2.0.15"));
        assert!(section.contains("faster sync"));
        assert!(!section.contains("initial mainnet support"));
    }

    #[test]
    fn tag_normalization_ignores_leading_v_and_case() {
        let (section, _) = extract_section_for_tag(VERSIONED_NOTES, "2.0.14");
        assert!(section.expect("section").contains("initial mainnet support"));
    }

    #[test]
    fn unmatched_tag_with_versions_yields_none() {
        let (section, has_versions) = extract_section_for_tag(VERSIONED_NOTES, "v9.9.9");
        assert!(section.is_none());
        assert!(has_versions);
    }

    #[test]
    fn headingless_text_is_returned_whole() {
        let (section, has_versions) = extract_section_for_tag("general notes\nno versions", "v1.0.0");
        assert!(!has_versions);
        assert_eq!(section.expect("section"), "general notes\nno versions");
    }

    #[test]
    fn blank_text_yields_none() {
        let (section, has_versions) = extract_section_for_tag("   \n\n", "v1.0.0");
        assert!(section.is_none());
        assert!(!has_versions);
    }

    #[test]
    fn long_notes_are_truncated_with_marker() {
        let long_text = "x".repeat(MAX_NOTE_CHARS + 100);
        let (section, _) = extract_section_for_tag(&long_text, "v1.0.0");
        let section = section.expect("section");
        assert!(section.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            section.chars().count(),
            MAX_NOTE_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn archive_extraction_picks_release_notes_over_changelog() {
        let td = tempdir().expect("tempdir");
        let archive = write_archive(
            td.path(),
            &[
                ("pkg/CHANGELOG.md", "# v2.0.15\nfrom changelog\n"),
                ("pkg/RELEASE_NOTES.txt", VERSIONED_NOTES),
            ],
        );

        let notes = extract_release_notes_for_tag_from_archive(&archive, "v2.0.15")
            .expect("notes");
        assert_eq!(notes.source_member, "pkg/RELEASE_NOTES.txt");
        assert!(notes.text.contains("faster sync"));
    }

    #[test]
    fn headingless_candidate_is_a_fallback_only() {
        let td = tempdir().expect("tempdir");
        let archive = write_archive(
            td.path(),
            &[
                ("pkg/release_notes.txt", "plain notes without headings\n"),
                ("pkg/changelog.md", "# v3.0.0\nthe section for v3\n"),
            ],
        );

        // Tag present in the changelog: the versioned section wins.
        let notes = extract_release_notes_for_tag_from_archive(&archive, "v3.0.0")
            .expect("notes");
        assert_eq!(notes.source_member, "pkg/changelog.md");

        // Tag absent everywhere: fall back to the headingless file.
        let notes = extract_release_notes_for_tag_from_archive(&archive, "v9.0.0")
            .expect("notes");
        assert_eq!(notes.source_member, "pkg/release_notes.txt");
        assert_eq!(notes.text, "plain notes without headings");
    }

    #[test]
    fn shallower_notes_file_is_preferred() {
        let td = tempdir().expect("tempdir");
        let archive = write_archive(
            td.path(),
            &[
                ("pkg/deep/nested/release_notes.txt", "nested\n"),
                ("pkg/release_notes.txt", "top\n"),
            ],
        );
        let notes = extract_release_notes_for_tag_from_archive(&archive, "v1.0.0")
            .expect("notes");
        assert_eq!(notes.source_member, "pkg/release_notes.txt");
    }

    #[test]
    fn non_tar_archive_yields_no_notes() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("release.tar.gz");
        fs::write(&path, "not a tar").expect("write");
        assert!(extract_release_notes_for_tag_from_archive(&path, "v1.0.0").is_none());
    }

    #[test]
    fn archive_without_notes_files_yields_none() {
        let td = tempdir().expect("tempdir");
        let archive = write_archive(td.path(), &[("pkg/binary", "data")]);
        assert!(extract_release_notes_for_tag_from_archive(&archive, "v1.0.0").is_none());
    }

    #[test]
    fn heading_variants_are_recognized() {
        for (line, tag) in [
            ("# v1.2.3", "v1.2.3"),
            ("  ## 1.2.3", "v1.2.3"),
            ("### v1.2.3-rc.1", "1.2.3-rc.1"),
            ("###### v0.1.0.2", "0.1.0.2"),
        ] {
            let (section, has_versions) = extract_section_for_tag(&format!("{line}\nbody\n"), tag);
            assert!(has_versions, "{line}");
            assert!(section.is_some(), "{line}");
        }

        let (_, has_versions) = extract_section_for_tag("# v1.2.3 trailing words\n", "v1.2.3");
        assert!(!has_versions, "heading with trailing words is not a version heading");
    }
}
