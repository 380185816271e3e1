//! Archive inspection: pick the release binary and genesis descriptor out
//! of a tar archive by configurable glob patterns.
//!
//! Selection is rule-driven: the first rule whose organization/repository
//! filters match the chain identity wins (empty filter = wildcard), with an
//! optional synthesized default rule. Patterns use shell-glob semantics
//! (`*`, `?`, `[…]`, `[!…]`) against the full member path and its basename;
//! `*` crosses `/`. The first pattern with any match wins and ties break to
//! the lexicographically smallest member name.

use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;

use crate::config::{ArtifactSelectionConfig, ArtifactSelectionRule, ChainConfig};
use crate::types::ArtifactType;

/// A file staged for delivery: either extracted from the archive or the
/// archive itself. Lives only for one object's processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadCandidate {
    pub local_path: PathBuf,
    pub output_name: String,
    pub artifact_type: ArtifactType,
    pub source_member: Option<String>,
}

#[derive(Debug, Error)]
pub enum ArtifactSelectionError {
    #[error("required binary/genesis members not found")]
    MembersNotFound,
    #[error("member has invalid size: {0}")]
    InvalidMemberSize(String),
    #[error("failed to read member: {0}")]
    UnreadableMember(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Select the binary and genesis members of `archive_path`.
///
/// Returns `Ok(vec![])` when selection is disabled, the input is not a tar
/// archive, or no rule applies — the caller may then fall back to shipping
/// the archive whole. Returns an error when a rule applies but the required
/// members are missing or unreadable.
pub fn select_upload_candidates(
    archive_path: &Path,
    extraction_dir: &Path,
    chain: &ChainConfig,
    config: &ArtifactSelectionConfig,
) -> Result<Vec<UploadCandidate>, ArtifactSelectionError> {
    if !config.enabled {
        return Ok(Vec::new());
    }
    let Some(rule) = match_rule(chain, config) else {
        return Ok(Vec::new());
    };
    let Some(members) = list_members(archive_path)? else {
        return Ok(Vec::new());
    };

    let binary = find_member_by_patterns(&members, &rule.binary_patterns);
    let genesis = find_member_by_patterns(&members, &rule.genesis_patterns);
    let (Some(binary), Some(genesis)) = (binary, genesis) else {
        return Err(ArtifactSelectionError::MembersNotFound);
    };

    fs::create_dir_all(extraction_dir)?;
    let mut extracted = extract_members(archive_path, extraction_dir, &[&binary, &genesis])?;
    let genesis_candidate = candidate(
        extracted.pop().ok_or(ArtifactSelectionError::MembersNotFound)?,
        ArtifactType::Genesis,
    );
    let binary_candidate = candidate(
        extracted.pop().ok_or(ArtifactSelectionError::MembersNotFound)?,
        ArtifactType::Binary,
    );
    Ok(vec![binary_candidate, genesis_candidate])
}

fn candidate((member, local_path): (String, PathBuf), artifact_type: ArtifactType) -> UploadCandidate {
    UploadCandidate {
        local_path,
        output_name: basename(&member).to_string(),
        artifact_type,
        source_member: Some(member),
    }
}

fn match_rule(
    chain: &ChainConfig,
    config: &ArtifactSelectionConfig,
) -> Option<ArtifactSelectionRule> {
    for rule in &config.rules {
        if let Some(organization) = &rule.organization
            && organization != &chain.organization
        {
            continue;
        }
        if let Some(repository) = &rule.repository
            && repository != &chain.repository
        {
            continue;
        }
        return Some(rule.clone());
    }

    if !config.default_binary_patterns.is_empty() && !config.default_genesis_patterns.is_empty() {
        return Some(ArtifactSelectionRule {
            organization: None,
            repository: None,
            binary_patterns: config.default_binary_patterns.clone(),
            genesis_patterns: config.default_genesis_patterns.clone(),
        });
    }
    None
}

fn find_member_by_patterns(members: &[String], patterns: &[String]) -> Option<String> {
    for pattern in patterns {
        let matched = members
            .iter()
            .filter(|name| member_matches(name, pattern))
            .min();
        if let Some(name) = matched {
            return Some(name.clone());
        }
    }
    None
}

fn member_matches(name: &str, pattern: &str) -> bool {
    glob_match(pattern, name) || glob_match(pattern, basename(name))
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Enumerate regular-file member names, or `None` for non-tar input.
fn list_members(archive_path: &Path) -> Result<Option<Vec<String>>, ArtifactSelectionError> {
    let Some(mut archive) = open_archive(archive_path)? else {
        return Ok(None);
    };
    let mut members = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        members.push(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
    }
    Ok(Some(members))
}

/// Second pass: extract the selected members to
/// `<dir>/<binary|genesis>-<basename>` in the order given.
fn extract_members(
    archive_path: &Path,
    extraction_dir: &Path,
    wanted: &[&String],
) -> Result<Vec<(String, PathBuf)>, ArtifactSelectionError> {
    let prefixes = ["binary", "genesis"];
    let mut extracted: Vec<Option<(String, PathBuf)>> = vec![None; wanted.len()];

    let Some(mut archive) = open_archive(archive_path)? else {
        return Err(ArtifactSelectionError::MembersNotFound);
    };
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let matches: Vec<usize> = wanted
            .iter()
            .enumerate()
            .filter(|(index, member)| extracted[*index].is_none() && ***member == name)
            .map(|(index, _)| index)
            .collect();
        if matches.is_empty() {
            continue;
        }
        if entry.header().size().unwrap_or(0) == 0 {
            return Err(ArtifactSelectionError::InvalidMemberSize(name));
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|_| ArtifactSelectionError::UnreadableMember(name.clone()))?;
        for index in matches {
            let destination =
                extraction_dir.join(format!("{}-{}", prefixes[index], basename(&name)));
            let mut file = fs::File::create(&destination)?;
            file.write_all(&data)?;
            extracted[index] = Some((name.clone(), destination));
        }
    }

    extracted
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or(ArtifactSelectionError::MembersNotFound)
}

/// Open a possibly gzip-compressed tar archive. `Ok(None)` means the file is
/// not a tar archive (wrong magic, or gzip of something else).
pub(crate) fn open_archive(path: &Path) -> std::io::Result<Option<Archive<Box<dyn Read>>>> {
    let mut file = fs::File::open(path)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.rewind()?;

    if read == 2 && magic == [0x1f, 0x8b] {
        let mut probe = GzDecoder::new(&mut file);
        if !looks_like_tar(&mut probe) {
            return Ok(None);
        }
        let file = fs::File::open(path)?;
        let reader: Box<dyn Read> = Box::new(GzDecoder::new(file));
        return Ok(Some(Archive::new(reader)));
    }

    if !looks_like_tar(&mut file) {
        return Ok(None);
    }
    let file = fs::File::open(path)?;
    let reader: Box<dyn Read> = Box::new(file);
    Ok(Some(Archive::new(reader)))
}

/// Check for the `ustar` magic at offset 257 of the (decompressed) stream.
/// Read errors count as "not tar".
fn looks_like_tar(reader: &mut impl Read) -> bool {
    let mut header = [0u8; 262];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    &header[257..262] == b"ustar"
}

/// Shell-glob match: `*` (any run, including `/`), `?` (any one char),
/// `[…]` / `[!…]` character classes with ranges.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < text.len() {
        let step = if pi < pattern.len() {
            match pattern[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => Some(1),
                '[' => match match_class(&pattern, pi, text[ti]) {
                    Some((true, next_pi)) => {
                        pi = next_pi;
                        ti += 1;
                        continue;
                    }
                    Some((false, _)) => None,
                    // Unterminated class matches a literal '['.
                    None => (text[ti] == '[').then_some(1),
                },
                c => (c == text[ti]).then_some(1),
            }
        } else {
            None
        };

        match step {
            Some(advance) => {
                pi += advance;
                ti += 1;
            }
            None => match star {
                Some((star_pi, star_ti)) => {
                    pi = star_pi + 1;
                    ti = star_ti + 1;
                    star = Some((star_pi, star_ti + 1));
                }
                None => return false,
            },
        }
    }

    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Match a bracket class starting at `pattern[start] == '['` against `c`.
/// Returns `(matched, index past the class)`, or `None` if unterminated.
fn match_class(pattern: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let mut negated = false;
    if pattern.get(i) == Some(&'!') {
        negated = true;
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        if pattern[i] == ']' && !first {
            return Some((matched != negated, i + 1));
        }
        first = false;
        if i + 2 < pattern.len() && pattern[i + 1] == '-' && pattern[i + 2] != ']' {
            if pattern[i] <= c && c <= pattern[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if pattern[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    None
}
