//! Safe extraction of downloaded runtime archives
//!
//! Archive contents are untrusted. Extraction runs in two phases: [`plan`] validates
//! every member without touching the filesystem and either approves the whole archive
//! or names the first offending member; [`apply`] then unpacks the approved members
//! into a staging directory next to the destination and moves the result into place.
//! A failure in either phase leaves the destination as it was.

use crate::error::{AffinityError, Result};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tracing::{debug, info};

/// Compression wrapper of a tar archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarXz,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    /// Detect the format from the file name
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Ok(ArchiveFormat::TarXz)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Ok(ArchiveFormat::Tar)
        } else {
            Err(AffinityError::Archive(format!(
                "Unsupported archive format: {}",
                path.display()
            )))
        }
    }

    fn open(&self, path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
        let file = BufReader::new(File::open(path)?);
        let reader: Box<dyn Read> = match self {
            ArchiveFormat::TarXz => Box::new(xz2::read::XzDecoder::new(file)),
            ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(file)),
            ArchiveFormat::Tar => Box::new(file),
        };
        Ok(tar::Archive::new(reader))
    }
}

/// Member type as far as extraction is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    File,
    Directory,
    Symlink,
    HardLink,
    /// Device, FIFO and anything else that is not plain data
    Special,
    /// Archive-level metadata with no filesystem effect
    Metadata,
}

impl From<EntryType> for MemberKind {
    fn from(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => MemberKind::File,
            EntryType::Directory => MemberKind::Directory,
            EntryType::Symlink => MemberKind::Symlink,
            EntryType::Link => MemberKind::HardLink,
            EntryType::XGlobalHeader => MemberKind::Metadata,
            _ => MemberKind::Special,
        }
    }
}

/// Raw member description read from the archive headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub path: PathBuf,
    pub kind: MemberKind,
    pub link_target: Option<PathBuf>,
}

/// An approved member, with paths relative to the destination root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMember {
    /// Position in the archive stream
    pub index: usize,
    pub relative: PathBuf,
    pub kind: MemberKind,
    /// Literal link target for symlinks, root-relative target for hard links
    pub link_target: Option<PathBuf>,
}

/// Members approved for extraction, in archive order
#[derive(Debug, Clone, Default)]
pub struct ExtractionPlan {
    pub members: Vec<PlannedMember>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub files: usize,
    pub directories: usize,
    pub links: usize,
}

fn unsafe_member(member: &Path, reason: impl Into<String>) -> AffinityError {
    AffinityError::UnsafeArchive {
        member: member.display().to_string(),
        reason: reason.into(),
    }
}

/// Lexically resolve `path` against `base` (both root-relative)
///
/// Returns None when the result would leave the root.
fn resolve_within(base: &Path, path: &Path) -> Option<PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in path.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn has_parent_segment(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

/// Validate every member; no filesystem access
pub fn plan(members: &[ArchiveMember]) -> Result<ExtractionPlan> {
    let mut approved = Vec::with_capacity(members.len());

    for (index, member) in members.iter().enumerate() {
        match member.kind {
            MemberKind::Metadata => continue,
            MemberKind::Special => {
                return Err(unsafe_member(&member.path, "special file types are not allowed"));
            }
            _ => {}
        }

        if member.path.is_absolute() {
            return Err(unsafe_member(&member.path, "path escapes destination"));
        }
        let relative = resolve_within(Path::new(""), &member.path)
            .ok_or_else(|| unsafe_member(&member.path, "path escapes destination"))?;

        if relative.as_os_str().is_empty() {
            if member.kind == MemberKind::Directory {
                continue;
            }
            return Err(unsafe_member(&member.path, "member resolves to the destination itself"));
        }

        let link_target = match member.kind {
            MemberKind::Symlink | MemberKind::HardLink => {
                let target = member
                    .link_target
                    .as_deref()
                    .filter(|t| !t.as_os_str().is_empty())
                    .ok_or_else(|| unsafe_member(&member.path, "link has no target"))?;

                if target.is_absolute() {
                    return Err(unsafe_member(&member.path, "absolute link target"));
                }
                if has_parent_segment(target) {
                    return Err(unsafe_member(&member.path, "link target contains '..'"));
                }

                // Symlinks resolve from their own directory, hard links from the archive root
                let base = match member.kind {
                    MemberKind::Symlink => relative.parent().unwrap_or(Path::new("")),
                    _ => Path::new(""),
                };
                let resolved = resolve_within(base, target)
                    .ok_or_else(|| unsafe_member(&member.path, "link target escapes destination"))?;

                if member.kind == MemberKind::HardLink {
                    Some(resolved)
                } else {
                    Some(target.to_path_buf())
                }
            }
            _ => None,
        };

        approved.push(PlannedMember {
            index,
            relative,
            kind: member.kind,
            link_target,
        });
    }

    Ok(ExtractionPlan { members: approved })
}

/// Read member headers without extracting anything
pub fn read_members(archive_path: &Path) -> Result<Vec<ArchiveMember>> {
    let format = ArchiveFormat::from_path(archive_path)?;
    let mut archive = format.open(archive_path)?;
    let mut members = Vec::new();

    for entry in archive.entries().map_err(|e| archive_error(archive_path, e))? {
        let entry = entry.map_err(|e| archive_error(archive_path, e))?;
        let path = PathBuf::from(OsStr::from_bytes(&entry.path_bytes()));
        let link_target = entry
            .link_name_bytes()
            .map(|bytes| PathBuf::from(OsStr::from_bytes(&bytes)));

        members.push(ArchiveMember {
            path,
            kind: MemberKind::from(entry.header().entry_type()),
            link_target,
        });
    }

    Ok(members)
}

fn archive_error(path: &Path, e: std::io::Error) -> AffinityError {
    AffinityError::Archive(format!("{}: {}", path.display(), e))
}

/// Unpack an approved plan into `destination`
pub fn apply(archive_path: &Path, plan: &ExtractionPlan, destination: &Path) -> Result<ExtractionSummary> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    // Dropped (and removed) on any early return
    let staging = tempfile::Builder::new()
        .prefix(".affinity-extract-")
        .tempdir_in(parent)?;
    let staging_root = staging.path().canonicalize()?;

    let format = ArchiveFormat::from_path(archive_path)?;
    let mut archive = format.open(archive_path)?;
    let mut pending = plan.members.iter().peekable();
    let mut summary = ExtractionSummary::default();

    for (index, entry) in archive
        .entries()
        .map_err(|e| archive_error(archive_path, e))?
        .enumerate()
    {
        let mut entry = entry.map_err(|e| archive_error(archive_path, e))?;
        let Some(member) = pending.next_if(|m| m.index == index) else {
            continue;
        };

        let target = staging_root.join(&member.relative);
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
            ensure_inside(&staging_root, dir, &member.relative)?;
        }

        match member.kind {
            MemberKind::Directory => {
                std::fs::create_dir_all(&target)?;
                summary.directories += 1;
            }
            MemberKind::File => {
                entry
                    .unpack(&target)
                    .map_err(|e| archive_error(archive_path, e))?;
                summary.files += 1;
            }
            MemberKind::Symlink => {
                let link = member.link_target.as_deref().unwrap_or(Path::new(""));
                remove_existing(&target)?;
                std::os::unix::fs::symlink(link, &target)?;
                summary.links += 1;
            }
            MemberKind::HardLink => {
                let source = staging_root.join(member.link_target.as_deref().unwrap_or(Path::new("")));
                ensure_inside(&staging_root, &source, &member.relative)?;
                remove_existing(&target)?;
                std::fs::hard_link(&source, &target)?;
                summary.links += 1;
            }
            MemberKind::Special | MemberKind::Metadata => {}
        }
    }

    if let Some(missing) = pending.next() {
        return Err(AffinityError::Archive(format!(
            "{} changed while extracting (member {} missing)",
            archive_path.display(),
            missing.relative.display()
        )));
    }

    std::fs::create_dir_all(destination)?;
    for child in std::fs::read_dir(&staging_root)? {
        let child = child?;
        let final_path = destination.join(child.file_name());
        remove_existing(&final_path)?;
        std::fs::rename(child.path(), &final_path)?;
    }

    Ok(summary)
}

fn ensure_inside(root: &Path, path: &Path, member: &Path) -> Result<()> {
    let canonical = path.canonicalize()?;
    if canonical.starts_with(root) {
        Ok(())
    } else {
        Err(unsafe_member(member, "path escapes destination"))
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

/// Validate and extract `archive_path` into `destination`, all or nothing
pub fn extract(archive_path: &Path, destination: &Path) -> Result<ExtractionSummary> {
    info!(
        "Extracting {} to {}",
        archive_path.display(),
        destination.display()
    );

    let members = read_members(archive_path)?;
    let plan = plan(&members)?;
    debug!("{} of {} members approved", plan.members.len(), members.len());

    let summary = apply(archive_path, &plan, destination)?;
    info!(
        "Extracted {} files, {} directories, {} links",
        summary.files, summary.directories, summary.links
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    /// Header with raw name bytes, bypassing the builder's path checks
    fn append_raw<W: Write>(
        builder: &mut tar::Builder<W>,
        name: &str,
        kind: EntryType,
        link: Option<&str>,
        data: &[u8],
    ) {
        let mut header = tar::Header::new_old();
        {
            let old = header.as_old_mut();
            old.name[..name.len()].copy_from_slice(name.as_bytes());
            if let Some(link) = link {
                old.linkname[..link.len()].copy_from_slice(link.as_bytes());
            }
        }
        header.set_entry_type(kind);
        header.set_size(data.len() as u64);
        header.set_mode(if kind == EntryType::Directory { 0o755 } else { 0o644 });
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    type Spec<'a> = (&'a str, EntryType, Option<&'a str>, &'a [u8]);

    fn write_tar(path: &Path, entries: &[Spec]) {
        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, kind, link, data) in entries {
            append_raw(&mut builder, name, *kind, *link, data);
        }
        builder.finish().unwrap();
    }

    fn file_count(dir: &Path) -> usize {
        if !dir.exists() {
            return 0;
        }
        walkdir::WalkDir::new(dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .count()
    }

    #[test]
    fn extracts_a_well_formed_archive() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("wine.tar");
        write_tar(
            &archive,
            &[
                ("wine-10/", EntryType::Directory, None, b""),
                ("wine-10/bin/", EntryType::Directory, None, b""),
                ("wine-10/bin/wine", EntryType::Regular, None, b"#!/bin/sh\n"),
                ("wine-10/bin/wine64", EntryType::Symlink, Some("wine"), b""),
                ("wine-10/bin/wine-hard", EntryType::Link, Some("wine-10/bin/wine"), b""),
                ("wine-10/lib/../share/readme", EntryType::Regular, None, b"hi"),
            ],
        );

        let dest = dir.path().join("runtime");
        let summary = extract(&archive, &dest).unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.links, 2);
        assert_eq!(
            std::fs::read_link(dest.join("wine-10/bin/wine64")).unwrap(),
            PathBuf::from("wine")
        );
        assert_eq!(std::fs::read(dest.join("wine-10/bin/wine-hard")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(std::fs::read(dest.join("wine-10/share/readme")).unwrap(), b"hi");
    }

    #[test]
    fn traversal_rejects_the_whole_archive() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.tar");
        write_tar(
            &archive,
            &[
                ("good.txt", EntryType::Regular, None, b"fine"),
                ("sub/../../evil.txt", EntryType::Regular, None, b"pwned"),
            ],
        );

        let dest = dir.path().join("out");
        let err = extract(&archive, &dest).unwrap_err();

        match err {
            AffinityError::UnsafeArchive { reason, .. } => assert_eq!(reason, "path escapes destination"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(file_count(&dest), 0);
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn absolute_member_is_rejected() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("abs.tar");
        write_tar(&archive, &[("/tmp/affinity-abs-test", EntryType::Regular, None, b"x")]);

        assert!(matches!(
            extract(&archive, &dir.path().join("out")),
            Err(AffinityError::UnsafeArchive { .. })
        ));
    }

    #[test]
    fn escaping_symlinks_are_rejected() {
        for target in ["../../etc", "/etc/passwd", "a/../b"] {
            let dir = tempdir().unwrap();
            let archive = dir.path().join("link.tar");
            write_tar(
                &archive,
                &[
                    ("ok.txt", EntryType::Regular, None, b"ok"),
                    ("bin/link", EntryType::Symlink, Some(target), b""),
                ],
            );

            let dest = dir.path().join("out");
            assert!(
                matches!(extract(&archive, &dest), Err(AffinityError::UnsafeArchive { .. })),
                "target {target} was accepted"
            );
            assert_eq!(file_count(&dest), 0);
        }
    }

    #[test]
    fn special_files_are_rejected() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("fifo.tar");
        write_tar(&archive, &[("pipe", EntryType::Fifo, None, b"")]);

        let err = extract(&archive, &dir.path().join("out")).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn plan_is_pure_and_ordered() {
        let members = vec![
            ArchiveMember {
                path: PathBuf::from("pax_global_header"),
                kind: MemberKind::Metadata,
                link_target: None,
            },
            ArchiveMember {
                path: PathBuf::from("./a/./b"),
                kind: MemberKind::File,
                link_target: None,
            },
            ArchiveMember {
                path: PathBuf::from("a/c"),
                kind: MemberKind::HardLink,
                link_target: Some(PathBuf::from("a/b")),
            },
        ];

        let plan = plan(&members).unwrap();
        assert_eq!(plan.members.len(), 2);
        assert_eq!(plan.members[0].index, 1);
        assert_eq!(plan.members[0].relative, PathBuf::from("a/b"));
        assert_eq!(plan.members[1].link_target, Some(PathBuf::from("a/b")));
    }

    #[test]
    fn replaces_existing_children_and_keeps_siblings() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out");
        std::fs::create_dir_all(dest.join("wine-10")).unwrap();
        std::fs::write(dest.join("wine-10/stale"), b"old").unwrap();
        std::fs::write(dest.join("unrelated"), b"keep").unwrap();

        let archive = dir.path().join("wine.tar.gz");
        let encoder = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        append_raw(&mut builder, "wine-10/fresh", EntryType::Regular, None, b"new");
        builder.into_inner().unwrap().finish().unwrap();

        extract(&archive, &dest).unwrap();
        assert!(!dest.join("wine-10/stale").exists());
        assert_eq!(std::fs::read(dest.join("wine-10/fresh")).unwrap(), b"new");
        assert_eq!(std::fs::read(dest.join("unrelated")).unwrap(), b"keep");
    }

    #[test]
    fn reads_xz_archives() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("wine-10.18-staging-amd64-wow64.tar.xz");
        let encoder = xz2::write::XzEncoder::new(File::create(&archive).unwrap(), 6);
        let mut builder = tar::Builder::new(encoder);
        append_raw(&mut builder, "wine/bin/wine", EntryType::Regular, None, b"elf");
        builder.into_inner().unwrap().finish().unwrap();

        let dest = dir.path().join("runtime");
        let summary = extract(&archive, &dest).unwrap();
        assert_eq!(summary.files, 1);
        assert!(dest.join("wine/bin/wine").is_file());
    }

    #[test]
    fn unknown_extension_is_an_archive_error() {
        assert!(matches!(
            ArchiveFormat::from_path(Path::new("wine.zip")),
            Err(AffinityError::Archive(_))
        ));
    }
}
