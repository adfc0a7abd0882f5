//! Classpath containers and the provider that enumerates their classes.
//!
//! A container is a directory, an archive, or an archive nested inside
//! another archive (`outer.war!/WEB-INF/lib/inner.jar`). The provider is the
//! only component that touches container bytes; everything above it works on
//! [`ContainerStat`]s and decoded records.

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

use crate::error::{ScanError, ScanResult};
use crate::scan::{class_files, is_class_entry};

pub const NESTED_SEPARATOR: &str = "!/";

const MAX_ENTRY_SIZE_HINT: u64 = 16 * 1024 * 1024;

/// Where a container lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerLocation {
    Directory(PathBuf),
    Archive(PathBuf),
    Nested { archive: PathBuf, entry: String },
}

impl ContainerLocation {
    /// Classifies `raw` by syntax and, for plain paths, by what is on disk.
    /// Paths that do not exist are treated as archives so the failure is
    /// reported when the container is first stat'ed.
    pub fn parse(raw: &str) -> Self {
        if let Some((archive, entry)) = raw.split_once(NESTED_SEPARATOR) {
            return Self::Nested {
                archive: PathBuf::from(archive),
                entry: entry.trim_start_matches('/').to_string(),
            };
        }
        let path = PathBuf::from(raw);
        if path.is_dir() {
            Self::Directory(path)
        } else {
            Self::Archive(path)
        }
    }

    /// Stable logical path used for identities, cache keys and diagnostics.
    pub fn logical_path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ContainerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(p) | Self::Archive(p) => write!(f, "{}", p.display()),
            Self::Nested { archive, entry } => {
                write!(f, "{}{NESTED_SEPARATOR}{entry}", archive.display())
            }
        }
    }
}

/// How a container's classes take part in queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ScanPolicy {
    /// Module classes proper.
    Seed,
    /// Metadata-complete fragments.
    Partial,
    /// Fragments excluded by an ordering.
    Excluded,
    /// Libraries used only to resolve the type hierarchy.
    External,
}

impl ScanPolicy {
    pub const ALL: [ScanPolicy; 4] = [Self::Seed, Self::Partial, Self::Excluded, Self::External];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Partial => "partial",
            Self::Excluded => "excluded",
            Self::External => "external",
        }
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seed" => Ok(Self::Seed),
            "partial" => Ok(Self::Partial),
            "excluded" => Ok(Self::Excluded),
            "external" => Ok(Self::External),
            other => Err(format!("unknown scan policy: {other}")),
        }
    }
}

/// One entry of a module's ordered container list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerSpec {
    pub location: ContainerLocation,
    pub policy: ScanPolicy,
}

impl ContainerSpec {
    pub fn new(location: ContainerLocation, policy: ScanPolicy) -> Self {
        Self { location, policy }
    }

    pub fn seed(location: ContainerLocation) -> Self {
        Self::new(location, ScanPolicy::Seed)
    }

    /// `PATH` or `PATH:policy`. A trailing segment that is not a policy name
    /// is kept as part of the path (drive letters, odd file names).
    pub fn parse(raw: &str) -> Self {
        if let Some((path, policy)) = raw.rsplit_once(':') {
            if let Ok(policy) = policy.parse::<ScanPolicy>() {
                return Self::new(ContainerLocation::parse(path), policy);
            }
        }
        Self::seed(ContainerLocation::parse(raw))
    }
}

/// Cheap metadata of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStat {
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    pub last_modified: u64,
}

/// One class file yielded by a provider.
#[derive(Debug, Clone)]
pub struct ClassEntry {
    /// Entry path inside the container, e.g. `org/example/A.class`.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Source of container metadata and class bytes.
///
/// `for_each_class` streams entries one at a time and may be called again
/// for the same container; the visitor stops the walk early by returning
/// [`ControlFlow::Break`].
pub trait ContainerProvider: Send + Sync {
    fn stat(&self, container: &ContainerLocation) -> ScanResult<ContainerStat>;

    fn for_each_class(
        &self,
        container: &ContainerLocation,
        visit: &mut dyn FnMut(ClassEntry) -> ControlFlow<()>,
    ) -> ScanResult<()>;

    /// Hex SHA-256 over every class entry name and its bytes, in entry order.
    fn digest(&self, container: &ContainerLocation) -> ScanResult<String> {
        digest_entries(self, container)
    }
}

fn digest_entries<P: ContainerProvider + ?Sized>(
    provider: &P,
    container: &ContainerLocation,
) -> ScanResult<String> {
    let mut hasher = Sha256::new();
    provider.for_each_class(container, &mut |entry| {
        hasher.update(entry.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&entry.bytes);
        ControlFlow::Continue(())
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Reads containers straight from the local file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsContainerProvider;

impl FsContainerProvider {
    pub fn new() -> Self {
        Self
    }
}

impl ContainerProvider for FsContainerProvider {
    fn stat(&self, container: &ContainerLocation) -> ScanResult<ContainerStat> {
        let unreadable = |e: &dyn fmt::Display| ScanError::unreadable(container.logical_path(), e);
        match container {
            ContainerLocation::Archive(path) => {
                let meta = std::fs::metadata(path).map_err(|e| unreadable(&e))?;
                if !meta.is_file() {
                    return Err(unreadable(&"not a file"));
                }
                Ok(ContainerStat {
                    size: meta.len(),
                    last_modified: modified_nanos(&meta),
                })
            }
            ContainerLocation::Directory(path) => {
                let meta = std::fs::metadata(path).map_err(|e| unreadable(&e))?;
                if !meta.is_dir() {
                    return Err(unreadable(&"not a directory"));
                }
                let mut size = 0u64;
                let mut last_modified = modified_nanos(&meta);
                let files = class_files(path).map_err(|e| unreadable(&e))?;
                for (_, file) in files {
                    let meta = std::fs::metadata(&file).map_err(|e| unreadable(&e))?;
                    size += meta.len();
                    last_modified = last_modified.max(modified_nanos(&meta));
                }
                Ok(ContainerStat {
                    size,
                    last_modified,
                })
            }
            ContainerLocation::Nested { archive, entry } => {
                let meta = std::fs::metadata(archive).map_err(|e| unreadable(&e))?;
                let mmap = map_file(archive).map_err(|e| unreadable(&e))?;
                let mut outer = ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| unreadable(&e))?;
                let inner = outer.by_name(entry).map_err(|e| unreadable(&e))?;
                Ok(ContainerStat {
                    size: inner.size(),
                    last_modified: modified_nanos(&meta),
                })
            }
        }
    }

    fn for_each_class(
        &self,
        container: &ContainerLocation,
        visit: &mut dyn FnMut(ClassEntry) -> ControlFlow<()>,
    ) -> ScanResult<()> {
        let unreadable = |e: &dyn fmt::Display| ScanError::unreadable(container.logical_path(), e);
        match container {
            ContainerLocation::Directory(dir) => {
                let files = class_files(dir).map_err(|e| unreadable(&e))?;
                for (name, path) in files {
                    let bytes = std::fs::read(&path).map_err(|e| unreadable(&e))?;
                    if visit(ClassEntry { name, bytes }).is_break() {
                        break;
                    }
                }
                Ok(())
            }
            ContainerLocation::Archive(path) => {
                let mmap = map_file(path).map_err(|e| unreadable(&e))?;
                visit_archive(Cursor::new(&mmap[..]), visit).map_err(|e| unreadable(&e))
            }
            ContainerLocation::Nested { archive, entry } => {
                let mmap = map_file(archive).map_err(|e| unreadable(&e))?;
                let mut outer = ZipArchive::new(Cursor::new(&mmap[..])).map_err(|e| unreadable(&e))?;
                let mut inner = outer.by_name(entry).map_err(|e| unreadable(&e))?;
                let declared = inner.size();
                let bytes = read_entry(&mut inner, declared).map_err(|e| unreadable(&e))?;
                visit_archive(Cursor::new(bytes), visit).map_err(|e| unreadable(&e))
            }
        }
    }

    fn digest(&self, container: &ContainerLocation) -> ScanResult<String> {
        // Archives hash their raw bytes; cheaper than inflating every entry.
        if let ContainerLocation::Archive(path) = container {
            let mmap = map_file(path)
                .map_err(|e| ScanError::unreadable(container.logical_path(), e))?;
            let mut hasher = Sha256::new();
            hasher.update(&mmap[..]);
            return Ok(hex::encode(hasher.finalize()));
        }
        digest_entries(self, container)
    }
}

fn visit_archive<R: Read + Seek>(
    reader: R,
    visit: &mut dyn FnMut(ClassEntry) -> ControlFlow<()>,
) -> anyhow::Result<()> {
    let mut archive = ZipArchive::new(reader)?;
    let mut names: Vec<(String, usize)> = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if !entry.is_dir() && is_class_entry(entry.name()) {
            names.push((entry.name().to_string(), i));
        }
    }
    names.sort();

    for (name, index) in names {
        let mut file = archive.by_index(index)?;
        let declared = file.size();
        let bytes = read_entry(&mut file, declared)?;
        if visit(ClassEntry { name, bytes }).is_break() {
            break;
        }
    }
    Ok(())
}

/// Reads a whole zip entry. The declared size comes from the archive header
/// and is only a capacity hint.
fn read_entry<R: Read>(entry: &mut R, declared: u64) -> std::io::Result<Vec<u8>> {
    let hint = usize::try_from(declared.min(MAX_ENTRY_SIZE_HINT)).unwrap_or(0);
    let mut bytes = Vec::with_capacity(hint);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn map_file(path: &Path) -> std::io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: The file is opened read-only and the map is dropped before any
    // caller returns; concurrent truncation is outside what we defend against.
    unsafe { Mmap::map(&file) }
}

fn modified_nanos(meta: &std::fs::Metadata) -> u64 {
    let nanos = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}
