//! Content-addressed artifact publishing.
//!
//! Deployments pin a `Digest`, never a tag. Tags are moved only by
//! `ArtifactPublisher::publish`; everything else reads them.

use crate::error::{KeelError, Result};
use crate::io;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// `sha256:<64 lowercase hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 64-character hex part.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }
}

impl FromStr for Digest {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("sha256:")
            .ok_or_else(|| KeelError::InvalidDigest(s.to_string()))?;
        let valid = hex_part.len() == 64
            && hex_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(KeelError::InvalidDigest(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for Digest {
    type Error = KeelError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ArtifactReference / BuildOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    pub registry: String,
    pub repository: String,
    pub digest: Digest,
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.registry, self.repository, self.digest)
    }
}

/// Output of the (external) build step.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub repository: String,
    pub tag: Option<String>,
    pub blob: Vec<u8>,
}

/// What a deploy request names as its artifact.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// Push these bytes, then pin their digest.
    Build(BuildOutput),
    /// Pin an already-published digest.
    Digest { repository: String, digest: Digest },
    /// Resolve a tag once, then pin the digest it points at.
    Tag { repository: String, tag: String },
}

impl ArtifactSource {
    pub fn repository(&self) -> &str {
        match self {
            ArtifactSource::Build(b) => &b.repository,
            ArtifactSource::Digest { repository, .. } | ArtifactSource::Tag { repository, .. } => {
                repository
            }
        }
    }
}

static TAG_RE: OnceLock<Regex> = OnceLock::new();

fn tag_re() -> &'static Regex {
    TAG_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").expect("static regex"))
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if !tag_re().is_match(tag) {
        return Err(KeelError::InvalidRequest(format!("invalid tag '{tag}'")));
    }
    Ok(())
}

/// Repositories are one or more `/`-separated names, e.g. `acme/shop`.
pub fn validate_repository(repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(KeelError::InvalidName(repository.to_string()));
    }
    for segment in repository.split('/') {
        crate::paths::validate_name(segment)
            .map_err(|_| KeelError::InvalidName(repository.to_string()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Opaque content-addressable store. Implementations must make `push`
/// idempotent for identical bytes.
pub trait Registry: Send + Sync {
    fn name(&self) -> &str;
    fn push(&self, blob: &[u8]) -> Result<Digest>;
    fn pull(&self, digest: &Digest) -> Result<Vec<u8>>;
    fn contains(&self, digest: &Digest) -> Result<bool>;
    fn tag(&self, repository: &str, tag: &str, digest: &Digest) -> Result<()>;
    fn resolve_tag(&self, repository: &str, tag: &str) -> Result<Option<Digest>>;
}

/// Registry on the local filesystem:
///   blobs/sha256/<hex>
///   tags/<repository>/<tag>   (file content is the digest)
pub struct FsRegistry {
    name: String,
    root: PathBuf,
}

fn io_to_registry(e: std::io::Error) -> KeelError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => KeelError::PublishRejected(e.to_string()),
        _ => KeelError::RegistryUnreachable(e.to_string()),
    }
}

fn keel_to_registry(e: KeelError) -> KeelError {
    match e {
        KeelError::Io(io) => io_to_registry(io),
        other => other,
    }
}

impl FsRegistry {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    fn tag_path(&self, repository: &str, tag: &str) -> PathBuf {
        self.root.join("tags").join(repository).join(tag)
    }
}

impl Registry for FsRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, blob: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(blob);
        let path = self.blob_path(&digest);
        if path.exists() {
            let existing = std::fs::read(&path).map_err(io_to_registry)?;
            if existing != blob {
                return Err(KeelError::PublishConflict {
                    digest: digest.to_string(),
                });
            }
            return Ok(digest);
        }
        io::atomic_write(&path, blob).map_err(keel_to_registry)?;
        Ok(digest)
    }

    fn pull(&self, digest: &Digest) -> Result<Vec<u8>> {
        let bytes = match std::fs::read(self.blob_path(digest)) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeelError::ArtifactNotFound(digest.to_string()))
            }
            Err(e) => return Err(io_to_registry(e)),
        };
        if Digest::of_bytes(&bytes) != *digest {
            return Err(KeelError::PublishConflict {
                digest: digest.to_string(),
            });
        }
        Ok(bytes)
    }

    fn contains(&self, digest: &Digest) -> Result<bool> {
        if !self.root.exists() {
            return Err(KeelError::RegistryUnreachable(format!(
                "{} does not exist",
                self.root.display()
            )));
        }
        Ok(self.blob_path(digest).exists())
    }

    fn tag(&self, repository: &str, tag: &str, digest: &Digest) -> Result<()> {
        validate_repository(repository)?;
        validate_tag(tag)?;
        io::atomic_write(&self.tag_path(repository, tag), digest.as_str().as_bytes())
            .map_err(keel_to_registry)
    }

    fn resolve_tag(&self, repository: &str, tag: &str) -> Result<Option<Digest>> {
        validate_repository(repository)?;
        validate_tag(tag)?;
        match std::fs::read_to_string(self.tag_path(repository, tag)) {
            Ok(s) => Ok(Some(s.trim().parse()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_to_registry(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// ArtifactPublisher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ArtifactPublisher {
    registry: Arc<dyn Registry>,
}

impl ArtifactPublisher {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Push the build output and move its tag. Same bytes, same digest.
    pub fn publish(&self, build: &BuildOutput) -> Result<ArtifactReference> {
        self.publish_unless(build, &AtomicBool::new(false))
    }

    /// Like [`publish`](Self::publish), but leaves the tag alone once
    /// `cancelled` is set. The blob may already be pushed by then; an
    /// orphan blob is harmless, a moved tag is not.
    pub fn publish_unless(
        &self,
        build: &BuildOutput,
        cancelled: &AtomicBool,
    ) -> Result<ArtifactReference> {
        validate_repository(&build.repository)?;
        if let Some(tag) = &build.tag {
            validate_tag(tag)?;
        }
        let local = Digest::of_bytes(&build.blob);
        let pushed = self.registry.push(&build.blob)?;
        if pushed != local {
            return Err(KeelError::PublishConflict {
                digest: local.to_string(),
            });
        }
        if let Some(tag) = &build.tag {
            if cancelled.load(Ordering::SeqCst) {
                warn!(repository = %build.repository, digest = %pushed, tag = %tag, "publish cancelled, tag not moved");
                return Err(KeelError::RegistryUnreachable(format!(
                    "publish cancelled before tagging {}:{tag}",
                    build.repository
                )));
            }
            self.registry.tag(&build.repository, tag, &pushed)?;
        }
        info!(repository = %build.repository, digest = %pushed, "artifact published");
        Ok(ArtifactReference {
            registry: self.registry.name().to_string(),
            repository: build.repository.clone(),
            digest: pushed,
        })
    }

    /// Pin an existing digest after checking the registry holds it.
    pub fn pin(&self, repository: &str, digest: &Digest) -> Result<ArtifactReference> {
        validate_repository(repository)?;
        if !self.registry.contains(digest)? {
            return Err(KeelError::ArtifactNotFound(digest.to_string()));
        }
        Ok(ArtifactReference {
            registry: self.registry.name().to_string(),
            repository: repository.to_string(),
            digest: digest.clone(),
        })
    }

    pub fn publish_source(&self, source: &ArtifactSource) -> Result<ArtifactReference> {
        self.publish_source_unless(source, &AtomicBool::new(false))
    }

    pub fn publish_source_unless(
        &self,
        source: &ArtifactSource,
        cancelled: &AtomicBool,
    ) -> Result<ArtifactReference> {
        match source {
            ArtifactSource::Build(build) => self.publish_unless(build, cancelled),
            ArtifactSource::Digest { repository, digest } => self.pin(repository, digest),
            ArtifactSource::Tag { repository, tag } => {
                let digest = self
                    .registry
                    .resolve_tag(repository, tag)?
                    .ok_or_else(|| KeelError::ArtifactNotFound(format!("{repository}:{tag}")))?;
                self.pin(repository, &digest)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn publisher(dir: &TempDir) -> ArtifactPublisher {
        ArtifactPublisher::new(Arc::new(FsRegistry::new("local", dir.path())))
    }

    fn build(blob: &[u8], tag: Option<&str>) -> BuildOutput {
        BuildOutput {
            repository: "acme/shop".into(),
            tag: tag.map(String::from),
            blob: blob.to_vec(),
        }
    }

    #[test]
    fn digest_validation() {
        let d = Digest::of_bytes(b"hello");
        assert_eq!(
            d.as_str(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(d.as_str().parse::<Digest>().is_ok());
        assert!("sha256:ABC".parse::<Digest>().is_err());
        assert!(format!("md5:{}", d.hex()).parse::<Digest>().is_err());
        assert!(d.as_str().to_uppercase().parse::<Digest>().is_err());
    }

    #[test]
    fn publish_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let p = publisher(&dir);
        let a = p.publish(&build(b"v1", Some("latest"))).unwrap();
        let b = p.publish(&build(b"v1", Some("latest"))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest, Digest::of_bytes(b"v1"));
    }

    #[test]
    fn publish_moves_tag_to_newest_digest() {
        let dir = TempDir::new().unwrap();
        let p = publisher(&dir);
        p.publish(&build(b"v1", Some("latest"))).unwrap();
        let v2 = p.publish(&build(b"v2", Some("latest"))).unwrap();
        let resolved = p
            .registry()
            .resolve_tag("acme/shop", "latest")
            .unwrap()
            .unwrap();
        assert_eq!(resolved, v2.digest);
    }

    #[test]
    fn corrupted_blob_is_conflict() {
        let dir = TempDir::new().unwrap();
        let reg = FsRegistry::new("local", dir.path());
        let digest = reg.push(b"v1").unwrap();
        std::fs::write(reg.blob_path(&digest), b"tampered").unwrap();
        assert!(matches!(
            reg.push(b"v1"),
            Err(KeelError::PublishConflict { .. })
        ));
        assert!(matches!(
            reg.pull(&digest),
            Err(KeelError::PublishConflict { .. })
        ));
    }

    #[test]
    fn pin_requires_presence() {
        let dir = TempDir::new().unwrap();
        let p = publisher(&dir);
        let published = p.publish(&build(b"v1", None)).unwrap();
        assert_eq!(p.pin("acme/shop", &published.digest).unwrap(), published);
        let missing = Digest::of_bytes(b"never pushed");
        assert!(matches!(
            p.pin("acme/shop", &missing),
            Err(KeelError::ArtifactNotFound(_))
        ));
    }

    /// Sets the flag as soon as the blob lands, like a caller giving up
    /// while the push was in flight.
    struct GiveUpAfterPush {
        inner: FsRegistry,
        cancelled: Arc<AtomicBool>,
    }

    impl Registry for GiveUpAfterPush {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn push(&self, blob: &[u8]) -> Result<Digest> {
            let d = self.inner.push(blob)?;
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(d)
        }
        fn contains(&self, digest: &Digest) -> Result<bool> {
            self.inner.contains(digest)
        }
        fn pull(&self, digest: &Digest) -> Result<Vec<u8>> {
            self.inner.pull(digest)
        }
        fn tag(&self, repository: &str, tag: &str, digest: &Digest) -> Result<()> {
            self.inner.tag(repository, tag, digest)
        }
        fn resolve_tag(&self, repository: &str, tag: &str) -> Result<Option<Digest>> {
            self.inner.resolve_tag(repository, tag)
        }
    }

    #[test]
    fn cancelled_publish_leaves_tag_in_place() {
        let dir = TempDir::new().unwrap();
        let v1 = publisher(&dir).publish(&build(b"v1", Some("latest"))).unwrap();

        let cancelled = Arc::new(AtomicBool::new(false));
        let p = ArtifactPublisher::new(Arc::new(GiveUpAfterPush {
            inner: FsRegistry::new("local", dir.path()),
            cancelled: Arc::clone(&cancelled),
        }));
        let err = p
            .publish_source_unless(&ArtifactSource::Build(build(b"v2", Some("latest"))), &cancelled)
            .unwrap_err();
        assert!(matches!(err, KeelError::RegistryUnreachable(_)));
        let tagged = p.registry().resolve_tag("acme/shop", "latest").unwrap();
        assert_eq!(tagged, Some(v1.digest));
    }

    #[test]
    fn tag_source_pins_digest() {
        let dir = TempDir::new().unwrap();
        let p = publisher(&dir);
        let v1 = p.publish(&build(b"v1", Some("stable"))).unwrap();
        let pinned = p
            .publish_source(&ArtifactSource::Tag {
                repository: "acme/shop".into(),
                tag: "stable".into(),
            })
            .unwrap();
        assert_eq!(pinned.digest, v1.digest);
    }

    #[test]
    fn invalid_repository_rejected() {
        let dir = TempDir::new().unwrap();
        let mut b = build(b"v1", None);
        b.repository = "../escape".into();
        assert!(publisher(&dir).publish(&b).is_err());
    }

    #[test]
    fn missing_registry_root_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let reg = FsRegistry::new("local", dir.path().join("absent"));
        assert!(matches!(
            reg.contains(&Digest::of_bytes(b"x")),
            Err(KeelError::RegistryUnreachable(_))
        ));
    }
}
