//! Package identity used to key cached artifacts.
//!
//! An [`ArtifactIdentity`] is the (name, version) pair of a package archive.
//! Identities compare case-insensitively on the name and on the normalized
//! form of the version, so `Newtonsoft.Json 13.0` and `newtonsoft.json
//! 13.0.0` refer to the same artifact.

use std::fmt;
use std::hash::{Hash, Hasher};

use semver::Version;

/// Immutable (name, version) pair identifying a package artifact.
#[derive(Debug, Clone)]
pub struct ArtifactIdentity {
    name: String,
    version: String,
}

impl ArtifactIdentity {
    /// Create a new identity from a package name and version string.
    ///
    /// The values are stored as given; normalization happens on comparison
    /// and when building cache keys.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// The package name as provided by the caller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version string as provided by the caller.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the normalized version string.
    ///
    /// Normalization drops build metadata, strips leading zeros from numeric
    /// release parts, pads to at least three parts and drops a zero fourth
    /// part. Versions that are not numeric dotted releases are returned
    /// trimmed but otherwise untouched.
    ///
    /// # Examples
    ///
    /// ```
    /// use pkgfetch::ArtifactIdentity;
    ///
    /// assert_eq!(ArtifactIdentity::new("a", "1.0").normalized_version(), "1.0.0");
    /// assert_eq!(ArtifactIdentity::new("a", "01.2.3+sha.1").normalized_version(), "1.2.3");
    /// assert_eq!(ArtifactIdentity::new("a", "1.0.0.0-Beta").normalized_version(), "1.0.0-Beta");
    /// assert_eq!(ArtifactIdentity::new("a", "1.2.3.4").normalized_version(), "1.2.3.4");
    /// ```
    pub fn normalized_version(&self) -> String {
        normalize_version(&self.version)
    }
}

fn normalize_version(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_metadata = match trimmed.split_once('+') {
        Some((head, _)) => head,
        None => trimmed,
    };
    let (release, prerelease) = match without_metadata.split_once('-') {
        Some((release, pre)) => (release, Some(pre)),
        None => (without_metadata, None),
    };

    let parts: Option<Vec<u64>> = release.split('.').map(|p| p.parse().ok()).collect();
    let mut parts = match parts {
        Some(parts) if (1..=4).contains(&parts.len()) => parts,
        _ => return without_metadata.to_string(),
    };

    if parts.len() == 4 && parts[3] == 0 {
        parts.pop();
    }
    while parts.len() < 3 {
        parts.push(0);
    }

    let numeric = parts
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".");
    let candidate = match prerelease {
        Some(pre) => format!("{}-{}", numeric, pre),
        None => numeric,
    };

    // Three-part versions go through semver so prerelease labels are validated;
    // anything semver rejects (four parts, legacy labels) is kept as assembled.
    if parts.len() == 3 {
        if let Ok(version) = Version::parse(&candidate) {
            return version.to_string();
        }
    }
    candidate
}

impl PartialEq for ArtifactIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self
                .normalized_version()
                .eq_ignore_ascii_case(&other.normalized_version())
    }
}

impl Eq for ArtifactIdentity {}

impl Hash for ArtifactIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
        self.normalized_version().to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}
