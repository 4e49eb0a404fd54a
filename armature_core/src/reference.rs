//! Resolved references.

use serde::Serialize;
use std::fmt;

/// How a reference name relates to the content it resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    /// The name is the content identity itself, e.g. a full commit id.
    Identity,
    /// The name always resolves to the same identity once observed, e.g. a tag.
    Immutable,
    /// The name may move between identities, e.g. a branch head.
    Mutable,
}

impl RefKind {
    /// All kinds, in the order their cache directories are laid out.
    pub const ALL: [RefKind; 3] = [RefKind::Mutable, RefKind::Immutable, RefKind::Identity];

    /// Directory name under `ref/`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::Identity => "identity",
            RefKind::Immutable => "immutable",
            RefKind::Mutable => "mutable",
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference string resolved against a repository at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    /// Cache key of the owning repository.
    pub repo_id: String,
    /// URL of the owning repository, for messages.
    pub repo_url: String,
    pub kind: RefKind,
    /// Fully qualified name, e.g. `refs/heads/master`.
    pub canonical_name: String,
    /// Content identity: a commit id or a release version.
    pub identity: String,
    /// What sort of thing this is for humans: "branch", "tag", "revision", "ref", "version".
    pub human_type: &'static str,
    pub human_name: String,
}

impl Reference {
    pub fn new(
        repo_id: impl Into<String>,
        repo_url: impl Into<String>,
        kind: RefKind,
        canonical_name: impl Into<String>,
        identity: impl Into<String>,
        human_type: &'static str,
        human_name: impl Into<String>,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            repo_url: repo_url.into(),
            kind,
            canonical_name: canonical_name.into(),
            identity: identity.into(),
            human_type,
            human_name: human_name.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\"", self.human_type, self.human_name)
    }
}
