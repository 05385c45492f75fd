use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind of a package as published by the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Regular,
    Symlink,
    Tag,
    TagLink,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Kind::Regular => "regular",
            Kind::Symlink => "symlink",
            Kind::Tag => "tag",
            Kind::TagLink => "taglink",
        })
    }
}

/// A package entry, in the shape the hub serves it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FList {
    pub name: String,
    #[serde(default)]
    pub target: String,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(default)]
    pub updated: u64,
    /// Content hash of the package archive. Only set for regular packages.
    #[serde(rename = "md5", default)]
    pub hash: String,
    /// Repository the entry was listed from. Not part of the hub payload.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
}

impl FList {
    /// Version encoded in the package name, or in the target for symlinks.
    ///
    /// `zos:development:0.2.0.flist` and `zos:development:v0.2.0.flist`
    /// both give `0.2.0`.
    pub fn version(&self) -> Result<semver::Version, Error> {
        let name = match self.kind {
            Kind::Symlink => &self.target,
            _ => &self.name,
        };
        parse_version(name)
    }
}

fn parse_version(name: &str) -> Result<semver::Version, Error> {
    let last = name.rsplit(':').next().unwrap_or(name);
    let last = last.strip_prefix('v').unwrap_or(last);
    let last = last.strip_suffix(".flist").unwrap_or(last);

    semver::Version::parse(last).map_err(|source| Error::Version {
        name: name.to_string(),
        source,
    })
}

/// A package that holds actual content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regular {
    pub repository: String,
    pub name: String,
    pub updated: u64,
    pub hash: String,
}

/// Points to another package, in the same or another repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symlink {
    pub repository: String,
    pub name: String,
    pub updated: u64,
    pub target: String,
}

/// A named set of symlinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    pub repository: String,
    pub name: String,
    pub updated: u64,
}

/// Points to a tag, target has the shape `repo/tags/tag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagLink {
    pub repository: String,
    pub name: String,
    pub updated: u64,
    pub target: String,
}

impl Symlink {
    /// Repository and name this symlink points to. A bare name is relative
    /// to `source`, the repository the symlink lives in.
    pub fn destination(&self, source: &str) -> Result<(String, String), Error> {
        let parts: Vec<&str> = self.target.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((source.to_string(), name.to_string())),
            [repo, name] if !repo.is_empty() && !name.is_empty() => {
                Ok((repo.to_string(), name.to_string()))
            }
            _ => Err(Error::InvalidTarget {
                kind: Kind::Symlink,
                target: self.target.clone(),
            }),
        }
    }

    pub fn version(&self) -> Result<semver::Version, Error> {
        parse_version(&self.target)
    }
}

impl TagLink {
    /// Repository and tag name this link points to.
    pub fn destination(&self) -> Result<(String, String), Error> {
        let parts: Vec<&str> = self.target.split('/').collect();
        match parts.as_slice() {
            [repo, "tags", tag] if !repo.is_empty() && !tag.is_empty() => {
                Ok((repo.to_string(), tag.to_string()))
            }
            _ => Err(Error::InvalidTarget {
                kind: Kind::TagLink,
                target: self.target.clone(),
            }),
        }
    }
}

/// Typed view of an [FList].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Package {
    Regular(Regular),
    Symlink(Symlink),
    Tag(Tag),
    TagLink(TagLink),
}

impl Package {
    pub fn name(&self) -> &str {
        match self {
            Package::Regular(p) => &p.name,
            Package::Symlink(p) => &p.name,
            Package::Tag(p) => &p.name,
            Package::TagLink(p) => &p.name,
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Package::Regular(_) => Kind::Regular,
            Package::Symlink(_) => Kind::Symlink,
            Package::Tag(_) => Kind::Tag,
            Package::TagLink(_) => Kind::TagLink,
        }
    }
}

impl TryFrom<FList> for Package {
    type Error = Error;

    fn try_from(f: FList) -> Result<Self, Self::Error> {
        Ok(match f.kind {
            Kind::Regular => {
                if f.hash.is_empty() {
                    return Err(Error::InvalidPackage(format!(
                        "regular package {} has no content hash",
                        f.name
                    )));
                }
                Package::Regular(Regular {
                    repository: f.repository,
                    name: f.name,
                    updated: f.updated,
                    hash: f.hash,
                })
            }
            Kind::Symlink => Package::Symlink(Symlink {
                repository: f.repository,
                name: f.name,
                updated: f.updated,
                target: f.target,
            }),
            Kind::Tag => Package::Tag(Tag {
                repository: f.repository,
                name: f.name,
                updated: f.updated,
            }),
            Kind::TagLink => Package::TagLink(TagLink {
                repository: f.repository,
                name: f.name,
                updated: f.updated,
                target: f.target,
            }),
        })
    }
}

macro_rules! try_from_flist {
    ($variant:ident) => {
        impl TryFrom<FList> for $variant {
            type Error = Error;

            fn try_from(f: FList) -> Result<Self, Self::Error> {
                match Package::try_from(f)? {
                    Package::$variant(p) => Ok(p),
                    other => Err(Error::InvalidPackage(format!(
                        "{} is a {}, expected {}",
                        other.name(),
                        other.kind(),
                        Kind::$variant
                    ))),
                }
            }
        }
    };
}

try_from_flist!(Regular);
try_from_flist!(Symlink);
try_from_flist!(TagLink);

impl From<TagLink> for FList {
    fn from(t: TagLink) -> Self {
        FList {
            name: t.name,
            target: t.target,
            kind: Kind::TagLink,
            updated: t.updated,
            hash: String::new(),
            repository: t.repository,
        }
    }
}

impl From<Symlink> for FList {
    fn from(s: Symlink) -> Self {
        FList {
            name: s.name,
            target: s.target,
            kind: Kind::Symlink,
            updated: s.updated,
            hash: String::new(),
            repository: s.repository,
        }
    }
}
