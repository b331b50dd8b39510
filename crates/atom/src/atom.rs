// SPDX-License-Identifier: MPL-2.0

use std::fmt;

use thiserror::Error;

use crate::version::Version;
use crate::Key;

/// `category/name[-version][:slot][#tag][~rev]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    pub key: Key,
    pub version: Option<Version>,
    pub revision: Option<u64>,
    pub slot: Option<String>,
    pub tag: Option<String>,
}

impl Atom {
    /// Strip slot/tag/revision, keeping only `category/name[-version]`.
    pub fn without_constraints(&self) -> Atom {
        Atom {
            key: self.key.clone(),
            version: self.version.clone(),
            revision: None,
            slot: None,
            tag: None,
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key.category, self.key.name)?;
        if let Some(version) = &self.version {
            write!(f, "-{version}")?;
        }
        if let Some(slot) = &self.slot {
            write!(f, ":{slot}")?;
        }
        if let Some(tag) = &self.tag {
            write!(f, "#{tag}")?;
        }
        if let Some(revision) = &self.revision {
            write!(f, "~{revision}")?;
        }
        Ok(())
    }
}

/// Parse `category/name[-version][:slot][#tag][~rev]` into an [`Atom`].
///
/// Comparison operator prefixes (`>=`, `~`, `!`, etc.) and `||(...)`
/// groupings are not part of a bare atom; see [`crate::Dependency::parse`]
/// for the full dependency-string grammar.
pub fn parse_atom(input: &str) -> Result<Atom, ParseError> {
    let mut rest = input;

    let revision = if let Some(idx) = rest.rfind('~') {
        let digits = &rest[idx + 1..];
        let revision = digits
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidRevision(digits.to_string()))?;
        rest = &rest[..idx];
        Some(revision)
    } else {
        None
    };

    let tag = if let Some(idx) = rest.rfind('#') {
        let tag = rest[idx + 1..].to_string();
        if tag.is_empty() {
            return Err(ParseError::EmptyTag);
        }
        rest = &rest[..idx];
        Some(tag)
    } else {
        None
    };

    let slot = if let Some(idx) = rest.rfind(':') {
        let slot = rest[idx + 1..].to_string();
        if slot.is_empty() {
            return Err(ParseError::EmptySlot);
        }
        rest = &rest[..idx];
        Some(slot)
    } else {
        None
    };

    let Some(slash) = rest.find('/') else {
        return Err(ParseError::MissingCategory(input.to_string()));
    };

    let category = &rest[..slash];
    let name_and_version = &rest[slash + 1..];

    if category.is_empty() {
        return Err(ParseError::MissingCategory(input.to_string()));
    }
    if name_and_version.is_empty() {
        return Err(ParseError::MissingName(input.to_string()));
    }

    let (name, version) = split_name_version(name_and_version)?;

    Ok(Atom {
        key: Key {
            category: category.to_string(),
            name: name.to_string(),
        },
        version,
        revision,
        slot,
        tag,
    })
}

/// Find the last `-<version>` split point where `<version>` begins with a
/// digit, distinguishing it from a hyphenated package name.
fn split_name_version(input: &str) -> Result<(&str, Option<Version>), ParseError> {
    for (idx, _) in input.match_indices('-') {
        let candidate = &input[idx + 1..];
        if candidate.starts_with(|c: char| c.is_ascii_digit()) {
            let name = &input[..idx];
            if name.is_empty() {
                continue;
            }
            let version = Version::parse(candidate)?;
            return Ok((name, Some(version)));
        }
    }

    Ok((input, None))
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing category in atom: {0:?}")]
    MissingCategory(String),
    #[error("missing package name in atom: {0:?}")]
    MissingName(String),
    #[error("empty slot restriction")]
    EmptySlot,
    #[error("empty tag restriction")]
    EmptyTag,
    #[error("invalid revision: {0:?}")]
    InvalidRevision(String),
    #[error("invalid version: {0:?}")]
    InvalidVersion(String),
    #[error("empty version")]
    EmptyVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_well_formed_atoms() {
        let samples = [
            "sys/foo",
            "sys/foo-1.0",
            "sys/foo-1.0:2",
            "sys/foo-1.0:2#abc123",
            "sys/foo-1.0:2#abc123~4",
            "app/some-hyphenated-name-2.3.4_rc1",
        ];

        for sample in samples {
            let atom = parse_atom(sample).expect("parses");
            assert_eq!(atom.to_string(), sample);
        }
    }

    #[test]
    fn rejects_missing_category() {
        assert!(parse_atom("foo").is_err());
    }

    #[test]
    fn keeps_hyphenated_name_without_version() {
        let atom = parse_atom("app/some-hyphenated-name").unwrap();
        assert_eq!(atom.key.name, "some-hyphenated-name");
        assert!(atom.version.is_none());
    }
}
