// SPDX-License-Identifier: MPL-2.0

use std::cmp::Ordering;
use std::fmt;

use crate::atom::ParseError;

/// Gentoo-style upstream version identifier: dot-separated numeric
/// components, an optional trailing single-letter bump on the last
/// component, and an optional `_alpha|_beta|_pre|_rc|_p<N>` suffix.
///
/// Revision (`~rev` in an [`crate::Atom`]) is modeled separately and is not
/// part of this type: it orders independently of the upstream version.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    numeric: Vec<u64>,
    letter: Option<char>,
    suffix: Suffix,
}

/// Delegates to [`Ord::cmp`] rather than deriving over `raw`/`numeric` —
/// `"1.2.0"` and `"1.2"` compare `Equal` (trailing zero components carry no
/// weight) and must also compare `Eq`, or this type breaks the `Ord`/`Eq`
/// consistency contract.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Suffix {
    kind: SuffixKind,
    number: Option<u64>,
}

/// Ordered `_alpha < _beta < _pre < _rc < (none) < _p` per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SuffixKind {
    Alpha,
    Beta,
    Pre,
    Rc,
    None,
    P,
}

impl Version {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        if input.is_empty() {
            return Err(ParseError::EmptyVersion);
        }

        let (body, suffix) = split_suffix(input)?;
        let (numeric, letter) = split_numeric_letter(body)?;

        Ok(Self {
            raw: input.to_string(),
            numeric,
            letter,
            suffix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_numeric(&self.numeric, &other.numeric)
            .then_with(|| self.suffix.kind.cmp(&other.suffix.kind))
            .then_with(|| self.suffix.number.cmp(&other.suffix.number))
            .then_with(|| self.letter.cmp(&other.letter))
    }
}

fn compare_numeric(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let lhs = a.get(i).copied().unwrap_or(0);
        let rhs = b.get(i).copied().unwrap_or(0);
        match lhs.cmp(&rhs) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Split off a trailing `_alpha<N>|_beta<N>|_pre<N>|_rc<N>|_p<N>` suffix.
fn split_suffix(input: &str) -> Result<(&str, Suffix), ParseError> {
    for (keyword, kind) in [
        ("_alpha", SuffixKind::Alpha),
        ("_beta", SuffixKind::Beta),
        ("_pre", SuffixKind::Pre),
        ("_rc", SuffixKind::Rc),
        ("_p", SuffixKind::P),
    ] {
        if let Some(idx) = input.rfind(keyword) {
            let body = &input[..idx];
            let digits = &input[idx + keyword.len()..];
            let number = if digits.is_empty() {
                None
            } else {
                Some(
                    digits
                        .parse::<u64>()
                        .map_err(|_| ParseError::InvalidVersion(input.to_string()))?,
                )
            };
            return Ok((body, Suffix { kind, number }));
        }
    }

    Ok((
        input,
        Suffix {
            kind: SuffixKind::None,
            number: None,
        },
    ))
}

/// Split dot-separated numeric components, permitting a single trailing
/// letter directly appended to the final component (e.g. `1.2c`).
fn split_numeric_letter(body: &str) -> Result<(Vec<u64>, Option<char>), ParseError> {
    if body.is_empty() {
        return Err(ParseError::EmptyVersion);
    }

    let mut letter = None;
    let mut trimmed = body;

    if let Some(last) = body.chars().last() {
        if last.is_ascii_lowercase() {
            letter = Some(last);
            trimmed = &body[..body.len() - 1];
        }
    }

    let numeric = trimmed
        .split('.')
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| ParseError::InvalidVersion(body.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if numeric.is_empty() {
        return Err(ParseError::InvalidVersion(body.to_string()));
    }

    Ok((numeric, letter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_numeric_components() {
        assert!(Version::parse("1.2").unwrap() < Version::parse("1.10").unwrap());
        assert!(Version::parse("1.2.0").unwrap() == Version::parse("1.2").unwrap());
    }

    #[test]
    fn orders_suffix_classes() {
        let alpha = Version::parse("1.0_alpha1").unwrap();
        let beta = Version::parse("1.0_beta1").unwrap();
        let pre = Version::parse("1.0_pre1").unwrap();
        let rc = Version::parse("1.0_rc1").unwrap();
        let none = Version::parse("1.0").unwrap();
        let p = Version::parse("1.0_p1").unwrap();

        assert!(alpha < beta);
        assert!(beta < pre);
        assert!(pre < rc);
        assert!(rc < none);
        assert!(none < p);
    }

    #[test]
    fn orders_trailing_letter_after_suffix() {
        assert!(Version::parse("1.0").unwrap() < Version::parse("1.0b").unwrap());
    }

    #[test]
    fn totality_and_antisymmetry() {
        let samples = ["1.0", "1.0_alpha1", "1.0_p1", "2.0", "1.0b", "1.0_rc3"];
        for a in samples {
            for b in samples {
                let va = Version::parse(a).unwrap();
                let vb = Version::parse(b).unwrap();
                assert_eq!(va.cmp(&vb), vb.cmp(&va).reverse());
            }
        }
    }
}
