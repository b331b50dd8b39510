// SPDX-License-Identifier: MPL-2.0

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

use crate::atom::{parse_atom, Atom, ParseError};

/// Version comparator prefix on a [`Dependency`] atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    /// Exact match. If the dependency atom carries a revision, the
    /// revision must match too; otherwise any revision of that version is
    /// accepted.
    Eq,
    /// `~`: same upstream version, any revision.
    SameVersion,
    Ge,
    Gt,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Eq => "=",
            Operator::SameVersion => "~",
            Operator::Ge => ">=",
            Operator::Gt => ">",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    /// `!`: soft blocker, resolvable by removing the blocking package first.
    Weak,
    /// `!!`: strong blocker, refuses the transaction outright.
    Strong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseConditional {
    pub flag: String,
    pub negated: bool,
}

/// A dependency atom: an [`Atom`] plus an optional comparator, blocker
/// marking and use-flag conditionals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub blocker: Option<Blocker>,
    pub operator: Option<Operator>,
    pub atom: Atom,
    pub uses: Vec<UseConditional>,
}

/// `||( a b c )`: satisfied if any inner dependency matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnyOf {
    Single(Dependency),
    Group(Vec<Dependency>),
}

impl AnyOf {
    /// Evaluate against a set of candidate atoms (e.g. everything matched
    /// by each inner dependency independently), returning true if at least
    /// one alternative is entirely satisfiable.
    pub fn is_satisfied_by(&self, is_satisfied: impl Fn(&Dependency) -> bool) -> bool {
        match self {
            AnyOf::Single(dep) => is_satisfied(dep),
            AnyOf::Group(deps) => deps.iter().any(is_satisfied),
        }
    }
}

impl Dependency {
    /// Parse a dependency string: `[!|!!][<|<=|=|~|>=|>]atom[use,use,...]`.
    pub fn parse(input: &str) -> Result<Self, DependencyParseError> {
        let mut rest = input;

        let blocker = if let Some(stripped) = rest.strip_prefix("!!") {
            rest = stripped;
            Some(Blocker::Strong)
        } else if let Some(stripped) = rest.strip_prefix('!') {
            rest = stripped;
            Some(Blocker::Weak)
        } else {
            None
        };

        let (operator, rest) = strip_operator(rest);

        let (atom_str, uses) = split_use_conditionals(rest)?;

        let atom = parse_atom(atom_str)?;

        if operator.is_some() && atom.version.is_none() {
            return Err(DependencyParseError::OperatorWithoutVersion(input.to_string()));
        }

        Ok(Dependency {
            blocker,
            operator,
            atom,
            uses,
        })
    }

    /// Does `candidate` satisfy this dependency's key, slot, tag and
    /// version constraints? Use-flag conditionals are evaluated by the
    /// caller (the solver), which holds the enabled-flags context; an
    /// unconditional dependency (no `uses`) always considers them
    /// satisfied here.
    pub fn matches(&self, candidate: &Atom) -> bool {
        if self.atom.key != candidate.key {
            return false;
        }

        if let Some(slot) = &self.atom.slot {
            if candidate.slot.as_deref() != Some(slot.as_str()) {
                return false;
            }
        }

        if let Some(tag) = &self.atom.tag {
            if candidate.tag.as_deref() != Some(tag.as_str()) {
                return false;
            }
        }

        match (self.operator, &self.atom.version) {
            (None, _) => true,
            (Some(op), Some(required)) => {
                let Some(candidate_version) = &candidate.version else {
                    return false;
                };

                let version_order = candidate_version.cmp(required);

                match op {
                    Operator::Lt => version_order == Ordering::Less,
                    Operator::Le => version_order != Ordering::Greater,
                    Operator::Ge => version_order != Ordering::Less,
                    Operator::Gt => version_order == Ordering::Greater,
                    Operator::SameVersion => version_order == Ordering::Equal,
                    Operator::Eq => {
                        if version_order != Ordering::Equal {
                            return false;
                        }
                        match self.atom.revision {
                            Some(rev) => candidate.revision.unwrap_or(0) == rev,
                            None => true,
                        }
                    }
                }
            }
            (Some(_), None) => unreachable!("parse rejects operator without version"),
        }
    }
}

fn strip_operator(input: &str) -> (Option<Operator>, &str) {
    for (prefix, op) in [
        (">=", Operator::Ge),
        ("<=", Operator::Le),
        ("=", Operator::Eq),
        ("~", Operator::SameVersion),
        (">", Operator::Gt),
        ("<", Operator::Lt),
    ] {
        if let Some(stripped) = input.strip_prefix(prefix) {
            return (Some(op), stripped);
        }
    }
    (None, input)
}

fn split_use_conditionals(input: &str) -> Result<(&str, Vec<UseConditional>), DependencyParseError> {
    let Some(open) = input.find('[') else {
        return Ok((input, Vec::new()));
    };

    if !input.ends_with(']') {
        return Err(DependencyParseError::UnterminatedUseList(input.to_string()));
    }

    let atom_str = &input[..open];
    let body = &input[open + 1..input.len() - 1];

    let uses = body
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|token| {
            if let Some(flag) = token.strip_prefix('-') {
                UseConditional {
                    flag: flag.to_string(),
                    negated: true,
                }
            } else {
                UseConditional {
                    flag: token.to_string(),
                    negated: false,
                }
            }
        })
        .collect();

    Ok((atom_str, uses))
}

#[derive(Debug, Error)]
pub enum DependencyParseError {
    #[error("atom parse error: {0}")]
    Atom(#[from] ParseError),
    #[error("comparator used without a version in: {0:?}")]
    OperatorWithoutVersion(String),
    #[error("unterminated use-flag list in: {0:?}")]
    UnterminatedUseList(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_operators_and_blockers() {
        let dep = Dependency::parse(">=sys/foo-1.2").unwrap();
        assert_eq!(dep.operator, Some(Operator::Ge));
        assert!(dep.blocker.is_none());

        let dep = Dependency::parse("!!sys/foo").unwrap();
        assert_eq!(dep.blocker, Some(Blocker::Strong));
        assert!(dep.operator.is_none());
    }

    #[test]
    fn matches_version_range() {
        let dep = Dependency::parse(">=sys/foo-1.2").unwrap();
        assert!(dep.matches(&parse_atom("sys/foo-1.3").unwrap()));
        assert!(!dep.matches(&parse_atom("sys/foo-1.1").unwrap()));
    }

    #[test]
    fn matches_slot_restriction() {
        let dep = Dependency::parse("sys/foo:2").unwrap();
        assert!(dep.matches(&parse_atom("sys/foo-1.0:2").unwrap()));
        assert!(!dep.matches(&parse_atom("sys/foo-1.0:3").unwrap()));
    }

    #[test]
    fn parses_use_conditionals() {
        let dep = Dependency::parse("sys/foo[ssl,-static]").unwrap();
        assert_eq!(dep.uses.len(), 2);
        assert!(!dep.uses[0].negated);
        assert!(dep.uses[1].negated);
    }

    #[test]
    fn any_of_satisfied_by_single_alternative() {
        let a = Dependency::parse("sys/foo").unwrap();
        let b = Dependency::parse("sys/bar").unwrap();
        let group = AnyOf::Group(vec![a.clone(), b.clone()]);
        assert!(group.is_satisfied_by(|d| d.atom.key.name == "bar"));
        assert!(!group.is_satisfied_by(|d| d.atom.key.name == "baz"));
    }
}
