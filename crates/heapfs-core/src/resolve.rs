//! Path resolution: walking a parsed path through the node graph.
//!
//! Resolution is an iterative loop over remaining components with an explicit
//! restart counter for symlinks. A symlink splices its target in place of the
//! remaining components and restarts from the root; exceeding the configured
//! restart bound fails deterministically with a too-many-links error rather
//! than relying on stack or memory exhaustion.
//!
//! Callers hold the filesystem metadata lock for the duration of a call; a
//! [`Resolution`] is constructed per call and never persisted.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::FsConfig;
use crate::node::{EntryKind, NodeTable};
use crate::types::{FsError, NodeId};

/// A parsed path: ordered component names plus an absolute flag.
///
/// `.` and `..` are kept as components and interpreted during resolution.
/// The engine has no working directory, so relative paths resolve against
/// the root exactly like absolute ones; the flag is preserved for adapters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPath {
    /// True if the path named the root explicitly.
    pub absolute: bool,
    /// Path components in order, never containing the separator.
    pub components: Vec<String>,
}

impl ParsedPath {
    /// Parses a path string under the given configuration. The configured
    /// root name (e.g. `/` or `C:\`) or a leading separator marks the path
    /// absolute; empty components from doubled separators are dropped.
    pub fn parse(path: &str, config: &FsConfig) -> ParsedPath {
        let (absolute, rest) = if let Some(rest) = path.strip_prefix(config.root.as_str()) {
            (true, rest)
        } else if path.starts_with(config.separator) {
            (true, path)
        } else {
            (false, path)
        };
        let components = rest
            .split(config.separator)
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .collect();
        ParsedPath {
            absolute,
            components,
        }
    }

    /// Builds a path from pre-split components.
    pub fn from_components(absolute: bool, components: Vec<String>) -> ParsedPath {
        ParsedPath {
            absolute,
            components,
        }
    }
}

/// One consumed resolution step: the directory a component was looked up in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionStep {
    /// Directory the lookup happened in.
    pub dir: NodeId,
    /// The component consumed.
    pub name: String,
}

/// How far resolution got.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The whole path resolved to an existing node.
    Found(NodeId),
    /// The final component is a symlink and following it was not requested.
    TrailingSymlink {
        /// Directory containing the symlink entry.
        parent: NodeId,
        /// Entry name of the symlink.
        name: String,
        /// Raw symlink target path.
        target: String,
    },
    /// The final component does not exist but its parent directory does,
    /// which is sufficient for create-if-absent semantics.
    MissingFinal {
        /// The valid parent directory.
        parent: NodeId,
        /// The missing final name.
        name: String,
    },
    /// An intermediate component is missing; no valid parent exists.
    NoParent {
        /// The first missing component.
        name: String,
    },
}

/// The result of walking a parsed path through the node graph.
#[derive(Clone, Debug)]
pub struct Resolution {
    /// Consumed steps, in order.
    pub steps: Vec<ResolutionStep>,
    /// Terminal state of the walk.
    pub outcome: Outcome,
}

impl Resolution {
    /// The fully resolved node, if there is one.
    pub fn node(&self) -> Option<NodeId> {
        match self.outcome {
            Outcome::Found(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the resolved node or a not-found error rendered with `path`.
    pub fn require_node(&self, path: &str) -> Result<NodeId, FsError> {
        self.node().ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// The `(parent, name)` pair to create the final component at, present
    /// for both a missing final component and an unfollowed trailing symlink's
    /// position being vacant-for-create purposes only when truly missing.
    pub fn create_target(&self) -> Option<(NodeId, &str)> {
        match &self.outcome {
            Outcome::MissingFinal { parent, name } => Some((*parent, name.as_str())),
            _ => None,
        }
    }

    /// True when the walk ended with a usable parent directory.
    pub fn has_valid_parent(&self) -> bool {
        !matches!(self.outcome, Outcome::NoParent { .. })
    }
}

/// Walks `path` from the root. `follow_trailing` controls whether a symlink
/// in final position is followed or reported as [`Outcome::TrailingSymlink`].
pub fn resolve(
    table: &NodeTable,
    config: &FsConfig,
    path: &ParsedPath,
    follow_trailing: bool,
) -> Result<Resolution, FsError> {
    let mut remaining: VecDeque<String> = path.components.iter().cloned().collect();
    let mut steps: Vec<ResolutionStep> = Vec::new();
    let mut current = NodeId::ROOT;
    let mut restarts: u32 = 0;

    loop {
        let Some(component) = remaining.pop_front() else {
            return Ok(Resolution {
                steps,
                outcome: Outcome::Found(current),
            });
        };

        match component.as_str() {
            "." => continue,
            ".." => {
                // Ascending above the root is a no-op, matching common OS
                // behavior.
                current = match steps.pop() {
                    Some(step) => step.dir,
                    None => NodeId::ROOT,
                };
                continue;
            }
            _ => {}
        }

        let entry = table.lookup(current, &component)?;
        match entry.map(|e| e.kind.clone()) {
            None => {
                let outcome = if remaining.is_empty() {
                    Outcome::MissingFinal {
                        parent: current,
                        name: component,
                    }
                } else {
                    Outcome::NoParent { name: component }
                };
                return Ok(Resolution { steps, outcome });
            }
            Some(EntryKind::Node(child)) => {
                steps.push(ResolutionStep {
                    dir: current,
                    name: component,
                });
                current = child;
            }
            Some(EntryKind::Symlink(target)) => {
                if remaining.is_empty() && !follow_trailing {
                    return Ok(Resolution {
                        steps,
                        outcome: Outcome::TrailingSymlink {
                            parent: current,
                            name: component,
                            target,
                        },
                    });
                }

                restarts += 1;
                if restarts > config.max_symlink_restarts {
                    return Err(FsError::TooManyLinks(component));
                }

                // Splice the target in place of the remaining components:
                // a relative target resolves against the path assembled so
                // far, an absolute one restarts from nothing. Either way all
                // resolved steps are cleared and the walk restarts at root.
                let target_path = ParsedPath::parse(&target, config);
                let mut spliced: VecDeque<String> = VecDeque::new();
                if !target_path.absolute {
                    spliced.extend(steps.iter().map(|s| s.name.clone()));
                }
                spliced.extend(target_path.components);
                spliced.extend(remaining.drain(..));

                remaining = spliced;
                steps.clear();
                current = NodeId::ROOT;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::ResourceLimiter;
    use std::sync::Arc;

    fn make_table(config: &FsConfig) -> NodeTable {
        NodeTable::new(config, Arc::new(ResourceLimiter::new(u64::MAX, u64::MAX)))
    }

    fn parse(path: &str, config: &FsConfig) -> ParsedPath {
        ParsedPath::parse(path, config)
    }

    #[test]
    fn test_parse_simple() {
        let config = FsConfig::posix();
        let p = parse("/home/user/file.txt", &config);
        assert!(p.absolute);
        assert_eq!(p.components, vec!["home", "user", "file.txt"]);
    }

    #[test]
    fn test_parse_root_and_doubled_separators() {
        let config = FsConfig::posix();
        assert!(parse("/", &config).components.is_empty());
        assert_eq!(
            parse("/a//b///c", &config).components,
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_parse_relative() {
        let config = FsConfig::posix();
        let p = parse("a/b", &config);
        assert!(!p.absolute);
        assert_eq!(p.components, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_windows_root() {
        let config = FsConfig::windows();
        let p = parse("C:\\dir\\file", &config);
        assert!(p.absolute);
        assert_eq!(p.components, vec!["dir", "file"]);
    }

    #[test]
    fn test_resolve_root() {
        let config = FsConfig::posix();
        let table = make_table(&config);
        let res = resolve(&table, &config, &parse("/", &config), true).unwrap();
        assert_eq!(res.node(), Some(NodeId::ROOT));
        assert!(res.steps.is_empty());
    }

    #[test]
    fn test_resolve_nested() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();
        let b = table.add_directory(a, "b", 0o755).unwrap();
        let f = table.add_file(b, "f", 0o644).unwrap();

        let res = resolve(&table, &config, &parse("/a/b/f", &config), true).unwrap();
        assert_eq!(res.node(), Some(f));
        assert_eq!(res.steps.len(), 3);
        assert_eq!(res.steps[0].dir, NodeId::ROOT);
        assert_eq!(res.steps[2].name, "f");
    }

    #[test]
    fn test_resolve_idempotent() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();
        let f = table.add_file(a, "f", 0o644).unwrap();

        let p = parse("/a/f", &config);
        let first = resolve(&table, &config, &p, true).unwrap().node();
        let second = resolve(&table, &config, &p, true).unwrap().node();
        assert_eq!(first, Some(f));
        assert_eq!(first, second);
    }

    #[test]
    fn test_dot_and_dotdot() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();
        let b = table.add_directory(a, "b", 0o755).unwrap();

        let res = resolve(&table, &config, &parse("/a/./b", &config), true).unwrap();
        assert_eq!(res.node(), Some(b));

        let res = resolve(&table, &config, &parse("/a/b/..", &config), true).unwrap();
        assert_eq!(res.node(), Some(a));

        let res = resolve(&table, &config, &parse("/a/b/../..", &config), true).unwrap();
        assert_eq!(res.node(), Some(NodeId::ROOT));
    }

    #[test]
    fn test_dotdot_above_root_is_noop() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();

        let res = resolve(&table, &config, &parse("/../../a", &config), true).unwrap();
        assert_eq!(res.node(), Some(a));
    }

    #[test]
    fn test_missing_final_yields_valid_parent() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();

        let res = resolve(&table, &config, &parse("/a/new.txt", &config), true).unwrap();
        assert!(res.node().is_none());
        assert!(res.has_valid_parent());
        assert_eq!(res.create_target(), Some((a, "new.txt")));
    }

    #[test]
    fn test_missing_intermediate_has_no_parent() {
        let config = FsConfig::posix();
        let table = make_table(&config);

        let res = resolve(&table, &config, &parse("/missing/file", &config), true).unwrap();
        assert!(!res.has_valid_parent());
        assert!(res.create_target().is_none());
        assert!(matches!(res.outcome, Outcome::NoParent { ref name } if name == "missing"));
    }

    #[test]
    fn test_descend_through_file_fails() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        table.add_file(NodeId::ROOT, "f", 0o644).unwrap();

        assert!(matches!(
            resolve(&table, &config, &parse("/f/child", &config), true),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_symlink_followed() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();
        let f = table.add_file(a, "f", 0o644).unwrap();
        table.add_symlink(NodeId::ROOT, "link", "/a").unwrap();

        let res = resolve(&table, &config, &parse("/link/f", &config), true).unwrap();
        assert_eq!(res.node(), Some(f));
    }

    #[test]
    fn test_trailing_symlink_no_follow() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();
        table.add_symlink(a, "link", "/elsewhere").unwrap();

        let res = resolve(&table, &config, &parse("/a/link", &config), false).unwrap();
        match res.outcome {
            Outcome::TrailingSymlink {
                parent,
                ref name,
                ref target,
            } => {
                assert_eq!(parent, a);
                assert_eq!(name, "link");
                assert_eq!(target, "/elsewhere");
            }
            ref other => panic!("expected TrailingSymlink, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_symlink_followed_by_default() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let f = table.add_file(NodeId::ROOT, "real", 0o644).unwrap();
        table.add_symlink(NodeId::ROOT, "link", "/real").unwrap();

        let res = resolve(&table, &config, &parse("/link", &config), true).unwrap();
        assert_eq!(res.node(), Some(f));
    }

    #[test]
    fn test_relative_symlink_target() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();
        let f = table.add_file(a, "f", 0o644).unwrap();
        // /a/link -> "f" resolves against /a.
        table.add_symlink(a, "link", "f").unwrap();

        let res = resolve(&table, &config, &parse("/a/link", &config), true).unwrap();
        assert_eq!(res.node(), Some(f));
    }

    #[test]
    fn test_symlink_chain_under_bound_resolves() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let f = table.add_file(NodeId::ROOT, "target", 0o644).unwrap();

        table.add_symlink(NodeId::ROOT, "link0", "/target").unwrap();
        for i in 1..20 {
            let target = format!("/link{}", i - 1);
            table
                .add_symlink(NodeId::ROOT, &format!("link{}", i), &target)
                .unwrap();
        }

        let res = resolve(&table, &config, &parse("/link19", &config), true).unwrap();
        assert_eq!(res.node(), Some(f));
    }

    #[test]
    fn test_self_referential_symlink_cycles() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        table.add_symlink(NodeId::ROOT, "a", "a").unwrap();

        assert!(matches!(
            resolve(&table, &config, &parse("/a", &config), true),
            Err(FsError::TooManyLinks(_))
        ));
    }

    #[test]
    fn test_two_link_cycle() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        table.add_symlink(NodeId::ROOT, "a", "/b").unwrap();
        table.add_symlink(NodeId::ROOT, "b", "/a").unwrap();

        assert!(matches!(
            resolve(&table, &config, &parse("/a", &config), true),
            Err(FsError::TooManyLinks(_))
        ));
    }

    #[test]
    fn test_chain_over_bound_fails() {
        let config = FsConfig::posix().max_symlink_restarts(5);
        let mut table = make_table(&config);
        table.add_file(NodeId::ROOT, "target", 0o644).unwrap();
        table.add_symlink(NodeId::ROOT, "link0", "/target").unwrap();
        for i in 1..10 {
            let target = format!("/link{}", i - 1);
            table
                .add_symlink(NodeId::ROOT, &format!("link{}", i), &target)
                .unwrap();
        }

        assert!(matches!(
            resolve(&table, &config, &parse("/link9", &config), true),
            Err(FsError::TooManyLinks(_))
        ));
    }

    #[test]
    fn test_relative_path_resolves_against_root() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        let a = table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();

        let res = resolve(&table, &config, &parse("a", &config), true).unwrap();
        assert_eq!(res.node(), Some(a));
    }

    #[test]
    fn test_resolution_has_no_side_effects() {
        let config = FsConfig::posix();
        let mut table = make_table(&config);
        table.add_directory(NodeId::ROOT, "a", 0o755).unwrap();

        let before: Vec<String> = table
            .list(NodeId::ROOT)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        let _ = resolve(&table, &config, &parse("/a/missing/deep", &config), true);
        let after: Vec<String> = table
            .list(NodeId::ROOT)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(before, after);
    }
}
