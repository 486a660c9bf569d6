//! Scope enforcer: checks relayed operations against a session's grant.
//!
//! [`authorize`] is pure with respect to broker state. It runs before every
//! forward, including once at the start of each stream.

use std::path::{Component, Path, PathBuf};

use crate::broker::Session;
use crate::relay::envelope::Command;

/// Read file contents and directory listings.
pub const SCOPE_READ_FILES: &str = "read:files";
/// Create, modify, rename and delete files.
pub const SCOPE_WRITE_FILES: &str = "write:files";
/// Inspect open buffers, selections and cursor state.
pub const SCOPE_READ_EDITOR: &str = "read:editor";
/// Apply edits to open buffers.
pub const SCOPE_WRITE_EDITOR: &str = "write:editor";
/// Read compiler and linter diagnostics.
pub const SCOPE_READ_DIAGNOSTICS: &str = "read:diagnostics";
/// Run host commands and tasks.
pub const SCOPE_EXECUTE_COMMANDS: &str = "execute:commands";
/// Use the host's language model for completions.
pub const SCOPE_CHAT_COMPLETIONS: &str = "chat:completions";

/// Every scope an access request may ask for.
pub const SCOPE_CATALOG: &[&str] = &[
    SCOPE_READ_FILES,
    SCOPE_WRITE_FILES,
    SCOPE_READ_EDITOR,
    SCOPE_WRITE_EDITOR,
    SCOPE_READ_DIAGNOSTICS,
    SCOPE_EXECUTE_COMMANDS,
    SCOPE_CHAT_COMPLETIONS,
];

/// Whether `scope` is in [`SCOPE_CATALOG`].
pub fn is_known_scope(scope: &str) -> bool {
    SCOPE_CATALOG.contains(&scope)
}

struct ActionSpec {
    action: &'static str,
    scope: &'static str,
    required_paths: &'static [&'static str],
    optional_paths: &'static [&'static str],
}

const ACTION_CATALOG: &[ActionSpec] = &[
    ActionSpec {
        action: "read_file",
        scope: SCOPE_READ_FILES,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "list_directory",
        scope: SCOPE_READ_FILES,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "search_files",
        scope: SCOPE_READ_FILES,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "write_file",
        scope: SCOPE_WRITE_FILES,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "create_file",
        scope: SCOPE_WRITE_FILES,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "delete_file",
        scope: SCOPE_WRITE_FILES,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "rename_file",
        scope: SCOPE_WRITE_FILES,
        required_paths: &["path", "new_path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "get_open_buffers",
        scope: SCOPE_READ_EDITOR,
        required_paths: &[],
        optional_paths: &[],
    },
    ActionSpec {
        action: "get_selection",
        scope: SCOPE_READ_EDITOR,
        required_paths: &[],
        optional_paths: &[],
    },
    ActionSpec {
        action: "open_file",
        scope: SCOPE_READ_EDITOR,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "apply_edit",
        scope: SCOPE_WRITE_EDITOR,
        required_paths: &["path"],
        optional_paths: &[],
    },
    ActionSpec {
        action: "get_diagnostics",
        scope: SCOPE_READ_DIAGNOSTICS,
        required_paths: &[],
        optional_paths: &["path"],
    },
    ActionSpec {
        action: "run_command",
        scope: SCOPE_EXECUTE_COMMANDS,
        required_paths: &[],
        optional_paths: &["cwd"],
    },
    ActionSpec {
        action: "chat_completion",
        scope: SCOPE_CHAT_COMPLETIONS,
        required_paths: &[],
        optional_paths: &[],
    },
];

/// Why an operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Denied {
    /// The action is not in the catalog.
    #[error("unknown action: {0}")]
    UnknownAction(String),
    /// A required path argument is missing or not a string.
    #[error("action {action} requires path argument '{arg}'")]
    MissingPath {
        /// Action name.
        action: String,
        /// Argument name.
        arg: String,
    },
    /// The session was not granted the required scope.
    #[error("scope {0} not approved for this session")]
    ScopeNotApproved(String),
    /// Target paths must be absolute.
    #[error("path must be absolute: {0}")]
    RelativePath(String),
    /// The target path is outside every allowed root.
    #[error("path {0} is outside the allowed roots")]
    OutsideRoots(String),
}

/// An operation to authorize: one scope plus zero or more target paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Action name.
    pub action: String,
    /// Scope the action requires.
    pub scope: String,
    /// Filesystem targets.
    pub paths: Vec<PathBuf>,
}

impl Operation {
    /// Operation with no filesystem target.
    pub fn new(action: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            scope: scope.into(),
            paths: Vec::new(),
        }
    }

    /// Add a filesystem target.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Map a relayed command to its operation through the action catalog.
    ///
    /// # Errors
    ///
    /// [`Denied::UnknownAction`] for actions outside the catalog,
    /// [`Denied::MissingPath`] when a required path argument is absent.
    pub fn from_command(command: &Command) -> Result<Self, Denied> {
        let spec = ACTION_CATALOG
            .iter()
            .find(|spec| spec.action == command.action)
            .ok_or_else(|| Denied::UnknownAction(command.action.clone()))?;

        let mut op = Self::new(spec.action, spec.scope);
        for arg in spec.required_paths {
            let path = command.arg_str(arg).ok_or_else(|| Denied::MissingPath {
                action: spec.action.to_owned(),
                arg: (*arg).to_owned(),
            })?;
            op.paths.push(PathBuf::from(path));
        }
        for arg in spec.optional_paths {
            if let Some(path) = command.arg_str(arg) {
                op.paths.push(PathBuf::from(path));
            }
        }
        Ok(op)
    }
}

/// Check `op` against the session's approved scopes and allowed roots.
///
/// # Errors
///
/// Returns the first [`Denied`] reason found.
pub fn authorize(session: &Session, op: &Operation) -> Result<(), Denied> {
    if !session.has_scope(&op.scope) {
        return Err(Denied::ScopeNotApproved(op.scope.clone()));
    }
    for path in &op.paths {
        check_path(session, path)?;
    }
    Ok(())
}

fn check_path(session: &Session, path: &Path) -> Result<(), Denied> {
    if !path.is_absolute() {
        return Err(Denied::RelativePath(path.display().to_string()));
    }
    let target = resolve_path(path);
    let contained = session
        .allowed_roots
        .iter()
        .any(|root| target.starts_with(resolve_path(root)));
    if contained {
        Ok(())
    } else {
        Err(Denied::OutsideRoots(path.display().to_string()))
    }
}

/// Normalize a path by resolving `.` and `..` without filesystem access.
///
/// `..` never climbs above the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if matches!(components.last(), Some(Component::Normal(_))) {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve a path the way the OS would, one component at a time.
///
/// Each existing prefix is canonicalized before the next component is
/// applied, so `..` after a symlink climbs from the link's target. Components
/// past the last existing ancestor (e.g. a file about to be created) are
/// applied lexically.
pub fn resolve_path(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            other => {
                resolved.push(other);
                if let Ok(canonical) = std::fs::canonicalize(&resolved) {
                    resolved = canonical;
                }
            }
        }
    }
    resolved
}
