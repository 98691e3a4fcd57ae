//! Path permission hooks consulted by checked handle operations.

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub group: String,
    pub groups: Vec<String>,
}

impl User {
    pub fn new(name: &str, group: &str) -> Self {
        User {
            name: name.to_string(),
            group: group.to_string(),
            groups: Vec::new(),
        }
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.group == group || self.groups.iter().any(|g| g == group)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermAction {
    MakeDir,
    Upload,
    Download,
    Delete,
    DeleteOwn,
    Rename,
    RenameOwn,
    /// Paths matched by a `privpath` rule are invisible to users the rule
    /// does not admit.
    PrivPath,
}

impl PermAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermAction::MakeDir => "makedir",
            PermAction::Upload => "upload",
            PermAction::Download => "download",
            PermAction::Delete => "delete",
            PermAction::DeleteOwn => "deleteown",
            PermAction::Rename => "rename",
            PermAction::RenameOwn => "renameown",
            PermAction::PrivPath => "privpath",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "makedir" => PermAction::MakeDir,
            "upload" => PermAction::Upload,
            "download" => PermAction::Download,
            "delete" => PermAction::Delete,
            "deleteown" => PermAction::DeleteOwn,
            "rename" => PermAction::Rename,
            "renameown" => PermAction::RenameOwn,
            "privpath" => PermAction::PrivPath,
            _ => return None,
        })
    }
}

impl fmt::Display for PermAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait VfsPermissions: Send + Sync {
    /// `true` if `user` may perform `action` inside directory `dir`.
    fn check_path_permission(&self, action: PermAction, user: &User, dir: &str) -> bool;

    /// `true` if `dir` must look nonexistent to `user`.
    fn is_hidden(&self, user: &User, dir: &str) -> bool;
}

/// Permits everything and hides nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl VfsPermissions for AllowAll {
    fn check_path_permission(&self, _action: PermAction, _user: &User, _dir: &str) -> bool {
        true
    }

    fn is_hidden(&self, _user: &User, _dir: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct PathRule {
    pattern: String,
    acl: Vec<String>,
}

impl PathRule {
    fn matches_path(&self, dir: &str) -> bool {
        glob_match(&self.pattern.to_lowercase(), &dir.to_lowercase())
    }

    /// ACL tokens: `*` anyone, `=group`, `user`, and a `!` prefix negates.
    /// The first matching token decides.
    fn admits(&self, user: &User) -> bool {
        for token in &self.acl {
            let (negate, body) = match token.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, token.as_str()),
            };
            let hit = if body == "*" {
                true
            } else if let Some(group) = body.strip_prefix('=') {
                user.is_member_of(group)
            } else {
                body == user.name
            };
            if hit {
                return !negate;
            }
        }
        false
    }
}

/// Glob rules per action, evaluated in insertion order. The first rule
/// whose pattern matches the directory decides.
#[derive(Debug, Default, Clone)]
pub struct PathPermissions {
    rules: HashMap<PermAction, Vec<PathRule>>,
}

impl PathPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, action: PermAction, pattern: &str, acl: &[&str]) {
        self.rules.entry(action).or_default().push(PathRule {
            pattern: pattern.to_string(),
            acl: acl.iter().map(|s| s.to_string()).collect(),
        });
    }

    /// Parses lines such as `privpath /staff/* =staff` or
    /// `delete /incoming/* !=guests *`. Blank lines and `#` comments are
    /// skipped; unknown directives are reported.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut perms = PathPermissions::new();
        for (no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(directive), Some(pattern)) = (parts.next(), parts.next()) else {
                return Err(format!("line {}: expected '<action> <path> <acl..>'", no + 1));
            };
            let action = PermAction::parse(directive)
                .ok_or_else(|| format!("line {}: unknown directive {directive}", no + 1))?;
            let acl: Vec<&str> = parts.collect();
            perms.add_rule(action, pattern, &acl);
        }
        Ok(perms)
    }

    fn first_match(&self, action: PermAction, dir: &str) -> Option<&PathRule> {
        self.rules
            .get(&action)?
            .iter()
            .find(|r| r.matches_path(dir))
    }
}

impl VfsPermissions for PathPermissions {
    fn check_path_permission(&self, action: PermAction, user: &User, dir: &str) -> bool {
        match self.first_match(action, dir) {
            Some(rule) => rule.admits(user),
            None => true,
        }
    }

    fn is_hidden(&self, user: &User, dir: &str) -> bool {
        match self.first_match(PermAction::PrivPath, dir) {
            Some(rule) => !rule.admits(user),
            None => false,
        }
    }
}

/// Minimal glob: `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
