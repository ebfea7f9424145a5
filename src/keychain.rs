//! Source registry credential resolution.
//!
//! Hosts are matched case-insensitively: exact entries first (declared
//! aliases collapse into the exact table at construction), then glob
//! patterns. Anything else resolves to anonymous access.

use std::collections::HashMap;

use regex::Regex;
use tracing::info;

use crate::config::RegistryCredential;

/// Credentials presented to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Anonymous,
    Basic { username: String, password: String },
    /// A pre-minted registry token, sent as-is as a bearer credential.
    Bearer { token: String },
}

struct WildcardAuth {
    pattern: Regex,
    auth: RegistryAuth,
}

/// Maps registry hosts to authenticators.
#[derive(Default)]
pub struct Keychain {
    exact: HashMap<String, RegistryAuth>,
    wildcards: Vec<WildcardAuth>,
}

impl Keychain {
    pub fn new(credentials: HashMap<String, RegistryAuth>) -> Self {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        for (registry, auth) in credentials {
            let trimmed = registry.trim().to_lowercase();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.contains(['*', '?', '[']) {
                match glob_to_regex(&trimmed) {
                    Some(pattern) => wildcards.push(WildcardAuth { pattern, auth }),
                    None => info!(pattern = trimmed, "ignoring invalid registry pattern"),
                }
                continue;
            }
            exact.insert(trimmed, auth);
        }
        Self { exact, wildcards }
    }

    /// Builds a keychain from configured credentials, applying the `*Env`
    /// environment indirections. Entries with no usable credential are
    /// skipped.
    pub fn from_credentials(credentials: &[RegistryCredential]) -> Self {
        let mut auths = HashMap::new();
        for cred in credentials {
            let registry = cred.registry.trim().to_lowercase();
            if registry.is_empty() {
                continue;
            }

            let username = env_override(&cred.username_env).unwrap_or_else(|| cred.username.trim().to_owned());
            let password = env_override(&cred.password_env).unwrap_or_else(|| cred.password.clone());
            let token = env_override(&cred.token_env).unwrap_or_else(|| cred.token.trim().to_owned());

            let auth = if !token.is_empty() {
                RegistryAuth::Bearer { token }
            } else if !username.is_empty() || !password.is_empty() {
                RegistryAuth::Basic { username, password }
            } else {
                continue;
            };

            auths.insert(registry.clone(), auth.clone());
            for alias in &cred.registry_aliases {
                let alias = alias.trim().to_lowercase();
                if !alias.is_empty() {
                    auths.insert(alias, auth.clone());
                }
            }
        }
        Self::new(auths)
    }

    pub fn resolve(&self, registry: &str) -> RegistryAuth {
        let host = registry.trim().to_lowercase();
        if let Some(auth) = self.exact.get(&host) {
            return auth.clone();
        }
        for wc in &self.wildcards {
            if wc.pattern.is_match(&host) {
                return wc.auth.clone();
            }
        }
        RegistryAuth::Anonymous
    }
}

fn env_override(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Translates a shell-style pattern (`*`, `?`, `[...]`) into an anchored
/// regex. `*` and `?` do not cross `/`, matching `path.Match` semantics.
pub(crate) fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') || chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' || inner == '^' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                if !closed {
                    return None;
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}
