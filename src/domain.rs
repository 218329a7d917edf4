//! Domain derivation and git-aware server naming

/// Branches that keep the plain base name
const MAIN_BRANCHES: &[&str] = &["main", "master", "develop"];

/// Separator between the base name and the branch in worktree server names
const BRANCH_SEPARATOR: &str = "--";

/// Domain for a server without a variant.
///
/// Worktree servers named `base--branch` are split into `base.branch.<tld>`;
/// every other name is used verbatim.
pub fn server_domain(name: &str, is_worktree: bool, tld: &str) -> String {
    if is_worktree {
        if let Some((base, branch)) = name.split_once(BRANCH_SEPARATOR) {
            return format!("{}.{}.{}", base, branch, tld);
        }
    }
    format!("{}.{}", name, tld)
}

/// Domain for a server variant: the variant label goes directly before the suffix
pub fn variant_domain(name: &str, is_worktree: bool, variant: Option<&str>, tld: &str) -> String {
    match variant {
        Some(value) => {
            let base = server_domain(name, is_worktree, tld);
            let stem = base
                .strip_suffix(tld)
                .and_then(|s| s.strip_suffix('.'))
                .unwrap_or(&base);
            format!("{}.{}.{}", stem, value, tld)
        }
        None => server_domain(name, is_worktree, tld),
    }
}

/// Server name for a checkout: `base` on main branches, `base--branch` otherwise
pub fn server_name_from_git(base: &str, branch: Option<&str>) -> String {
    let Some(branch) = branch else {
        return base.to_string();
    };
    if MAIN_BRANCHES.contains(&branch) {
        return base.to_string();
    }

    let safe: String = branch
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    format!("{}{}{}", base, BRANCH_SEPARATOR, safe)
}
