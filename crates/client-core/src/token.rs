use std::path::PathBuf;

/// Environment variable consulted when no token is passed on the command line.
pub const TOKEN_ENV_VAR: &str = "INTERN_TOKEN";

/// INI sections of `~/.intern/intern.cfg` that may carry a `token` entry, in
/// lookup order.
const TOKEN_SECTIONS: [&str; 2] = ["Default", "Project Service"];

fn intern_config_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".intern").join("intern.cfg"))
}

/// Resolve the API token: explicit flag value, then `INTERN_TOKEN`, then the
/// shared intern configuration file.
pub fn resolve_api_token(explicit: Option<&str>) -> anyhow::Result<String> {
    if let Some(token) = explicit {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("provided API token is empty");
        }
        return Ok(token.to_string());
    }

    if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
        let token = token.trim().to_string();
        if !token.is_empty() {
            return Ok(token);
        }
    }

    let path = intern_config_path()?;
    let raw = std::fs::read_to_string(&path).map_err(|_| {
        anyhow::anyhow!(
            "API token not provided: pass --api-token, set {TOKEN_ENV_VAR}, or configure {}",
            path.display()
        )
    })?;

    ini_token(&raw)
        .ok_or_else(|| anyhow::anyhow!("could not load a token from {}", path.display()))
}

fn ini_token(raw: &str) -> Option<String> {
    for section in TOKEN_SECTIONS {
        if let Some(token) = ini_lookup(raw, section, "token") {
            return Some(token);
        }
    }
    None
}

fn ini_lookup(raw: &str, section: &str, key: &str) -> Option<String> {
    let mut in_section = false;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            in_section = header.trim() == section;
            continue;
        }
        if !in_section {
            continue;
        }
        let Some((name, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            continue;
        };
        if name.trim() == key {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
